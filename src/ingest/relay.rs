// src/ingest/relay.rs
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// One GET through one relay. Swappable so tests can script responses.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn get_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError>;
}

/// reqwest-backed transport (rustls, gzip).
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .gzip(true)
            .build()
            .context("building relay http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RelayTransport for HttpTransport {
    async fn get_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let request = async {
            let resp = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| map_reqwest(e, timeout))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            resp.text().await.map_err(|e| map_reqwest(e, timeout))
        };
        // hard cap on top of reqwest's per-request timeout
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
    }
}

fn map_reqwest(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(timeout)
    } else if let Some(status) = e.status() {
        FetchError::Status(status.as_u16())
    } else {
        FetchError::Network(e.to_string())
    }
}

/// A relay URL template.
///
/// `{url}` is replaced by the percent-encoded upstream URL, `{raw}` by the
/// upstream URL as-is (so `"{raw}"` alone means a direct fetch). A template
/// without placeholders gets the encoded URL appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayEndpoint {
    template: String,
}

impl RelayEndpoint {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into().trim().to_string(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn url_for(&self, upstream: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(upstream.as_bytes()).collect();
        if self.template.contains("{url}") || self.template.contains("{raw}") {
            self.template
                .replace("{url}", &encoded)
                .replace("{raw}", upstream)
        } else {
            format!("{}{}", self.template, encoded)
        }
    }

    /// Host part for log fields; falls back to the template itself.
    pub fn label(&self) -> String {
        url::Url::parse(&self.template.replace("{url}", "").replace("{raw}", ""))
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.template.clone())
    }
}

pub fn default_relays() -> Vec<RelayEndpoint> {
    [
        "https://api.allorigins.win/raw?url={url}",
        "https://corsproxy.io/?url={url}",
        "https://api.codetabs.com/v1/proxy?quest={url}",
        "https://thingproxy.freeboard.io/fetch/{raw}",
    ]
    .into_iter()
    .map(RelayEndpoint::new)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UP: &str = "https://feeds.example.com/rss?a=1&b=2";

    #[test]
    fn encoded_placeholder() {
        let r = RelayEndpoint::new("https://relay.test/raw?url={url}");
        assert_eq!(
            r.url_for(UP),
            "https://relay.test/raw?url=https%3A%2F%2Ffeeds.example.com%2Frss%3Fa%3D1%26b%3D2"
        );
    }

    #[test]
    fn raw_placeholder_and_direct_fetch() {
        let r = RelayEndpoint::new("https://relay.test/fetch/{raw}");
        assert_eq!(r.url_for(UP), format!("https://relay.test/fetch/{UP}"));
        assert_eq!(RelayEndpoint::new("{raw}").url_for(UP), UP);
    }

    #[test]
    fn bare_template_gets_encoded_url_appended() {
        let r = RelayEndpoint::new(" https://relay.test/?q= ");
        assert!(r.url_for(UP).starts_with("https://relay.test/?q=https%3A%2F%2F"));
    }

    #[test]
    fn label_is_host() {
        assert_eq!(
            RelayEndpoint::new("https://relay.test/raw?url={url}").label(),
            "relay.test"
        );
        assert_eq!(RelayEndpoint::new("{raw}").label(), "{raw}");
    }

    #[test]
    fn relays_deserialize_from_plain_strings() {
        let v: Vec<RelayEndpoint> = serde_json::from_str(r#"["https://a/{url}", "{raw}"]"#).unwrap();
        assert_eq!(v[1].template(), "{raw}");
    }
}
