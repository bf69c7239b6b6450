// tests/common/mod.rs
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use feed_relay::{EngineConfig, FetchError, RelayEndpoint, RelayTransport, SourceDescriptor};

#[derive(Clone)]
struct Route {
    delay: Duration,
    response: Result<String, FetchError>,
}

/// Scripted transport keyed by the exact requested URL. With the `{raw}`
/// relay from [`test_config`] that is the upstream feed URL.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    requested: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub completed: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ok(&self, url: &str, delay_ms: u64, body: impl Into<String>) {
        self.set(url, delay_ms, Ok(body.into()));
    }

    pub fn fail(&self, url: &str, delay_ms: u64, err: FetchError) {
        self.set(url, delay_ms, Err(err));
    }

    fn set(&self, url: &str, delay_ms: u64, response: Result<String, FetchError>) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                delay: Duration::from_millis(delay_ms),
                response,
            },
        );
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    async fn get_text(&self, url: &str, _timeout: Duration) -> Result<String, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        let route = self.routes.lock().unwrap().get(url).cloned();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let out = match route {
            Some(r) => {
                tokio::time::sleep(r.delay).await;
                r.response
            }
            None => Err(FetchError::Network("connection refused".into())),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        out
    }
}

/// Direct relay, one relay per wave, modest batches.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        relays: vec![RelayEndpoint::new("{raw}")],
        race_width: 1,
        request_timeout_ms: 2_000,
        source_timeout_ms: 3_000,
        wave_delay_ms: 0,
        max_concurrent: 4,
        priority_sources: 1,
        batch_size: 2,
        priority_ttl_secs: 30,
        full_ttl_secs: 90,
        ..EngineConfig::default()
    }
}

pub fn feed_url(i: usize) -> String {
    format!("https://feeds.test/s{i}.xml")
}

/// `S0..S{n-1}`, each at [`feed_url`].
pub fn sources(n: usize) -> Vec<SourceDescriptor> {
    (0..n)
        .map(|i| SourceDescriptor::new(&format!("S{i}"), &feed_url(i), None))
        .collect()
}

/// Minimal RSS 2.0 document; items are `(title, link, rfc2822 date)`.
pub fn rss<T: AsRef<str>, L: AsRef<str>>(items: &[(T, L, &str)]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>t</title>");
    for (title, link, date) in items {
        out.push_str(&format!(
            "<item><title>{}</title><link>{}</link><pubDate>{date}</pubDate></item>",
            title.as_ref(),
            link.as_ref()
        ));
    }
    out.push_str("</channel></rss>");
    out
}

pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(format!("tests/fixtures/{name}")).expect("fixture")
}
