// src/ingest/sanitize.rs
//! Pre-parse cleanup and shape checks for raw relay payloads.
//!
//! Real-world feeds regularly ship XML a strict reader refuses: bare `&` in
//! titles, stray control bytes, broken CDATA sections. These helpers make the
//! text readable enough for the parser and reject payloads that are clearly
//! not feeds (relay error pages, empty bodies).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::FetchError;

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";

/// Root markers that identify RSS 2.0, Atom and RSS 1.0 (RDF) documents.
const ROOT_MARKERS: [&str; 4] = ["<rss", "<feed", "<rdf:rdf", "<channel"];

/// How much of the payload is inspected for the root marker.
const SHAPE_SCAN_BYTES: usize = 64 * 1024;

static RE_ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z][A-Za-z0-9]{1,31});")
        .expect("entity regex")
});

/// Make a raw payload palatable for the XML reader.
///
/// - bare `&` (not starting a well-formed entity reference) becomes `&amp;`
/// - control characters other than tab/newline/carriage return are dropped
/// - a `]]>` outside a CDATA section is escaped, a nested `<![CDATA[` is
///   dropped, and an unterminated section is closed at the end of input
pub fn sanitize_feed_text(raw: &str) -> String {
    let text = raw.trim_start_matches('\u{FEFF}').trim_start();
    let mut out = String::with_capacity(text.len() + 64);
    let mut in_cdata = false;
    let mut i = 0;

    while i < text.len() {
        let rest = &text[i..];

        if rest.starts_with(CDATA_OPEN) {
            if !in_cdata {
                out.push_str(CDATA_OPEN);
                in_cdata = true;
            }
            i += CDATA_OPEN.len();
            continue;
        }
        if rest.starts_with(CDATA_CLOSE) {
            if in_cdata {
                out.push_str(CDATA_CLOSE);
                in_cdata = false;
            } else {
                out.push_str("]]&gt;");
            }
            i += CDATA_CLOSE.len();
            continue;
        }

        let Some(ch) = rest.chars().next() else {
            break;
        };
        i += ch.len_utf8();

        if ch.is_control() && !matches!(ch, '\t' | '\n' | '\r') {
            continue;
        }
        if ch == '&' && !in_cdata && !RE_ENTITY.is_match(rest) {
            out.push_str("&amp;");
            continue;
        }
        out.push(ch);
    }

    if in_cdata {
        out.push_str(CDATA_CLOSE);
    }
    out
}

/// Reject empty bodies and anything that does not carry a feed root marker
/// ahead of an HTML document marker.
pub fn validate_feed_shape(text: &str) -> Result<(), FetchError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(FetchError::Validation("empty response body".to_string()));
    }

    let mut end = trimmed.len().min(SHAPE_SCAN_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let head = trimmed[..end].to_ascii_lowercase();

    let Some(marker_at) = ROOT_MARKERS.iter().filter_map(|m| head.find(m)).min() else {
        return Err(FetchError::Validation("no feed root element".to_string()));
    };

    let html_at = ["<html", "<!doctype html"]
        .iter()
        .filter_map(|m| head.find(m))
        .min();
    if html_at.is_some_and(|h| h < marker_at) {
        return Err(FetchError::Validation("html document".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ampersands_are_escaped_but_entities_kept() {
        let s = "<title>Q&A: rates &amp; bonds &#38; &#x26; &nbsp;</title>";
        let out = sanitize_feed_text(s);
        assert_eq!(
            out,
            "<title>Q&amp;A: rates &amp; bonds &#38; &#x26; &nbsp;</title>"
        );
    }

    #[test]
    fn ampersand_at_end_of_input_is_escaped() {
        assert_eq!(sanitize_feed_text("AT&T &"), "AT&amp;T &amp;");
    }

    #[test]
    fn control_chars_are_stripped() {
        let s = "<title>a\u{0001}b\u{000B}c\td\ne</title>";
        assert_eq!(sanitize_feed_text(s), "<title>abc\td\ne</title>");
    }

    #[test]
    fn bom_and_leading_ws_are_removed() {
        let s = "\u{FEFF}  \n<?xml version=\"1.0\"?><rss/>";
        assert!(sanitize_feed_text(s).starts_with("<?xml"));
    }

    #[test]
    fn cdata_content_is_left_alone() {
        let s = "<description><![CDATA[<p>Fish & chips</p>]]></description>";
        assert_eq!(sanitize_feed_text(s), s);
    }

    #[test]
    fn stray_cdata_close_is_neutralized() {
        let s = "<title>a ]]> b</title>";
        assert_eq!(sanitize_feed_text(s), "<title>a ]]&gt; b</title>");
    }

    #[test]
    fn nested_cdata_open_is_dropped_and_unterminated_section_closed() {
        let s = "<d><![CDATA[one <![CDATA[two";
        assert_eq!(sanitize_feed_text(s), "<d><![CDATA[one two]]>");
    }

    #[test]
    fn shape_accepts_rss_atom_and_rdf() {
        assert!(validate_feed_shape("<?xml version=\"1.0\"?><rss version=\"2.0\">").is_ok());
        assert!(validate_feed_shape("<feed xmlns=\"http://www.w3.org/2005/Atom\">").is_ok());
        assert!(validate_feed_shape("<rdf:RDF xmlns:rdf=\"x\"><channel>").is_ok());
    }

    #[test]
    fn shape_rejects_empty_and_html() {
        assert!(matches!(
            validate_feed_shape("   "),
            Err(FetchError::Validation(_))
        ));
        assert!(validate_feed_shape("<!DOCTYPE html><html><body>blocked</body></html>").is_err());
        assert!(validate_feed_shape("<html><body><a href='/feed'>rss</a><rss").is_err());
        assert!(validate_feed_shape("{\"error\":\"rate limited\"}").is_err());
    }
}
