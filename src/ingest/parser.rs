// src/ingest/parser.rs
//! Tolerant RSS 2.0 / RSS 1.0 / Atom reader.
//!
//! Walks the document with the quick-xml event reader instead of a serde
//! model: real feeds mix dialects, nest media fields in groups and break
//! well-formedness often enough that a strict deserializer loses whole feeds
//! over one bad item.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use metrics::counter;
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::error::ParseError;
use crate::ingest::types::{record_id, ContentRecord};
use crate::ingest::{normalize_text, truncate_chars};

pub const DEFAULT_MAX_ITEMS: usize = 30;
pub const DEFAULT_MAX_TITLE_CHARS: usize = 200;
pub const DEFAULT_MAX_BODY_CHARS: usize = 400;

static RE_IMG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img[^>]+src\s*=\s*["']([^"']+)["']"#).expect("img regex")
});

/// Parses raw (already sanitized) feed text into capped `ContentRecord`s.
#[derive(Debug, Clone)]
pub struct FeedParser {
    pub max_items: usize,
    pub max_title_chars: usize,
    pub max_body_chars: usize,
}

impl Default for FeedParser {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            max_title_chars: DEFAULT_MAX_TITLE_CHARS,
            max_body_chars: DEFAULT_MAX_BODY_CHARS,
        }
    }
}

#[derive(Debug, Default)]
struct ItemDraft {
    title: String,
    link: String,
    guid: String,
    published: String,
    updated: String,
    description: String,
    content: String,
    author: String,
    media_image: Option<String>,
    thumbnail: Option<String>,
    enclosure_image: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Title,
    Link,
    Guid,
    Published,
    Updated,
    Description,
    Content,
    Author,
}

impl ItemDraft {
    fn slot(&mut self, field: Field) -> &mut String {
        match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Guid => &mut self.guid,
            Field::Published => &mut self.published,
            Field::Updated => &mut self.updated,
            Field::Description => &mut self.description,
            Field::Content => &mut self.content,
            Field::Author => &mut self.author,
        }
    }
}

impl FeedParser {
    pub fn new(max_items: usize, max_title_chars: usize, max_body_chars: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            max_title_chars: max_title_chars.max(1),
            max_body_chars: max_body_chars.max(1),
        }
    }

    /// Parse one payload. Items that are missing pieces are repaired or
    /// dropped individually; the call only fails when nothing usable comes out.
    /// On an XML error mid-document the records read so far are returned.
    pub fn parse(
        &self,
        text: &str,
        source_name: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<ContentRecord>, ParseError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);
        reader.config_mut().check_end_names = false;

        let mut out: Vec<ContentRecord> = Vec::new();
        let mut stack: Vec<String> = Vec::new();
        // stack depth right after the open item/entry element was pushed
        let mut item_level: Option<usize> = None;
        let mut draft = ItemDraft::default();
        // body element whose nested markup is being collected, with its stack depth
        let mut capture: Option<(Field, usize)> = None;
        let mut xml_error: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = element_name(&e);
                    if item_level.is_none() && is_item(&name) {
                        stack.push(name);
                        item_level = Some(stack.len());
                        draft = ItemDraft::default();
                        capture = None;
                        continue;
                    }
                    if item_level.is_some() {
                        if let Some((field, _)) = capture {
                            push_nested_img(&e, &name, draft.slot(field));
                        }
                        self.on_item_element(&e, &name, &mut draft);
                    }
                    stack.push(name);
                    if let Some(level) = item_level {
                        if capture.is_none() && stack.len() == level + 1 {
                            capture = body_field(&stack[level]).map(|f| (f, stack.len()));
                        }
                    }
                }
                Ok(Event::Empty(e)) => {
                    if item_level.is_some() {
                        let name = element_name(&e);
                        if let Some((field, _)) = capture {
                            push_nested_img(&e, &name, draft.slot(field));
                        }
                        self.on_item_element(&e, &name, &mut draft);
                    }
                }
                Ok(Event::Text(t)) => {
                    if let Some(level) = item_level {
                        if let Some(field) = text_field(&stack, level, capture) {
                            push_text(draft.slot(field), &String::from_utf8_lossy(&t));
                        }
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(level) = item_level {
                        if let Some(field) = text_field(&stack, level, capture) {
                            push_text(draft.slot(field), &String::from_utf8_lossy(&c));
                        }
                    }
                }
                Ok(Event::End(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                    match stack.iter().rposition(|n| *n == name) {
                        Some(pos) => stack.truncate(pos),
                        None => continue,
                    }
                    if capture.is_some_and(|(_, depth)| stack.len() < depth) {
                        capture = None;
                    }
                    if let Some(level) = item_level {
                        if stack.len() < level {
                            item_level = None;
                            let finished = std::mem::take(&mut draft);
                            if let Some(rec) = self.finish(finished, source_name, fetched_at) {
                                out.push(rec);
                                if out.len() >= self.max_items {
                                    break;
                                }
                            }
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    xml_error = Some(e.to_string());
                    break;
                }
            }
        }

        if out.is_empty() {
            return Err(match xml_error {
                Some(msg) => ParseError::Malformed(msg),
                None => ParseError::NoItems,
            });
        }
        if let Some(msg) = xml_error {
            tracing::debug!(
                target: "fetch",
                source = source_name,
                error = %msg,
                kept = out.len(),
                "feed xml error; keeping items read so far"
            );
        }

        counter!("feeds_records_parsed_total").increment(out.len() as u64);
        Ok(out)
    }

    /// Attribute-carrying elements inside an item (media, enclosures, Atom links).
    fn on_item_element(&self, e: &BytesStart<'_>, name: &str, draft: &mut ItemDraft) {
        match name {
            "media:content" => {
                let medium = attr(e, "medium");
                let mime = attr(e, "type");
                let image_medium = medium.as_deref().map(|m| m.eq_ignore_ascii_case("image"));
                let image_mime = mime.as_deref().map(is_image_mime);
                let is_image = match (image_medium, image_mime) {
                    (Some(m), _) if m => true,
                    (_, Some(t)) if t => true,
                    (None, None) => true,
                    _ => false,
                };
                if is_image && draft.media_image.is_none() {
                    draft.media_image = attr(e, "url").and_then(|u| absolute_image_url(&u));
                }
            }
            "media:thumbnail" => {
                if draft.thumbnail.is_none() {
                    draft.thumbnail = attr(e, "url").and_then(|u| absolute_image_url(&u));
                }
            }
            "enclosure" => {
                if draft.enclosure_image.is_none() && attr(e, "type").as_deref().is_some_and(is_image_mime) {
                    draft.enclosure_image = attr(e, "url").and_then(|u| absolute_image_url(&u));
                }
            }
            "link" => {
                let Some(href) = attr(e, "href") else {
                    return;
                };
                match attr(e, "rel").as_deref() {
                    None | Some("alternate") => {
                        if draft.link.trim().is_empty() {
                            draft.link = href;
                        }
                    }
                    Some("enclosure") => {
                        if draft.enclosure_image.is_none()
                            && attr(e, "type").as_deref().is_some_and(is_image_mime)
                        {
                            draft.enclosure_image = absolute_image_url(&href);
                        }
                    }
                    Some(_) => {}
                }
            }
            _ => {}
        }
    }

    fn finish(
        &self,
        d: ItemDraft,
        source_name: &str,
        fetched_at: DateTime<Utc>,
    ) -> Option<ContentRecord> {
        let title = truncate_chars(&normalize_text(&d.title), self.max_title_chars);
        let guid = html_escape::decode_html_entities(d.guid.trim()).to_string();

        let mut link = html_escape::decode_html_entities(d.link.trim()).to_string();
        // RSS guids default to permalinks
        if link.is_empty() && (guid.starts_with("http://") || guid.starts_with("https://")) {
            link = guid.clone();
        }

        if title.is_empty() && link.is_empty() {
            return None;
        }
        let title = if title.is_empty() {
            "Untitled".to_string()
        } else {
            title
        };

        let body_src = if d.description.trim().is_empty() {
            &d.content
        } else {
            &d.description
        };
        let body = truncate_chars(&normalize_text(body_src), self.max_body_chars);

        let image_url = d
            .media_image
            .or(d.thumbnail)
            .or(d.enclosure_image)
            .or_else(|| scan_img(&d.content))
            .or_else(|| scan_img(&d.description));

        let date_src = if d.published.trim().is_empty() {
            &d.updated
        } else {
            &d.published
        };
        let published_at = parse_feed_date(date_src).unwrap_or(fetched_at);

        let author = Some(normalize_text(&d.author)).filter(|a| !a.is_empty());
        let id = record_id(source_name, Some(guid.as_str()), &link, &title);

        Some(ContentRecord {
            id,
            title,
            link,
            published_at,
            body,
            image_url,
            author,
            source_name: source_name.to_string(),
        })
    }
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase()
}

fn is_item(name: &str) -> bool {
    name == "item" || name == "entry"
}

/// Which draft field the current text belongs to, if any. Only direct
/// children of the item count, plus Atom's `author/name`.
fn field_for(stack: &[String], item_level: usize) -> Option<Field> {
    let last = stack.last()?.as_str();
    if stack.len() == item_level + 1 {
        return match last {
            "title" => Some(Field::Title),
            "link" => Some(Field::Link),
            "guid" | "id" => Some(Field::Guid),
            "pubdate" | "published" | "dc:date" | "issued" => Some(Field::Published),
            "updated" | "modified" => Some(Field::Updated),
            "description" | "summary" => Some(Field::Description),
            "content:encoded" | "content" => Some(Field::Content),
            "author" | "dc:creator" => Some(Field::Author),
            _ => None,
        };
    }
    if stack.len() == item_level + 2 && stack[item_level] == "author" && last == "name" {
        return Some(Field::Author);
    }
    None
}

/// Item children whose nested markup (Atom xhtml content, unescaped HTML in
/// descriptions) is kept as body text.
fn body_field(name: &str) -> Option<Field> {
    match name {
        "description" | "summary" => Some(Field::Description),
        "content:encoded" | "content" => Some(Field::Content),
        _ => None,
    }
}

fn text_field(stack: &[String], item_level: usize, capture: Option<(Field, usize)>) -> Option<Field> {
    field_for(stack, item_level).or_else(|| {
        capture
            .filter(|(_, depth)| stack.len() > *depth)
            .map(|(field, _)| field)
    })
}

/// Re-serialize a nested `<img>` so the inline image scan can still find it.
fn push_nested_img(e: &BytesStart<'_>, name: &str, slot: &mut String) {
    if name != "img" && !name.ends_with(":img") {
        return;
    }
    if let Some(src) = attr(e, "src") {
        push_text(slot, &format!("<img src=\"{src}\">"));
    }
}

fn push_text(slot: &mut String, text: &str) {
    if !slot.is_empty() {
        slot.push(' ');
    }
    slot.push_str(text);
}

fn attr(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref().eq_ignore_ascii_case(key.as_bytes()))
        .map(|a| {
            let raw = String::from_utf8_lossy(a.value.as_ref()).to_string();
            html_escape::decode_html_entities(raw.trim()).to_string()
        })
        .filter(|v| !v.is_empty())
}

fn is_image_mime(mime: &str) -> bool {
    mime.trim().to_ascii_lowercase().starts_with("image/")
}

fn absolute_image_url(raw: &str) -> Option<String> {
    let u = raw.trim();
    if u.starts_with("http://") || u.starts_with("https://") {
        Some(u.to_string())
    } else if let Some(rest) = u.strip_prefix("//") {
        Some(format!("https://{rest}"))
    } else {
        None
    }
}

/// Last-resort image lookup in embedded markup; may hit tracking pixels.
fn scan_img(markup: &str) -> Option<String> {
    if markup.is_empty() {
        return None;
    }
    let decoded = html_escape::decode_html_entities(markup);
    RE_IMG
        .captures_iter(&decoded)
        .filter_map(|c| c.get(1))
        .find_map(|m| absolute_image_url(m.as_str()))
}

/// RFC 2822 first, then RFC 3339, then a handful of formats seen in the wild.
/// Zone-less timestamps are read as UTC.
pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc2822) {
        return DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), dt.nanosecond());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%d %H:%M:%S%.f%z",
        "%a, %d %b %Y %H:%M %z",
        "%d %b %Y %H:%M:%S %z",
    ] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}
