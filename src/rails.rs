use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

fn meta_tag() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid regex"))
}

fn stream_source_tag() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is)<turbo-cable-stream-source\b[^>]*>").expect("valid regex")
    })
}

fn form_tag() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)<form\b[^>]*>").expect("valid regex"))
}

fn attribute() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#)
            .expect("valid regex")
    })
}

pub fn turbo_stream_name(html: &str) -> Option<String> {
    let tag = stream_source_tag().find(html)?;
    attributes(tag.as_str()).remove("signed-stream-name")
}

pub fn form_action(html: &str) -> Option<String> {
    form_tag()
        .find_iter(html)
        .find_map(|tag| attributes(tag.as_str()).remove("action"))
        .filter(|action| !action.trim().is_empty())
}

pub fn cable_url(html: &str) -> Option<String> {
    read_meta(html, "action-cable-url", None)
}

pub fn csrf_token(html: &str) -> Option<String> {
    read_meta(html, "csrf-token", None)
}

pub fn csrf_param(html: &str) -> Option<String> {
    read_meta(html, "csrf-param", None)
}

/// Value of `attr` (default `content`) on the first `<meta name=...>` tag
/// with the given name.
pub fn read_meta(html: &str, name: &str, attr: Option<&str>) -> Option<String> {
    let attr = attr.unwrap_or("content").to_ascii_lowercase();
    meta_tag().find_iter(html).find_map(|tag| {
        let mut attrs = attributes(tag.as_str());
        if attrs.get("name").map(String::as_str) != Some(name) {
            return None;
        }
        attrs.remove(&attr)
    })
}

fn attributes(tag: &str) -> HashMap<String, String> {
    attribute()
        .captures_iter(tag)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4))?;
            Some((key, decode_entities(value.as_str())))
        })
        .fold(HashMap::new(), |mut attrs, (key, value)| {
            attrs.entry(key).or_insert(value);
            attrs
        })
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_owned();
    }
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
