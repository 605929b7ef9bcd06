//! Posting content normalization.
//!
//! Pure transforms applied between filtering and the upsert engine: HTML
//! body cleanup and metadata shaping. The cleaned body is stored verbatim;
//! nothing downstream parses it again.

mod metadata;

pub use metadata::{normalize_metadata, JobMetadata, MetadataEntry, MetadataValue};

use std::sync::OnceLock;

use regex::Regex;

/// Character ceiling for stored HTML bodies.
pub const CONTENT_MAX_CHARS: usize = 120_000;

// Anchor hrefs pointing at these hosts are unwrapped to their inner text.
const TRACKER_DOMAINS: &[&str] = &[
    "grnh.se",
    "track.greenhouse.io",
    "click.appcast.io",
    "doubleclick.net",
    "googleadservices.com",
    "bit.ly",
    "t.co",
];

// Fixed entity decode set; anything outside it is left alone.
const ENTITIES: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&amp;", "&"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&rsquo;", "\u{2019}"),
    ("&lsquo;", "\u{2018}"),
    ("&rdquo;", "\u{201d}"),
    ("&ldquo;", "\u{201c}"),
    ("&mdash;", "\u{2014}"),
    ("&ndash;", "\u{2013}"),
];

fn img_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<img[^>]*>").unwrap())
}

fn anchor_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a[^>]*href\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a>"#).unwrap()
    })
}

/// Clean a raw upstream HTML body.
///
/// Decodes the fixed entity set, drops `<img>` tags, unwraps anchors whose
/// href targets a tracker domain (keeping the inner text), then caps the
/// result at [`CONTENT_MAX_CHARS`].
pub fn clean_content(html: &str) -> String {
    let mut text = html.to_string();

    for (entity, replacement) in ENTITIES {
        text = text.replace(entity, replacement);
    }

    text = img_pattern().replace_all(&text, "").to_string();

    text = anchor_pattern()
        .replace_all(&text, |caps: &regex::Captures| {
            let href = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if is_tracker_url(href) {
                caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string()
            } else {
                caps.get(0).unwrap().as_str().to_string()
            }
        })
        .to_string();

    cap_chars(&text, CONTENT_MAX_CHARS)
}

fn is_tracker_url(href: &str) -> bool {
    let host = url::Url::parse(href)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()));
    let Some(host) = host else { return false };
    TRACKER_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
}

fn cap_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_decode() {
        assert_eq!(clean_content("Fish &amp; Chips&nbsp;&lt;3"), "Fish & Chips <3");
    }

    #[test]
    fn test_unknown_entities_left_alone() {
        assert_eq!(clean_content("&euro;100"), "&euro;100");
    }

    #[test]
    fn test_img_tags_dropped() {
        let html = r#"<p>Before<img src="https://cdn.example.com/x.png" alt="x">After</p>"#;
        assert_eq!(clean_content(html), "<p>BeforeAfter</p>");
    }

    #[test]
    fn test_tracker_anchor_unwrapped() {
        let html = r#"<a href="https://grnh.se/abc123">Apply here</a>"#;
        assert_eq!(clean_content(html), "Apply here");
    }

    #[test]
    fn test_tracker_subdomain_unwrapped() {
        let html = r#"<a href="https://links.grnh.se/abc">Apply</a>"#;
        assert_eq!(clean_content(html), "Apply");
    }

    #[test]
    fn test_regular_anchor_retained() {
        let html = r#"<a href="https://example.com/about">About us</a>"#;
        assert_eq!(clean_content(html), html);
    }

    #[test]
    fn test_relative_href_retained() {
        let html = r#"<a href="/jobs/1">Job</a>"#;
        assert_eq!(clean_content(html), html);
    }

    #[test]
    fn test_content_capped() {
        let html = "x".repeat(CONTENT_MAX_CHARS + 500);
        assert_eq!(clean_content(&html).chars().count(), CONTENT_MAX_CHARS);
    }

    #[test]
    fn test_cap_respects_char_boundaries() {
        let html = "\u{00e9}".repeat(CONTENT_MAX_CHARS + 10);
        let cleaned = clean_content(&html);
        assert_eq!(cleaned.chars().count(), CONTENT_MAX_CHARS);
    }
}
