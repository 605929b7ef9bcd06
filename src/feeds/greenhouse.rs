//! Greenhouse board payload mapping.
//!
//! Greenhouse is the reference shape: the uniform posting mirrors its field
//! names, so conversion is mostly a straight carry-over.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{RawMetadataEntry, UniformPosting};

#[derive(Debug, Deserialize)]
pub struct GreenhousePosting {
    pub id: Value,
    pub title: String,
    #[serde(default)]
    pub absolute_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub first_published: Option<String>,
    #[serde(default)]
    pub location: Option<GreenhouseLocation>,
    #[serde(default)]
    pub metadata: Vec<RawMetadataEntry>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GreenhouseLocation {
    #[serde(default)]
    pub name: Option<String>,
}

pub fn to_uniform(raw: &Value) -> Result<UniformPosting> {
    let posting: GreenhousePosting =
        serde_json::from_value(raw.clone()).context("malformed greenhouse posting")?;

    // Upstream ids are numeric but treated as opaque strings everywhere else.
    let upstream_id = match &posting.id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    Ok(UniformPosting {
        upstream_id,
        title: posting.title,
        canonical_url: posting.absolute_url.clone(),
        apply_url: posting.absolute_url,
        location_name: posting.location.and_then(|l| l.name),
        secondary_locations: Vec::new(),
        is_remote: false,
        updated_at: posting.updated_at,
        first_published: posting.first_published,
        metadata: posting.metadata,
        content_html: posting.content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_uniform_full_posting() {
        let raw = json!({
            "id": 4012345,
            "title": "Backend Engineer",
            "absolute_url": "https://boards.greenhouse.io/acme/jobs/4012345",
            "updated_at": "2024-05-01T12:00:00-04:00",
            "first_published": "2024-04-01T09:00:00-04:00",
            "location": {"name": "New York, NY"},
            "metadata": [{"name": "Team", "value": "Core", "value_type": "short_text"}],
            "content": "<p>Build things.</p>"
        });

        let posting = to_uniform(&raw).unwrap();
        assert_eq!(posting.upstream_id, "4012345");
        assert_eq!(posting.title, "Backend Engineer");
        assert_eq!(posting.location_name.as_deref(), Some("New York, NY"));
        assert_eq!(posting.updated_at.as_deref(), Some("2024-05-01T12:00:00-04:00"));
        assert_eq!(posting.metadata.len(), 1);
        assert!(!posting.is_remote);
    }

    #[test]
    fn test_to_uniform_minimal_posting() {
        let raw = json!({"id": 7, "title": "Intern"});
        let posting = to_uniform(&raw).unwrap();
        assert_eq!(posting.upstream_id, "7");
        assert!(posting.location_name.is_none());
        assert!(posting.updated_at.is_none());
    }

    #[test]
    fn test_to_uniform_rejects_missing_title() {
        let raw = json!({"id": 7});
        assert!(to_uniform(&raw).is_err());
    }
}
