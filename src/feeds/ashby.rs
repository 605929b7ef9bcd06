//! AshbyHQ posting-api payload mapping.
//!
//! Ashby uses different field names from the uniform shape: `jobUrl` becomes
//! the canonical URL, `publishedAt` stands in for both freshness fields, the
//! location is a bare string, and department/team/employmentType are folded
//! into metadata entries.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{RawMetadataEntry, UniformPosting};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AshbyPosting {
    pub id: Value,
    pub title: String,
    #[serde(default)]
    pub job_url: Option<String>,
    #[serde(default)]
    pub apply_url: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub secondary_locations: Vec<AshbySecondaryLocation>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub description_html: Option<String>,
    #[serde(default)]
    pub is_remote: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AshbySecondaryLocation {
    #[serde(default)]
    pub location: Option<String>,
}

pub fn to_uniform(raw: &Value) -> Result<UniformPosting> {
    let posting: AshbyPosting =
        serde_json::from_value(raw.clone()).context("malformed ashby posting")?;

    let upstream_id = match &posting.id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut metadata = Vec::new();
    for (name, value) in [
        ("department", &posting.department),
        ("team", &posting.team),
        ("employment_type", &posting.employment_type),
    ] {
        if let Some(value) = value {
            metadata.push(RawMetadataEntry {
                name: name.to_string(),
                value: Value::String(value.clone()),
                value_type: Some("short_text".to_string()),
            });
        }
    }

    Ok(UniformPosting {
        upstream_id,
        title: posting.title,
        canonical_url: posting.job_url,
        apply_url: posting.apply_url,
        location_name: posting.location,
        secondary_locations: posting
            .secondary_locations
            .into_iter()
            .filter_map(|l| l.location)
            .collect(),
        is_remote: posting.is_remote,
        updated_at: posting.published_at.clone(),
        first_published: posting.published_at,
        metadata,
        content_html: posting.description_html,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_uniform_maps_field_names() {
        let raw = json!({
            "id": "ash-123",
            "title": "Platform Engineer",
            "jobUrl": "https://jobs.ashbyhq.com/acme/ash-123",
            "applyUrl": "https://jobs.ashbyhq.com/acme/ash-123/apply",
            "publishedAt": "2024-05-01T16:00:00Z",
            "location": "Remote - US",
            "secondaryLocations": [{"location": "Seattle, WA"}],
            "department": "Engineering",
            "team": "Platform",
            "employmentType": "FullTime",
            "descriptionHtml": "<p>Keep it running.</p>",
            "isRemote": true
        });

        let posting = to_uniform(&raw).unwrap();
        assert_eq!(posting.upstream_id, "ash-123");
        assert_eq!(
            posting.canonical_url.as_deref(),
            Some("https://jobs.ashbyhq.com/acme/ash-123")
        );
        assert_eq!(
            posting.apply_url.as_deref(),
            Some("https://jobs.ashbyhq.com/acme/ash-123/apply")
        );
        // publishedAt feeds both freshness fields.
        assert_eq!(posting.updated_at.as_deref(), Some("2024-05-01T16:00:00Z"));
        assert_eq!(posting.first_published.as_deref(), Some("2024-05-01T16:00:00Z"));
        assert!(posting.is_remote);
        assert_eq!(posting.secondary_locations, vec!["Seattle, WA".to_string()]);
        assert_eq!(posting.metadata.len(), 3);
        assert_eq!(posting.metadata[0].name, "department");
    }

    #[test]
    fn test_to_uniform_minimal_posting() {
        let raw = json!({"id": "x", "title": "Designer"});
        let posting = to_uniform(&raw).unwrap();
        assert!(posting.canonical_url.is_none());
        assert!(posting.metadata.is_empty());
        assert!(!posting.is_remote);
    }
}
