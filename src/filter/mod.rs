//! Recency and location filtering.
//!
//! Upstream location strings are free-form ("New York, NY; Remote - US"),
//! so the location rule is a union of independent signals rather than a
//! single field check. The location screen runs first and decides whether a
//! posting counts as found at all; the recency gate then splits found
//! postings into candidates, too-old, and no-timestamp.

mod policy;

pub use policy::{policy, FilterPolicy};

use std::collections::BTreeSet;

use chrono::DateTime;

use crate::feeds::{Source, UniformPosting};

/// Why a posting was kept or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    NoTimestamp,
    TooOld,
    WrongLocation,
    Keep,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::NoTimestamp => "no_timestamp",
            FilterReason::TooOld => "too_old",
            FilterReason::WrongLocation => "wrong_location",
            FilterReason::Keep => "keep",
        }
    }
}

/// Outcome of running one posting through the pipeline.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub reason: FilterReason,
    /// Extracted two-letter state codes; populated for location-passing
    /// postings.
    pub state_codes: BTreeSet<String>,
    /// Chosen freshness instant, when one parsed: (ISO string, epoch ms).
    pub effective: Option<(String, i64)>,
}

impl FilterOutcome {
    pub fn keep(&self) -> bool {
        self.reason == FilterReason::Keep
    }

    fn rejected(reason: FilterReason) -> Self {
        Self {
            reason,
            state_codes: BTreeSet::new(),
            effective: None,
        }
    }
}

/// Parse an upstream ISO-8601 timestamp into epoch milliseconds.
pub fn parse_iso_ms(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// The freshness instant the whole system compares on.
///
/// Greenhouse: the later of `updated_at` and `first_published`. Ashby:
/// `publishedAt` (carried in `updated_at` by the adapter). Returns the ISO
/// string alongside the parsed milliseconds.
pub fn effective_instant(source: Source, posting: &UniformPosting) -> Option<(String, i64)> {
    let updated = posting
        .updated_at
        .as_deref()
        .and_then(|s| parse_iso_ms(s).map(|ms| (s.to_string(), ms)));

    match source {
        Source::Greenhouse | Source::Unknown => {
            let published = posting
                .first_published
                .as_deref()
                .and_then(|s| parse_iso_ms(s).map(|ms| (s.to_string(), ms)));
            match (updated, published) {
                (Some(a), Some(b)) => Some(if a.1 >= b.1 { a } else { b }),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            }
        }
        Source::Ashby => updated,
    }
}

/// Run one posting through the location screen and the recency gate.
pub fn evaluate(
    source: Source,
    posting: &UniformPosting,
    now_ms: i64,
    window_ms: i64,
) -> FilterOutcome {
    let text = posting.location_text();
    let verdict = evaluate_location(policy(), &text, posting.is_remote);
    if !verdict.keep {
        return FilterOutcome::rejected(FilterReason::WrongLocation);
    }

    let effective = match effective_instant(source, posting) {
        Some(e) => e,
        None => {
            return FilterOutcome {
                reason: FilterReason::NoTimestamp,
                state_codes: verdict.state_codes,
                effective: None,
            }
        }
    };

    if effective.1 < now_ms - window_ms {
        return FilterOutcome {
            reason: FilterReason::TooOld,
            state_codes: verdict.state_codes,
            effective: Some(effective),
        };
    }

    FilterOutcome {
        reason: FilterReason::Keep,
        state_codes: verdict.state_codes,
        effective: Some(effective),
    }
}

/// Which location rule accepted a posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationRule {
    RemoteFlag,
    UsKeyword,
    City,
    StateCode,
    PermissiveRemote,
}

#[derive(Debug)]
pub struct LocationVerdict {
    pub keep: bool,
    pub matched: Option<LocationRule>,
    pub state_codes: BTreeSet<String>,
}

/// Apply the location policy to a free-form location string.
///
/// A posting is kept if any single rule matches. The exclusion list only
/// bears on the remote rules: a concrete US signal (keyword, city, state
/// code) wins even when an excluded country also appears in a multi-city
/// string, while a bare "remote" posting naming an excluded country is
/// dropped even when the upstream remote flag is set.
pub fn evaluate_location(
    policy: &FilterPolicy,
    location_text: &str,
    is_remote: bool,
) -> LocationVerdict {
    let lower = location_text.to_lowercase();
    let state_codes = extract_state_codes(policy, location_text);

    let us_remote_pin = policy
        .us_remote_phrases
        .iter()
        .any(|p| lower.contains(p));
    let has_excluded = !us_remote_pin
        && policy
            .excluded_remote_countries
            .iter()
            .any(|c| contains_bounded(&lower, c));

    let matched = if policy.us_keywords.iter().any(|k| lower.contains(k)) {
        Some(LocationRule::UsKeyword)
    } else if policy
        .major_cities
        .iter()
        .any(|c| contains_bounded(&lower, c))
    {
        Some(LocationRule::City)
    } else if !state_codes.is_empty() {
        Some(LocationRule::StateCode)
    } else if is_remote && !has_excluded {
        Some(LocationRule::RemoteFlag)
    } else if contains_bounded(&lower, "remote") && !has_excluded {
        Some(LocationRule::PermissiveRemote)
    } else {
        None
    };

    LocationVerdict {
        keep: matched.is_some(),
        matched,
        state_codes,
    }
}

/// Collect standalone two-letter US state codes from a location string.
///
/// Tokens must be uppercase in the original text so that English words such
/// as "in" never count as Indiana. "Washington, D.C." is recognized as DC.
pub fn extract_state_codes(policy: &FilterPolicy, location_text: &str) -> BTreeSet<String> {
    let mut codes = BTreeSet::new();

    for token in location_text.split(|c: char| !c.is_ascii_alphanumeric()) {
        if token.len() == 2
            && token.chars().all(|c| c.is_ascii_uppercase())
            && policy.is_state_code(token)
        {
            codes.insert(token.to_string());
        }
    }

    let lower = location_text.to_lowercase();
    if lower.contains("washington, d.c.") || lower.contains("washington dc") {
        codes.insert("DC".to_string());
    }

    codes
}

/// Substring match requiring non-alphanumeric (or string-edge) boundaries.
fn contains_bounded(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !haystack[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric());
        let after = abs + needle.len();
        let after_ok = after >= haystack.len()
            || !haystack[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::Source;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn posting(location: &str, is_remote: bool, updated_at: Option<&str>) -> UniformPosting {
        UniformPosting {
            upstream_id: "1".to_string(),
            title: "Engineer".to_string(),
            location_name: Some(location.to_string()),
            is_remote,
            updated_at: updated_at.map(|s| s.to_string()),
            first_published: updated_at.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    fn iso(ms: i64) -> String {
        chrono::DateTime::from_timestamp_millis(ms).unwrap().to_rfc3339()
    }

    #[test]
    fn test_recency_keeps_in_window() {
        let now = 1_700_000_000_000;
        let p = posting("New York, NY", false, Some(&iso(now - 10 * 60 * 1000)));
        let outcome = evaluate(Source::Greenhouse, &p, now, HOUR_MS);
        assert_eq!(outcome.reason, FilterReason::Keep);
        assert!(outcome.state_codes.contains("NY"));
    }

    #[test]
    fn test_recency_rejects_out_of_window() {
        let now = 1_700_000_000_000;
        let p = posting("New York, NY", false, Some(&iso(now - 90 * 60 * 1000)));
        let outcome = evaluate(Source::Greenhouse, &p, now, HOUR_MS);
        assert_eq!(outcome.reason, FilterReason::TooOld);
    }

    #[test]
    fn test_missing_timestamp() {
        let now = 1_700_000_000_000;
        let p = posting("Austin, TX", false, None);
        let outcome = evaluate(Source::Greenhouse, &p, now, HOUR_MS);
        assert_eq!(outcome.reason, FilterReason::NoTimestamp);
    }

    #[test]
    fn test_unparseable_timestamp_counts_as_missing() {
        let now = 1_700_000_000_000;
        let p = posting("Austin, TX", false, Some("last tuesday"));
        let outcome = evaluate(Source::Greenhouse, &p, now, HOUR_MS);
        assert_eq!(outcome.reason, FilterReason::NoTimestamp);
    }

    #[test]
    fn test_greenhouse_effective_is_max_of_both() {
        let now = 1_700_000_000_000;
        let mut p = posting("Boston, MA", false, Some(&iso(now - 2 * HOUR_MS)));
        // An old updated_at with a fresh first_published still passes.
        p.first_published = Some(iso(now - 5 * 60 * 1000));
        let outcome = evaluate(Source::Greenhouse, &p, now, HOUR_MS);
        assert_eq!(outcome.reason, FilterReason::Keep);
        assert_eq!(outcome.effective.unwrap().1, now - 5 * 60 * 1000);
    }

    #[test]
    fn test_remote_excluded_country_rejected() {
        let now = 1_700_000_000_000;
        let p = posting("Remote - Germany", true, Some(&iso(now - 1000)));
        let outcome = evaluate(Source::Ashby, &p, now, HOUR_MS);
        assert_eq!(outcome.reason, FilterReason::WrongLocation);
    }

    #[test]
    fn test_us_remote_phrase_short_circuits_exclusion() {
        let verdict = evaluate_location(policy(), "Remote - US", true);
        assert!(verdict.keep);
    }

    #[test]
    fn test_remote_flag_without_location() {
        let verdict = evaluate_location(policy(), "", true);
        assert!(verdict.keep);
        assert_eq!(verdict.matched, Some(LocationRule::RemoteFlag));
    }

    #[test]
    fn test_plain_remote_token_kept() {
        let verdict = evaluate_location(policy(), "Remote", false);
        assert!(verdict.keep);
        assert_eq!(verdict.matched, Some(LocationRule::PermissiveRemote));
    }

    #[test]
    fn test_multi_city_string_with_excluded_country() {
        // The concrete US signal wins over the excluded country.
        let verdict = evaluate_location(policy(), "Berlin, Germany; New York, NY", false);
        assert!(verdict.keep);
        assert!(verdict.state_codes.contains("NY"));
    }

    #[test]
    fn test_city_requires_boundary() {
        assert!(evaluate_location(policy(), "Greater Boston Area", false).keep);
        // "bostonia" must not match "boston".
        assert!(!evaluate_location(policy(), "Bostonia, Sweden", false).keep);
    }

    #[test]
    fn test_lowercase_in_is_not_indiana() {
        let codes = extract_state_codes(policy(), "Remote in Germany");
        assert!(codes.is_empty());
    }

    #[test]
    fn test_washington_dc_extraction() {
        let codes = extract_state_codes(policy(), "Washington, D.C.");
        assert!(codes.contains("DC"));
    }

    #[test]
    fn test_state_code_extraction_multi() {
        let codes = extract_state_codes(policy(), "New York, NY; Seattle, WA");
        assert_eq!(
            codes.into_iter().collect::<Vec<_>>(),
            vec!["NY".to_string(), "WA".to_string()]
        );
    }

    #[test]
    fn test_accepted_posting_always_has_matching_rule() {
        // Filter soundness: every accepted string names the rule that took it.
        for (text, remote) in [
            ("New York, NY", false),
            ("Remote - US", false),
            ("United States", false),
            ("Chicago", false),
            ("", true),
            ("Remote", false),
        ] {
            let verdict = evaluate_location(policy(), text, remote);
            assert!(verdict.keep, "expected keep for {:?}", text);
            assert!(verdict.matched.is_some(), "no rule recorded for {:?}", text);
        }
    }
}
