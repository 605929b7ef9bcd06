//! Process-wide location policy tables.
//!
//! Built once at first use and never mutated. The allow side is a union of
//! US keywords, major-city names, and the two-letter state codes; the deny
//! side is the country/region substrings that disqualify a "remote" posting
//! that carries no other US signal.

use std::sync::OnceLock;

pub struct FilterPolicy {
    pub us_keywords: &'static [&'static str],
    pub major_cities: &'static [&'static str],
    pub state_codes: &'static [&'static str],
    pub excluded_remote_countries: &'static [&'static str],
    pub us_remote_phrases: &'static [&'static str],
}

const US_KEYWORDS: &[&str] = &[
    "united states",
    "usa",
    "u.s.",
    "us only",
    "us-based",
    "us based",
    "anywhere in the us",
];

const MAJOR_CITIES: &[&str] = &[
    "new york",
    "san francisco",
    "seattle",
    "austin",
    "boston",
    "chicago",
    "los angeles",
    "denver",
    "atlanta",
    "miami",
    "portland",
    "san diego",
    "san jose",
    "philadelphia",
    "phoenix",
    "dallas",
    "houston",
    "minneapolis",
    "pittsburgh",
    "raleigh",
    "salt lake city",
    "washington",
    "brooklyn",
    "oakland",
    "palo alto",
    "mountain view",
    "menlo park",
    "sunnyvale",
    "redwood city",
    "santa monica",
    "cambridge",
];

const STATE_CODES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC",
];

const EXCLUDED_REMOTE_COUNTRIES: &[&str] = &[
    "germany",
    "united kingdom",
    "uk",
    "canada",
    "india",
    "australia",
    "ireland",
    "netherlands",
    "france",
    "spain",
    "portugal",
    "poland",
    "romania",
    "ukraine",
    "israel",
    "brazil",
    "mexico",
    "argentina",
    "colombia",
    "japan",
    "singapore",
    "philippines",
    "europe",
    "emea",
    "apac",
    "latam",
    "worldwide",
    "global",
];

// Phrasings that pin a remote posting to the US and short-circuit the
// exclusion check.
const US_REMOTE_PHRASES: &[&str] = &[
    "us-remote",
    "us remote",
    "remote us",
    "remote - us",
    "remote, us",
    "remote (us",
    "remote in the us",
    "remote (united states",
    "remote - united states",
];

static POLICY: OnceLock<FilterPolicy> = OnceLock::new();

/// The process-wide policy table.
pub fn policy() -> &'static FilterPolicy {
    POLICY.get_or_init(|| FilterPolicy {
        us_keywords: US_KEYWORDS,
        major_cities: MAJOR_CITIES,
        state_codes: STATE_CODES,
        excluded_remote_countries: EXCLUDED_REMOTE_COUNTRIES,
        us_remote_phrases: US_REMOTE_PHRASES,
    })
}

impl FilterPolicy {
    pub fn is_state_code(&self, token: &str) -> bool {
        self.state_codes.contains(&token)
    }
}
