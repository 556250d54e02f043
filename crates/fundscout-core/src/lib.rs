//! Core domain model for fundscout: profiles, opportunities, match results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "fundscout-core";

/// Funding categories a profile can declare interest in. Each category maps to
/// a fixed set of upstream collections the opportunity documents live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FundingType {
    Grants,
    Contracts,
    Rfps,
    Bids,
}

impl FundingType {
    pub fn collections(self) -> &'static [&'static str] {
        match self {
            FundingType::Grants => &["grants.gov", "grantwatch"],
            FundingType::Contracts => &["SAM"],
            FundingType::Rfps => &["PND_RFPs", "rfpmart"],
            FundingType::Bids => &["bid"],
        }
    }

    /// Parse the label used by upstream profile documents. Unknown labels are
    /// `None`, never an error.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "grant" | "grants" => Some(FundingType::Grants),
            "contract" | "contracts" => Some(FundingType::Contracts),
            "rfp" | "rfps" => Some(FundingType::Rfps),
            "bid" | "bids" => Some(FundingType::Bids),
            _ => None,
        }
    }

    /// Every collection any funding type maps to, in a fixed order.
    pub fn all_collections() -> Vec<&'static str> {
        Self::collections_for(&[
            FundingType::Grants,
            FundingType::Contracts,
            FundingType::Rfps,
            FundingType::Bids,
        ])
    }

    /// Collections covered by a set of funding-type preferences, deduplicated,
    /// in declaration order. Empty input yields an empty list; callers treat
    /// that as "no preference, consider everything".
    pub fn collections_for(types: &[FundingType]) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        for t in types {
            for c in t.collections() {
                if !out.contains(c) {
                    out.push(c);
                }
            }
        }
        out
    }
}

/// Deadline proximity classification for an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyBucket {
    Urgent,
    Soon,
    Ongoing,
}

impl std::fmt::Display for UrgencyBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UrgencyBucket::Urgent => "urgent",
            UrgencyBucket::Soon => "soon",
            UrgencyBucket::Ongoing => "ongoing",
        };
        f.write_str(s)
    }
}

/// Lowercase, trim, drop empties, deduplicate while preserving first-seen
/// order. Applied to every keyword list entering a profile.
pub fn normalize_keywords(keywords: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for kw in keywords {
        let kw = kw.trim().to_lowercase();
        if kw.is_empty() || out.contains(&kw) {
            continue;
        }
        out.push(kw);
    }
    out
}

/// A user's declared interests, the read-only input to matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub organization_name: Option<String>,
    pub main_keywords: Vec<String>,
    pub sub_keywords: Vec<String>,
    pub funding_types: Vec<FundingType>,
    pub location: Option<String>,
    pub annual_budget_usd: Option<u64>,
}

impl Profile {
    /// Enforce the keyword-set invariant (case-normalized, deduplicated).
    pub fn normalized(mut self) -> Self {
        self.main_keywords = normalize_keywords(self.main_keywords);
        self.sub_keywords = normalize_keywords(self.sub_keywords);
        self
    }
}

/// One canonical opportunity record keyed by its stable external id. Field
/// presence is optional throughout; absence is never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Opportunity {
    pub id: String,
    pub collection: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub summary: Option<String>,
    pub agency: Option<String>,
    pub department: Option<String>,
    /// Raw close date / deadline string; parsed lazily at classification time.
    pub close_date: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub url: Option<String>,
    pub synopsis_url: Option<String>,
    pub link: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    /// Unrecognized upstream keys, passed through untouched.
    #[serde(default)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Opportunity {
    /// Lower-cased concatenation of the free-text fields keyword scoring
    /// searches over.
    pub fn searchable_text(&self) -> String {
        [
            self.title.as_deref(),
            self.description.as_deref(),
            self.summary.as_deref(),
            self.agency.as_deref(),
            self.department.as_deref(),
        ]
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
    }

    /// Candidate starting URLs for application-path discovery, most specific
    /// first.
    pub fn start_url_candidates(&self) -> Vec<&str> {
        [
            self.url.as_deref(),
            self.synopsis_url.as_deref(),
            self.link.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|u| !u.trim().is_empty())
        .collect()
    }
}

/// One hit of a profile keyword in an opportunity's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordMatch {
    pub keyword: String,
    pub count: usize,
}

/// Breakdown of keyword scoring for display and audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MatchDetail {
    pub main_matches: Vec<KeywordMatch>,
    pub sub_matches: Vec<KeywordMatch>,
    /// Distinct keywords that matched at least once.
    pub total_matches: usize,
}

/// One scored factor of the win-rate rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFactor {
    pub name: String,
    pub score: f64,
    pub max: f64,
    pub detail: String,
}

/// Computed match between one profile and one opportunity. Unique per
/// `(profile_id, opportunity_id)`; recomputing with unchanged inputs yields
/// identical scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub profile_id: String,
    pub opportunity_id: String,
    pub relevance_score: f64,
    pub win_rate: f64,
    pub urgency: UrgencyBucket,
    pub reasoning: Vec<MatchFactor>,
    pub computed_at: DateTime<Utc>,
}

/// Outcome of application-path discovery for one opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationPathResult {
    pub application_url: Option<String>,
    pub instructions: Vec<String>,
    pub visited_urls: Vec<String>,
    pub confidence: f64,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_types_map_to_fixed_collections() {
        assert_eq!(
            FundingType::Grants.collections(),
            &["grants.gov", "grantwatch"]
        );
        assert_eq!(FundingType::Contracts.collections(), &["SAM"]);
    }

    #[test]
    fn collections_for_deduplicates_preserving_order() {
        let cols = FundingType::collections_for(&[
            FundingType::Rfps,
            FundingType::Grants,
            FundingType::Grants,
        ]);
        assert_eq!(cols, vec!["PND_RFPs", "rfpmart", "grants.gov", "grantwatch"]);
    }

    #[test]
    fn funding_type_labels_parse_case_insensitively() {
        assert_eq!(FundingType::parse("Grants"), Some(FundingType::Grants));
        assert_eq!(FundingType::parse("rfp"), Some(FundingType::Rfps));
        assert_eq!(FundingType::parse("fellowship"), None);
    }

    #[test]
    fn keyword_normalization_lowercases_and_dedupes() {
        let kws = normalize_keywords(vec![
            "Education".into(),
            "  STEM ".into(),
            "education".into(),
            "".into(),
        ]);
        assert_eq!(kws, vec!["education".to_string(), "stem".to_string()]);
    }

    #[test]
    fn searchable_text_skips_absent_fields() {
        let opp = Opportunity {
            id: "opp-1".into(),
            collection: "grants.gov".into(),
            title: Some("Rural Education Grant".into()),
            agency: Some("Dept of Ed".into()),
            ..Default::default()
        };
        assert_eq!(opp.searchable_text(), "rural education grant dept of ed");
    }

    #[test]
    fn start_url_candidates_are_ordered_and_nonempty() {
        let opp = Opportunity {
            id: "opp-2".into(),
            collection: "bid".into(),
            url: Some("https://a.example".into()),
            synopsis_url: Some("  ".into()),
            link: Some("https://b.example".into()),
            ..Default::default()
        };
        assert_eq!(
            opp.start_url_candidates(),
            vec!["https://a.example", "https://b.example"]
        );
    }
}
