//! Matching engine: urgency classification, weighted keyword scoring, and the
//! ranked win-rate rubric.

use chrono::{DateTime, NaiveDate, Utc};
use fundscout_core::{
    FundingType, KeywordMatch, MatchDetail, MatchFactor, MatchResult, Opportunity, Profile,
    UrgencyBucket,
};
use regex::Regex;
use tracing::trace;

pub const CRATE_NAME: &str = "fundscout-match";

/// Deadline thresholds, in calendar days from the evaluation instant.
const URGENT_MAX_DAYS: i64 = 30;
const SOON_MAX_DAYS: i64 = 92;

const URGENT_MULTIPLIER: f64 = 1.2;
const SOON_MULTIPLIER: f64 = 1.1;

const MAIN_KEYWORD_WEIGHT: f64 = 3.0;
const SUB_KEYWORD_WEIGHT: f64 = 1.0;

fn parse_deadline(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Some(prefix) = raw.get(0..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(date);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.date_naive())
}

/// Bucket a deadline relative to `today`. Missing or unparseable deadlines are
/// `Ongoing`.
pub fn classify_urgency_at(deadline: Option<&str>, today: NaiveDate) -> UrgencyBucket {
    let Some(date) = deadline.and_then(parse_deadline) else {
        return UrgencyBucket::Ongoing;
    };
    let days = (date - today).num_days();
    if days <= URGENT_MAX_DAYS {
        UrgencyBucket::Urgent
    } else if days <= SOON_MAX_DAYS {
        UrgencyBucket::Soon
    } else {
        UrgencyBucket::Ongoing
    }
}

/// Bucket a deadline against the current date. Two invocations at different
/// real times may classify the same record differently; that is the intended
/// calendar semantics, not drift.
pub fn classify_urgency(deadline: Option<&str>) -> UrgencyBucket {
    classify_urgency_at(deadline, Utc::now().date_naive())
}

fn urgency_multiplier(bucket: UrgencyBucket) -> f64 {
    match bucket {
        UrgencyBucket::Urgent => URGENT_MULTIPLIER,
        UrgencyBucket::Soon => SOON_MULTIPLIER,
        UrgencyBucket::Ongoing => 1.0,
    }
}

/// Counts whole-word, case-insensitive keyword occurrences in an opportunity's
/// searchable text. Patterns are compiled once per scorer.
pub struct KeywordScorer {
    main: Vec<(String, Regex)>,
    sub: Vec<(String, Regex)>,
}

impl KeywordScorer {
    pub fn for_profile(profile: &Profile) -> Self {
        Self {
            main: Self::compile(&profile.main_keywords),
            sub: Self::compile(&profile.sub_keywords),
        }
    }

    fn compile(keywords: &[String]) -> Vec<(String, Regex)> {
        keywords
            .iter()
            .map(|kw| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(kw));
                let re = Regex::new(&pattern).expect("escaped keyword pattern is valid");
                (kw.clone(), re)
            })
            .collect()
    }

    fn count_hits(patterns: &[(String, Regex)], text: &str) -> Vec<KeywordMatch> {
        patterns
            .iter()
            .filter_map(|(keyword, re)| {
                let count = re.find_iter(text).count();
                (count > 0).then(|| KeywordMatch {
                    keyword: keyword.clone(),
                    count,
                })
            })
            .collect()
    }

    /// Weighted occurrence score plus the per-keyword breakdown. Main keyword
    /// hits count 3x, sub keyword hits 1x. Empty keyword sets score zero.
    pub fn score(&self, opportunity: &Opportunity) -> (f64, MatchDetail) {
        let text = opportunity.searchable_text();
        let main_matches = Self::count_hits(&self.main, &text);
        let sub_matches = Self::count_hits(&self.sub, &text);

        let score = main_matches
            .iter()
            .map(|m| m.count as f64 * MAIN_KEYWORD_WEIGHT)
            .sum::<f64>()
            + sub_matches
                .iter()
                .map(|m| m.count as f64 * SUB_KEYWORD_WEIGHT)
                .sum::<f64>();

        let total_matches = main_matches.len() + sub_matches.len();
        (
            score,
            MatchDetail {
                main_matches,
                sub_matches,
                total_matches,
            },
        )
    }
}

/// Ranks opportunities for one profile: collection filter, keyword scoring,
/// urgency boost, win-rate rubric.
///
/// Ordering is `relevance_score` desc, then `win_rate` desc, with ties broken
/// by opportunity id ascending (lexicographic) so reruns are stable.
pub struct MatchRanker {
    profile: Profile,
    scorer: KeywordScorer,
    collections: Vec<&'static str>,
}

impl MatchRanker {
    pub fn new(profile: Profile) -> Self {
        let profile = profile.normalized();
        let scorer = KeywordScorer::for_profile(&profile);
        let collections = FundingType::collections_for(&profile.funding_types);
        Self {
            profile,
            scorer,
            collections,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Rank against the current date. See [`MatchRanker::rank_at`].
    pub fn rank(&self, opportunities: &[Opportunity]) -> Vec<MatchResult> {
        self.rank_at(opportunities, Utc::now().date_naive(), Utc::now())
    }

    /// Deterministic core of ranking: same inputs and `today` produce the same
    /// scores. Opportunities sharing an external id are collapsed to the first
    /// record seen; zero-relevance opportunities never appear in the output.
    pub fn rank_at(
        &self,
        opportunities: &[Opportunity],
        today: NaiveDate,
        computed_at: DateTime<Utc>,
    ) -> Vec<MatchResult> {
        let unrestricted = self.collections.is_empty();
        let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut results = Vec::new();

        for opp in opportunities {
            if !seen.insert(opp.id.as_str()) {
                continue;
            }
            if !unrestricted && !self.collections.contains(&opp.collection.as_str()) {
                continue;
            }

            let (keyword_score, detail) = self.scorer.score(opp);
            if keyword_score == 0.0 {
                trace!(opportunity_id = %opp.id, "no keyword overlap, skipping");
                continue;
            }

            let urgency = classify_urgency_at(opp.close_date.as_deref(), today);
            let relevance_score = keyword_score * urgency_multiplier(urgency);
            let (win_rate, reasoning) = self.win_rate(opp, keyword_score, &detail, urgency);

            results.push(MatchResult {
                profile_id: self.profile.id.clone(),
                opportunity_id: opp.id.clone(),
                relevance_score,
                win_rate,
                urgency,
                reasoning,
                computed_at,
            });
        }

        results.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then(b.win_rate.total_cmp(&a.win_rate))
                .then(a.opportunity_id.cmp(&b.opportunity_id))
        });
        results
    }

    /// 100-point weighted rubric. Each factor is recorded with its score, max,
    /// and a display rationale.
    fn win_rate(
        &self,
        opportunity: &Opportunity,
        keyword_score: f64,
        detail: &MatchDetail,
        urgency: UrgencyBucket,
    ) -> (f64, Vec<MatchFactor>) {
        let mut factors = Vec::with_capacity(5);

        let keyword_points = (keyword_score * 2.0).min(40.0);
        factors.push(MatchFactor {
            name: "Keyword Match".into(),
            score: keyword_points,
            max: 40.0,
            detail: format!("{} relevant keywords found", detail.total_matches),
        });

        let main_count = detail.main_matches.len();
        let main_points = (main_count as f64 * 8.0).min(25.0);
        factors.push(MatchFactor {
            name: "Primary Interest Alignment".into(),
            score: main_points,
            max: 25.0,
            detail: format!("{main_count} primary interests matched"),
        });

        let funding_matched = self.collections.contains(&opportunity.collection.as_str());
        let funding_points = if funding_matched { 20.0 } else { 0.0 };
        factors.push(MatchFactor {
            name: "Funding Type Match".into(),
            score: funding_points,
            max: 20.0,
            detail: if funding_matched {
                "Matches preferred funding type".into()
            } else {
                "Different funding type".into()
            },
        });

        let location_matched = match (self.profile.location.as_deref(), opportunity.state.as_deref())
        {
            (Some(profile_state), Some(opp_state)) => {
                profile_state.eq_ignore_ascii_case(opp_state.trim())
            }
            _ => false,
        };
        let location_points = if location_matched { 10.0 } else { 0.0 };
        factors.push(MatchFactor {
            name: "Location Match".into(),
            score: location_points,
            max: 10.0,
            detail: if location_matched {
                "Same state".into()
            } else {
                "Different or unspecified location".into()
            },
        });

        let (timing_points, timing_detail) = match urgency {
            UrgencyBucket::Urgent => (5.0, "Deadline within 30 days"),
            UrgencyBucket::Soon => (3.0, "Deadline within 3 months"),
            UrgencyBucket::Ongoing => (2.0, "Ongoing or long-term opportunity"),
        };
        factors.push(MatchFactor {
            name: "Timing".into(),
            score: timing_points,
            max: 5.0,
            detail: timing_detail.into(),
        });

        let total: f64 = factors.iter().map(|f| f.score).sum();
        (total, factors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn opp(id: &str, collection: &str, title: &str) -> Opportunity {
        Opportunity {
            id: id.into(),
            collection: collection.into(),
            title: Some(title.into()),
            ..Default::default()
        }
    }

    fn profile(main: &[&str], sub: &[&str], funding: &[FundingType]) -> Profile {
        Profile {
            id: "prof-1".into(),
            organization_name: None,
            main_keywords: main.iter().map(|s| s.to_string()).collect(),
            sub_keywords: sub.iter().map(|s| s.to_string()).collect(),
            funding_types: funding.to_vec(),
            location: None,
            annual_budget_usd: None,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn iso(date: NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }

    #[test]
    fn urgency_buckets_follow_day_thresholds() {
        let t = today();
        let at = |days: i64| classify_urgency_at(Some(iso(t + Duration::days(days)).as_str()), t);
        assert_eq!(at(10), UrgencyBucket::Urgent);
        assert_eq!(at(30), UrgencyBucket::Urgent);
        assert_eq!(at(31), UrgencyBucket::Soon);
        assert_eq!(at(60), UrgencyBucket::Soon);
        assert_eq!(at(92), UrgencyBucket::Soon);
        assert_eq!(at(200), UrgencyBucket::Ongoing);
    }

    #[test]
    fn missing_or_garbage_deadlines_are_ongoing() {
        assert_eq!(classify_urgency_at(None, today()), UrgencyBucket::Ongoing);
        assert_eq!(
            classify_urgency_at(Some("check website"), today()),
            UrgencyBucket::Ongoing
        );
        assert_eq!(classify_urgency_at(Some(""), today()), UrgencyBucket::Ongoing);
    }

    #[test]
    fn rfc3339_deadlines_parse() {
        assert_eq!(
            classify_urgency_at(Some("2025-06-10T00:00:00Z"), today()),
            UrgencyBucket::Urgent
        );
    }

    #[test]
    fn empty_keyword_sets_always_score_zero() {
        let scorer = KeywordScorer::for_profile(&profile(&[], &[], &[]).normalized());
        let (score, detail) = scorer.score(&opp("o1", "bid", "Education grant for everything"));
        assert_eq!(score, 0.0);
        assert_eq!(detail.total_matches, 0);
    }

    #[test]
    fn main_keywords_count_triple_and_whole_word() {
        let scorer = KeywordScorer::for_profile(&profile(&["education"], &[], &[]).normalized());
        let (score, detail) =
            scorer.score(&opp("o1", "grants.gov", "Grant for rural education programs"));
        assert_eq!(score, 3.0);
        assert_eq!(detail.main_matches.len(), 1);
        assert_eq!(detail.main_matches[0].keyword, "education");
        assert_eq!(detail.main_matches[0].count, 1);

        // "educational" must not hit the whole-word pattern.
        let (score, _) = scorer.score(&opp("o2", "grants.gov", "Educational materials"));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn sub_keywords_count_single_weight() {
        let scorer =
            KeywordScorer::for_profile(&profile(&["education"], &["rural"], &[]).normalized());
        let (score, detail) =
            scorer.score(&opp("o1", "grants.gov", "Rural education in rural counties"));
        // education 1x3 + rural 2x1
        assert_eq!(score, 5.0);
        assert_eq!(detail.total_matches, 2);
    }

    #[test]
    fn collection_filter_respects_funding_preferences() {
        let ranker = MatchRanker::new(profile(&["education"], &[], &[FundingType::Grants]));
        let opps = vec![
            opp("sam-1", "SAM", "education contract"),
            opp("gg-1", "grants.gov", "education grant"),
        ];
        let results = ranker.rank_at(&opps, today(), now());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].opportunity_id, "gg-1");
    }

    #[test]
    fn no_funding_preference_considers_all_collections() {
        let ranker = MatchRanker::new(profile(&["education"], &[], &[]));
        let opps = vec![
            opp("sam-1", "SAM", "education contract"),
            opp("gg-1", "grants.gov", "education grant"),
        ];
        let results = ranker.rank_at(&opps, today(), now());
        assert_eq!(results.len(), 2);
        // Funding factor resolves to 0 without crashing.
        for r in &results {
            let funding = r
                .reasoning
                .iter()
                .find(|f| f.name == "Funding Type Match")
                .unwrap();
            assert_eq!(funding.score, 0.0);
        }
    }

    #[test]
    fn higher_keyword_score_ranks_first() {
        let ranker = MatchRanker::new(profile(&["education"], &[], &[]));
        let opps = vec![
            opp("low", "grants.gov", "education"),
            opp(
                "high",
                "grants.gov",
                "education education education education education",
            ),
        ];
        let results = ranker.rank_at(&opps, today(), now());
        assert_eq!(results[0].opportunity_id, "high");
        assert!(results[0].relevance_score > results[1].relevance_score);
    }

    #[test]
    fn ties_break_by_opportunity_id_ascending() {
        let ranker = MatchRanker::new(profile(&["education"], &[], &[]));
        let opps = vec![
            opp("b-opp", "grants.gov", "education"),
            opp("a-opp", "grants.gov", "education"),
        ];
        let results = ranker.rank_at(&opps, today(), now());
        assert_eq!(results[0].opportunity_id, "a-opp");
        assert_eq!(results[1].opportunity_id, "b-opp");
    }

    #[test]
    fn duplicate_external_ids_collapse_to_first_record() {
        let ranker = MatchRanker::new(profile(&["education"], &[], &[]));
        let opps = vec![
            opp("dup", "grants.gov", "education"),
            opp("dup", "grants.gov", "education education"),
        ];
        let results = ranker.rank_at(&opps, today(), now());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].relevance_score, 3.0);
    }

    #[test]
    fn urgent_deadline_boosts_relevance() {
        let ranker = MatchRanker::new(profile(&["education"], &[], &[]));
        let mut urgent = opp("u", "grants.gov", "education");
        urgent.close_date = Some(iso(today() + Duration::days(10)));
        let ongoing = opp("o", "grants.gov", "education");

        let results = ranker.rank_at(&[urgent, ongoing], today(), now());
        assert_eq!(results[0].opportunity_id, "u");
        assert_eq!(results[0].urgency, UrgencyBucket::Urgent);
        assert!((results[0].relevance_score - 3.6).abs() < 1e-9);
        assert_eq!(results[1].relevance_score, 3.0);
    }

    #[test]
    fn win_rate_stays_within_bounds_under_saturation() {
        let mut p = profile(
            &["education", "stem", "science", "youth"],
            &["rural"],
            &[FundingType::Grants],
        );
        p.location = Some("ca".into());
        let ranker = MatchRanker::new(p);

        let mut o = opp(
            "cap",
            "grants.gov",
            "education stem science youth rural education stem science youth rural \
             education stem science youth rural education stem science youth rural",
        );
        o.close_date = Some(iso(today() + Duration::days(5)));
        o.state = Some("CA".into());

        let results = ranker.rank_at(&[o], today(), now());
        let r = &results[0];
        assert!(r.win_rate <= 100.0 && r.win_rate >= 0.0);
        assert!(r.relevance_score >= 0.0);
        // keyword 40 + main 25 + funding 20 + location 10 + urgency 5
        assert_eq!(r.win_rate, 100.0);
    }

    #[test]
    fn win_rate_factors_carry_scores_and_maxima() {
        let ranker = MatchRanker::new(profile(&["education"], &[], &[FundingType::Grants]));
        let results = ranker.rank_at(&[opp("o", "grants.gov", "education")], today(), now());
        let r = &results[0];
        let names: Vec<&str> = r.reasoning.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Keyword Match",
                "Primary Interest Alignment",
                "Funding Type Match",
                "Location Match",
                "Timing"
            ]
        );
        let maxima: f64 = r.reasoning.iter().map(|f| f.max).sum();
        assert_eq!(maxima, 100.0);
        // keyword 6 + main 8 + funding 20 + location 0 + timing 2
        assert_eq!(r.win_rate, 36.0);
    }

    #[test]
    fn ranking_is_idempotent() {
        let ranker = MatchRanker::new(profile(&["education"], &["rural"], &[FundingType::Grants]));
        let mut o = opp("o", "grants.gov", "rural education fund");
        o.close_date = Some(iso(today() + Duration::days(45)));
        let opps = vec![o];

        let first = ranker.rank_at(&opps, today(), now());
        let second = ranker.rank_at(&opps, today(), now());
        assert_eq!(first, second);
    }
}
