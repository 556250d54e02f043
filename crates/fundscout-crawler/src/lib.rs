//! Application-path discovery: a direct-URL short-circuit over the record's
//! own data, then a bounded breadth-first crawl for an apply entry point.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use fundscout_core::{ApplicationPathResult, Opportunity};
use fundscout_storage::{FetchError, FetchedPage, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "fundscout-crawler";

/// Anchor/button vocabulary that signals an apply entry point.
const APPLY_KEYWORDS: &[&str] = &["apply", "application", "submit", "start", "begin", "proposal"];

/// Broader vocabulary that justifies following a link one level deeper.
const RELEVANT_KEYWORDS: &[&str] = &["apply", "grant", "fund", "portal", "login", "submission"];

/// Field names an upstream record may carry a ready-made application URL in.
const DIRECT_URL_FIELDS: &[&str] = &[
    "applicationUrl",
    "applyUrl",
    "formUrl",
    "submissionUrl",
    "applicationLink",
    "applyLink",
];

const FOUND_AT_ROOT_CONFIDENCE: f64 = 0.85;
const FOUND_DEEPER_CONFIDENCE: f64 = 0.75;
const FALLBACK_CONFIDENCE: f64 = 0.2;

/// Page fetch seam so tests can run the traversal against an in-memory site
/// instead of the network.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch(url).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlConfig {
    /// 0 means only the starting page is inspected.
    pub max_depth: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self { max_depth: 2 }
    }
}

fn is_valid_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

fn matches_any(text: &str, keywords: &[&str]) -> bool {
    let text = text.to_lowercase();
    keywords.iter().any(|kw| text.contains(kw))
}

/// Apply-intent check for a bare URL, rejecting job-board lookalikes.
fn looks_like_application_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    if ["job", "career", "employment"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return false;
    }
    ["apply", "application", "submit", "form", "proposal"]
        .iter()
        .any(|w| lower.contains(w))
}

/// Check the record's own data for an application URL before any fetch:
/// well-known field names first, then URLs embedded in the description or
/// summary text.
pub fn direct_application_url(opportunity: &Opportunity) -> Option<String> {
    for field in DIRECT_URL_FIELDS {
        if let Some(url) = opportunity.extra.get(*field).and_then(|v| v.as_str()) {
            if is_valid_url(url) && looks_like_application_url(url) {
                return Some(url.to_string());
            }
        }
    }

    let url_pattern = Regex::new(r#"https?://[^\s<>"]+"#).expect("static url pattern is valid");
    for text in [
        opportunity.description.as_deref(),
        opportunity.summary.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        for found in url_pattern.find_iter(text) {
            let url = found.as_str().trim_end_matches(['.', ',', ')']);
            if is_valid_url(url) && looks_like_application_url(url) {
                return Some(url.to_string());
            }
        }
    }
    None
}

/// What one fetched page contributed to the crawl.
#[derive(Debug, Default, PartialEq)]
pub struct PageScan {
    pub apply_url: Option<String>,
    pub next_links: Vec<String>,
}

fn selector(source: &'static str) -> Selector {
    Selector::parse(source).expect("static selector parses")
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let joined = base.join(href).ok()?;
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}

fn anchor_matches_apply(anchor: &ElementRef<'_>) -> bool {
    let text = anchor.text().collect::<String>();
    if matches_any(text.trim(), APPLY_KEYWORDS) {
        return true;
    }
    if let Some(title) = anchor.value().attr("title") {
        if matches_any(title, APPLY_KEYWORDS) {
            return true;
        }
    }
    let data_attrs = anchor
        .value()
        .attrs()
        .filter(|(name, _)| name.starts_with("data-"))
        .map(|(_, value)| value)
        .collect::<Vec<_>>()
        .join(" ");
    matches_any(&data_attrs, APPLY_KEYWORDS)
}

/// Pure HTML scan: the first apply-intent link, plus the frontier candidates
/// worth exploring a level deeper. Malformed markup degrades to an empty scan
/// rather than an error.
pub fn scan_page(html_text: &str, base_url: &str) -> PageScan {
    let Ok(base) = Url::parse(base_url) else {
        return PageScan::default();
    };
    let document = Html::parse_document(html_text);
    let anchor_sel = selector("a[href]");
    let button_sel = selector("button");

    let mut scan = PageScan::default();
    let mut seen_links: HashSet<String> = HashSet::new();

    for anchor in document.select(&anchor_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(absolute) = resolve(&base, href) else {
            continue;
        };

        if scan.apply_url.is_none() && anchor_matches_apply(&anchor) {
            scan.apply_url = Some(absolute.clone());
        }

        let text = anchor.text().collect::<String>();
        if matches_any(text.trim(), RELEVANT_KEYWORDS) || matches_any(&absolute, RELEVANT_KEYWORDS)
        {
            if seen_links.insert(absolute.clone()) {
                scan.next_links.push(absolute);
            }
        }
    }

    // Apply buttons rendered inside a wrapping anchor.
    if scan.apply_url.is_none() {
        for button in document.select(&button_sel) {
            let text = button.text().collect::<String>();
            if !matches_any(text.trim(), APPLY_KEYWORDS) {
                continue;
            }
            let wrapping_anchor = button
                .ancestors()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "a");
            if let Some(anchor) = wrapping_anchor {
                if let Some(href) = anchor.value().attr("href") {
                    if let Some(absolute) = resolve(&base, href) {
                        scan.apply_url = Some(absolute);
                        break;
                    }
                }
            }
        }
    }

    scan
}

/// Breadth-first application-path finder over an injected page fetcher.
/// Frontier and visited set are local to one discovery call, so concurrent
/// discoveries share nothing but the fetcher.
pub struct PathFinder {
    fetcher: Arc<dyn PageFetcher>,
    config: CrawlConfig,
}

impl PathFinder {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: CrawlConfig) -> Self {
        Self { fetcher, config }
    }

    /// Full discovery for an opportunity record: direct-URL short-circuit,
    /// then a crawl from each starting-URL candidate, then generated manual
    /// instructions. Always returns a well-formed result; network faults
    /// degrade confidence instead of propagating.
    pub async fn discover(&self, opportunity: &Opportunity) -> ApplicationPathResult {
        if let Some(url) = direct_application_url(opportunity) {
            return ApplicationPathResult {
                application_url: Some(url),
                instructions: vec!["Open the application form directly".into()],
                visited_urls: Vec::new(),
                confidence: 1.0,
                notes: Some("Application link found in the opportunity record".into()),
            };
        }

        let mut visited_order: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for start in opportunity.start_url_candidates() {
            if !is_valid_url(start) {
                continue;
            }
            if let Some((url, confidence)) = self.crawl(start, &mut visited_order, &mut seen).await
            {
                return ApplicationPathResult {
                    application_url: Some(url),
                    instructions: vec![
                        "Open the opportunity page".into(),
                        "Use the apply link highlighted on the site".into(),
                    ],
                    visited_urls: visited_order,
                    confidence,
                    notes: None,
                };
            }
        }

        ApplicationPathResult {
            application_url: None,
            instructions: fallback_instructions(opportunity),
            visited_urls: visited_order,
            confidence: FALLBACK_CONFIDENCE,
            notes: Some(
                "Automatic discovery could not find a direct apply link; manual review suggested"
                    .into(),
            ),
        }
    }

    /// Crawl from one starting URL. See [`PathFinder::discover`] for the
    /// record-level entry point.
    pub async fn discover_path(&self, starting_url: &str) -> ApplicationPathResult {
        let mut visited_order: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        if is_valid_url(starting_url) {
            if let Some((url, confidence)) = self
                .crawl(starting_url, &mut visited_order, &mut seen)
                .await
            {
                return ApplicationPathResult {
                    application_url: Some(url),
                    instructions: vec![
                        "Open the opportunity page".into(),
                        "Use the apply link highlighted on the site".into(),
                    ],
                    visited_urls: visited_order,
                    confidence,
                    notes: None,
                };
            }
        }

        ApplicationPathResult {
            application_url: None,
            instructions: vec![
                "Visit the opportunity page".into(),
                "Look for buttons or navigation items labelled Apply / Submit".into(),
                "Follow the organization's grants or funding portal if required".into(),
            ],
            visited_urls: visited_order,
            confidence: FALLBACK_CONFIDENCE,
            notes: Some(
                "Automatic discovery could not find a direct apply link; manual review suggested"
                    .into(),
            ),
        }
    }

    /// Explicit-worklist BFS. Returns the apply URL and its confidence, or
    /// `None` when the frontier exhausts. Each URL is fetched at most once
    /// per discovery call; a failed fetch skips that page only.
    async fn crawl(
        &self,
        starting_url: &str,
        visited_order: &mut Vec<String>,
        seen: &mut HashSet<String>,
    ) -> Option<(String, f64)> {
        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        frontier.push_back((starting_url.to_string(), 0));

        while let Some((url, depth)) = frontier.pop_front() {
            if !seen.insert(url.clone()) {
                continue;
            }
            visited_order.push(url.clone());

            let page = match self.fetcher.fetch_page(&url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(%url, %err, "fetch failed, skipping page");
                    continue;
                }
            };

            let scan = scan_page(&page.body_text(), &page.final_url);

            if let Some(apply_url) = scan.apply_url {
                let confidence = if depth == 0 {
                    FOUND_AT_ROOT_CONFIDENCE
                } else {
                    FOUND_DEEPER_CONFIDENCE
                };
                return Some((apply_url, confidence));
            }

            if depth < self.config.max_depth {
                for link in scan.next_links {
                    if !seen.contains(&link) {
                        frontier.push_back((link, depth + 1));
                    }
                }
            }
        }

        None
    }
}

/// Manual application guidance assembled from whatever contact data the
/// record carries.
fn fallback_instructions(opportunity: &Opportunity) -> Vec<String> {
    let mut instructions = Vec::new();

    if let Some(url) = opportunity.start_url_candidates().first() {
        instructions.push(format!("Visit the opportunity page: {url}"));
        instructions
            .push("Look for an 'Apply', 'Submit Proposal', or 'Application Form' link".into());
    }

    if let Some(agency) = opportunity
        .agency
        .as_deref()
        .or(opportunity.department.as_deref())
    {
        instructions.push(format!(
            "Contact {agency} directly for application instructions"
        ));
    }

    if let Some(email) = opportunity.contact_email.as_deref() {
        instructions.push(format!("Email: {email}"));
    }
    if let Some(phone) = opportunity.contact_phone.as_deref() {
        instructions.push(format!("Phone: {phone}"));
    }
    if let Some(deadline) = opportunity.close_date.as_deref() {
        instructions.push(format!("Application deadline: {deadline}"));
    }

    if instructions.is_empty() {
        instructions.push("Check the opportunity page for application details".into());
    }
    instructions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSite {
        pages: HashMap<String, String>,
        fetches: AtomicUsize,
    }

    impl FakeSite {
        fn new(pages: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                pages: pages
                    .iter()
                    .map(|(u, b)| (u.to_string(), b.to_string()))
                    .collect(),
                fetches: AtomicUsize::new(0),
            })
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageFetcher for FakeSite {
        async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.pages.get(url) {
                Some(body) => Ok(FetchedPage {
                    status: fundscout_storage::StatusCode::OK,
                    final_url: url.to_string(),
                    content_type: Some("text/html".into()),
                    body: body.clone().into_bytes(),
                }),
                None => Err(FetchError::Status {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn finder(site: Arc<FakeSite>, max_depth: usize) -> PathFinder {
        PathFinder::new(site, CrawlConfig { max_depth })
    }

    fn opportunity_with_url(url: &str) -> Opportunity {
        Opportunity {
            id: "opp-1".into(),
            collection: "grants.gov".into(),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    #[test]
    fn direct_url_field_short_circuits() {
        let mut opp = opportunity_with_url("https://example.org");
        opp.extra.insert(
            "applicationUrl".into(),
            serde_json::Value::String("https://example.org/apply".into()),
        );
        assert_eq!(
            direct_application_url(&opp).as_deref(),
            Some("https://example.org/apply")
        );
    }

    #[test]
    fn description_urls_are_extracted_with_apply_intent() {
        let mut opp = opportunity_with_url("https://example.org");
        opp.description = Some("Apply at https://example.org/apply-now before June.".into());
        assert_eq!(
            direct_application_url(&opp).as_deref(),
            Some("https://example.org/apply-now")
        );
    }

    #[test]
    fn job_board_urls_are_not_application_urls() {
        let mut opp = opportunity_with_url("https://example.org");
        opp.description = Some("See https://example.org/careers/apply for openings.".into());
        assert_eq!(direct_application_url(&opp), None);
    }

    #[test]
    fn scan_finds_apply_anchor_by_text() {
        let scan = scan_page(
            r#"<html><body><a href="/apply-here">Apply Now</a></body></html>"#,
            "https://example.org/grant",
        );
        assert_eq!(
            scan.apply_url.as_deref(),
            Some("https://example.org/apply-here")
        );
    }

    #[test]
    fn scan_finds_apply_anchor_by_title_and_data_attrs() {
        let by_title = scan_page(
            r#"<a href="/go" title="Start your application">More</a>"#,
            "https://example.org",
        );
        assert_eq!(by_title.apply_url.as_deref(), Some("https://example.org/go"));

        let by_data = scan_page(
            r#"<a href="/go" data-action="submit-proposal">More</a>"#,
            "https://example.org",
        );
        assert_eq!(by_data.apply_url.as_deref(), Some("https://example.org/go"));
    }

    #[test]
    fn scan_finds_button_wrapped_in_anchor() {
        let scan = scan_page(
            r#"<a href="/portal/start"><button>Begin</button></a>"#,
            "https://example.org",
        );
        assert_eq!(
            scan.apply_url.as_deref(),
            Some("https://example.org/portal/start")
        );
    }

    #[test]
    fn scan_gathers_only_relevant_frontier_links() {
        let scan = scan_page(
            r#"<a href="/about">About us</a>
               <a href="/funding">Funding portal</a>
               <a href="/news">News</a>"#,
            "https://example.org",
        );
        assert_eq!(scan.apply_url, None);
        assert_eq!(scan.next_links, vec!["https://example.org/funding"]);
    }

    #[test]
    fn malformed_base_url_scans_empty() {
        assert_eq!(scan_page("<a href='/apply'>Apply</a>", "::bad::"), PageScan::default());
    }

    #[tokio::test]
    async fn direct_short_circuit_never_fetches() {
        let site = FakeSite::new(&[]);
        let mut opp = opportunity_with_url("https://example.org");
        opp.description = Some("Apply at https://example.org/apply-now".into());

        let result = finder(site.clone(), 2).discover(&opp).await;
        assert_eq!(
            result.application_url.as_deref(),
            Some("https://example.org/apply-now")
        );
        assert_eq!(result.confidence, 1.0);
        assert!(result.visited_urls.is_empty());
        assert_eq!(site.fetch_count(), 0);
    }

    #[tokio::test]
    async fn apply_link_on_start_page_scores_085() {
        let site = FakeSite::new(&[(
            "https://example.org",
            r#"<a href="/apply">Apply for this grant</a>"#,
        )]);
        let result = finder(site, 2)
            .discover(&opportunity_with_url("https://example.org"))
            .await;
        assert_eq!(result.application_url.as_deref(), Some("https://example.org/apply"));
        assert_eq!(result.confidence, 0.85);
        assert_eq!(result.visited_urls, vec!["https://example.org".to_string()]);
    }

    #[tokio::test]
    async fn apply_link_one_level_deep_scores_075() {
        let site = FakeSite::new(&[
            (
                "https://example.org",
                r#"<a href="/funding">Funding portal</a>"#,
            ),
            (
                "https://example.org/funding",
                r#"<a href="/funding/apply">Submit a proposal</a>"#,
            ),
        ]);
        let result = finder(site, 2)
            .discover(&opportunity_with_url("https://example.org"))
            .await;
        assert_eq!(
            result.application_url.as_deref(),
            Some("https://example.org/funding/apply")
        );
        assert_eq!(result.confidence, 0.75);
        assert_eq!(
            result.visited_urls,
            vec![
                "https://example.org".to_string(),
                "https://example.org/funding".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn depth_zero_without_apply_link_falls_back() {
        let site = FakeSite::new(&[(
            "https://example.org",
            r#"<a href="/funding">Funding portal</a>"#,
        )]);
        let result = finder(site.clone(), 0)
            .discover_path("https://example.org")
            .await;
        assert_eq!(result.application_url, None);
        assert_eq!(result.confidence, 0.2);
        // depth 0 means the frontier link is never followed
        assert_eq!(site.fetch_count(), 1);
    }

    #[tokio::test]
    async fn cyclic_links_terminate_without_revisits() {
        let site = FakeSite::new(&[
            (
                "https://example.org",
                r#"<a href="https://example.org/portal">Portal</a>"#,
            ),
            (
                "https://example.org/portal",
                r#"<a href="https://example.org">Funding home</a>"#,
            ),
        ]);
        let result = finder(site.clone(), 5)
            .discover_path("https://example.org")
            .await;
        assert_eq!(result.application_url, None);
        assert_eq!(site.fetch_count(), 2);
        let unique: HashSet<&String> = result.visited_urls.iter().collect();
        assert_eq!(unique.len(), result.visited_urls.len());
    }

    #[tokio::test]
    async fn fetch_failure_skips_to_next_candidate() {
        let site = FakeSite::new(&[(
            "https://backup.example.org",
            r#"<a href="/apply">Apply</a>"#,
        )]);
        let mut opp = opportunity_with_url("https://down.example.org");
        opp.synopsis_url = Some("https://backup.example.org".into());

        let result = finder(site, 1).discover(&opp).await;
        assert_eq!(
            result.application_url.as_deref(),
            Some("https://backup.example.org/apply")
        );
        // the failed start URL still shows up in the audit trail
        assert!(result
            .visited_urls
            .contains(&"https://down.example.org".to_string()));
    }

    #[tokio::test]
    async fn exhausted_crawl_generates_contact_instructions() {
        let site = FakeSite::new(&[]);
        let mut opp = opportunity_with_url("https://down.example.org");
        opp.agency = Some("Department of Education".into());
        opp.contact_email = Some("grants@ed.example.gov".into());
        opp.close_date = Some("2025-09-30".into());

        let result = finder(site, 2).discover(&opp).await;
        assert_eq!(result.application_url, None);
        assert_eq!(result.confidence, 0.2);
        assert!(result
            .instructions
            .iter()
            .any(|i| i.contains("Department of Education")));
        assert!(result.instructions.iter().any(|i| i.contains("grants@ed.example.gov")));
        assert!(result.instructions.iter().any(|i| i.contains("2025-09-30")));
        assert!(result.notes.is_some());
    }
}
