//! Challenge detection module.
//!
//! Classifies upstream markup as an anti-automation interstitial or as normal
//! application content. Two entry points share one signal set:
//! [`ChallengeDetector::classify_page`] parses the document and walks the DOM,
//! while [`ChallengeDetector::is_challenge_text`] only runs substring checks
//! and is used on fetched bodies and stream chunks.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

/// Rule that caused a page to be classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageVerdict {
    /// Interstitial detected; carries the matching rule.
    Challenge(ChallengeSignal),
    /// Regular content; carries the rule that cleared it.
    Normal(NormalSignal),
}

impl PageVerdict {
    pub fn is_challenge(&self) -> bool {
        matches!(self, PageVerdict::Challenge(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeSignal {
    Title(String),
    IndicatorNode(String),
    BodyPhrase(String),
    ScriptMarker(String),
    SparseDocument(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalSignal {
    Structure(usize),
    Default,
}

/// Literal strings and selectors consulted by the detector.
///
/// Every list can be replaced to follow upstream markup changes; matching on
/// strings is case-insensitive.
#[derive(Debug, Clone)]
pub struct DetectionSignals {
    pub title_markers: Vec<String>,
    pub indicator_selectors: Vec<String>,
    pub body_phrases: Vec<String>,
    pub script_markers: Vec<String>,
    pub normal_selectors: Vec<String>,
    /// Distinct normal selectors that must match to clear a page.
    pub normal_threshold: usize,
    /// Documents with fewer element nodes are treated as interstitials.
    pub min_node_count: usize,
}

impl Default for DetectionSignals {
    fn default() -> Self {
        Self {
            title_markers: strings(&["Just a moment", "Checking your browser", "Please wait"]),
            indicator_selectors: strings(&[
                "#challenge-form",
                "#challenge-running",
                "#challenge-stage",
                "#challenge-body-text",
                "#cf-challenge-running",
                "#cf-please-wait",
                "#trk_jschal_js",
                ".cf-browser-verification",
                ".cf-im-under-attack",
            ]),
            body_phrases: strings(&[
                "verify you are human",
                "verifying you are human",
                "checking if the site connection is secure",
                "needs to review the security of your connection",
                "ddos protection by",
                "enable javascript and cookies to continue",
                "please enable javascript",
            ]),
            script_markers: strings(&[
                "_cf_chl_opt",
                "__cf_chl_",
                "cf_chl_prog",
                "/cdn-cgi/challenge-platform/h/",
            ]),
            normal_selectors: strings(&[
                "nav",
                "header",
                "main",
                "textarea",
                "[contenteditable=\"true\"]",
                "footer",
                "aside",
            ]),
            normal_threshold: 3,
            min_node_count: 50,
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Pure classifier for challenge pages; no network or timing side effects.
#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    signals: DetectionSignals,
    indicator_selectors: Vec<(String, Selector)>,
    normal_selectors: Vec<Selector>,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeDetector {
    pub fn new() -> Self {
        Self::with_signals(DetectionSignals::default())
    }

    /// Builds a detector from a custom signal set. Selectors that fail to
    /// parse are dropped with a warning.
    pub fn with_signals(signals: DetectionSignals) -> Self {
        let indicator_selectors = signals
            .indicator_selectors
            .iter()
            .filter_map(|raw| compile_selector(raw).map(|selector| (raw.clone(), selector)))
            .collect();
        let normal_selectors = signals
            .normal_selectors
            .iter()
            .filter_map(|raw| compile_selector(raw))
            .collect();

        Self {
            signals,
            indicator_selectors,
            normal_selectors,
        }
    }

    pub fn signals(&self) -> &DetectionSignals {
        &self.signals
    }

    /// `true` when `markup` is an interstitial page.
    pub fn is_challenge_page(&self, markup: &str) -> bool {
        self.classify_page(markup).is_challenge()
    }

    /// DOM-based classification, rules applied in order.
    pub fn classify_page(&self, markup: &str) -> PageVerdict {
        let document = Html::parse_document(markup);

        let title = document
            .select(&TITLE_SELECTOR)
            .next()
            .map(|node| node.text().collect::<String>().to_lowercase())
            .unwrap_or_default();
        if let Some(marker) = self
            .signals
            .title_markers
            .iter()
            .find(|marker| title.contains(&marker.to_lowercase()))
        {
            return PageVerdict::Challenge(ChallengeSignal::Title(marker.clone()));
        }

        if let Some((raw, _)) = self
            .indicator_selectors
            .iter()
            .find(|(_, selector)| document.select(selector).next().is_some())
        {
            return PageVerdict::Challenge(ChallengeSignal::IndicatorNode(raw.clone()));
        }

        let body_text = document
            .select(&BODY_SELECTOR)
            .next()
            .map(|body| body.text().collect::<Vec<_>>().join(" ").to_lowercase())
            .unwrap_or_default();
        if let Some(phrase) = find_marker(&body_text, &self.signals.body_phrases) {
            return PageVerdict::Challenge(ChallengeSignal::BodyPhrase(phrase));
        }

        let scripts = document
            .select(&SCRIPT_SELECTOR)
            .map(|script| {
                let mut content = script.text().collect::<String>();
                if let Some(src) = script.value().attr("src") {
                    content.push(' ');
                    content.push_str(src);
                }
                content.to_lowercase()
            })
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(marker) = find_marker(&scripts, &self.signals.script_markers) {
            return PageVerdict::Challenge(ChallengeSignal::ScriptMarker(marker));
        }

        let structure = self
            .normal_selectors
            .iter()
            .filter(|selector| document.select(selector).next().is_some())
            .count();
        if structure >= self.signals.normal_threshold {
            return PageVerdict::Normal(NormalSignal::Structure(structure));
        }

        let node_count = document.select(&ANY_SELECTOR).count();
        if node_count < self.signals.min_node_count {
            return PageVerdict::Challenge(ChallengeSignal::SparseDocument(node_count));
        }

        PageVerdict::Normal(NormalSignal::Default)
    }

    /// Substring-only classification for fetched bodies and stream chunks.
    pub fn is_challenge_text(&self, body: &str) -> bool {
        self.classify_text(body).is_some()
    }

    pub fn classify_text(&self, body: &str) -> Option<ChallengeSignal> {
        let lowered = body.to_lowercase();

        if let Some(title) = TITLE_RE
            .captures(&lowered)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            && let Some(marker) = find_marker(&title, &self.signals.title_markers)
        {
            return Some(ChallengeSignal::Title(marker));
        }

        if let Some(indicator) = self
            .signals
            .indicator_selectors
            .iter()
            .map(|raw| raw.trim_start_matches(['#', '.']))
            .find(|token| !token.is_empty() && lowered.contains(&token.to_lowercase()))
        {
            return Some(ChallengeSignal::IndicatorNode(indicator.to_string()));
        }

        if let Some(phrase) = find_marker(&lowered, &self.signals.body_phrases) {
            return Some(ChallengeSignal::BodyPhrase(phrase));
        }

        find_marker(&lowered, &self.signals.script_markers).map(ChallengeSignal::ScriptMarker)
    }
}

fn find_marker(haystack: &str, markers: &[String]) -> Option<String> {
    markers
        .iter()
        .find(|marker| haystack.contains(&marker.to_lowercase()))
        .cloned()
}

fn compile_selector(raw: &str) -> Option<Selector> {
    match Selector::parse(raw) {
        Ok(selector) => Some(selector),
        Err(err) => {
            log::warn!("ignoring invalid detection selector `{raw}`: {err}");
            None
        }
    }
}

static TITLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static BODY_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());
static SCRIPT_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("script").unwrap());
static ANY_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("*").unwrap());

static TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    regex::RegexBuilder::new(r"<title[^>]*>([^<]*)</title>")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid title regex")
});

#[cfg(test)]
mod tests {
    use super::*;

    fn normal_page() -> String {
        r#"
            <html><head><title>Arena</title></head>
            <body>
              <header><nav><a href="/">Home</a></nav></header>
              <main><textarea placeholder="Ask anything"></textarea></main>
            </body></html>
        "#
        .to_string()
    }

    #[test]
    fn title_marker_wins() {
        let html = "<html><head><title>Just a moment...</title></head><body><main></main></body></html>";
        let detector = ChallengeDetector::new();
        assert_eq!(
            detector.classify_page(html),
            PageVerdict::Challenge(ChallengeSignal::Title("Just a moment".into()))
        );
        assert!(detector.is_challenge_text(html));
    }

    #[test]
    fn structural_markers_clear_small_page() {
        let detector = ChallengeDetector::new();
        let verdict = detector.classify_page(&normal_page());
        assert_eq!(verdict, PageVerdict::Normal(NormalSignal::Structure(4)));
        assert!(!detector.is_challenge_text(&normal_page()));
    }

    #[test]
    fn indicator_node_detected() {
        let html = r#"<html><body><div id="challenge-stage"></div><nav></nav><main></main><header></header></body></html>"#;
        let verdict = ChallengeDetector::new().classify_page(html);
        assert_eq!(
            verdict,
            PageVerdict::Challenge(ChallengeSignal::IndicatorNode("#challenge-stage".into()))
        );
    }

    #[test]
    fn body_phrase_detected() {
        let html = "<html><body><p>Please verify you are human to continue.</p></body></html>";
        assert!(matches!(
            ChallengeDetector::new().classify_page(html),
            PageVerdict::Challenge(ChallengeSignal::BodyPhrase(_))
        ));
    }

    #[test]
    fn script_marker_detected() {
        let html = "<html><body><script>window._cf_chl_opt = {cType: 'managed'};</script></body></html>";
        assert!(matches!(
            ChallengeDetector::new().classify_page(html),
            PageVerdict::Challenge(ChallengeSignal::ScriptMarker(_))
        ));
    }

    #[test]
    fn sparse_document_is_suspicious() {
        let html = "<html><body><div>loading</div></body></html>";
        assert!(matches!(
            ChallengeDetector::new().classify_page(html),
            PageVerdict::Challenge(ChallengeSignal::SparseDocument(_))
        ));
    }

    #[test]
    fn large_unstructured_page_is_normal() {
        let items: String = (0..60).map(|i| format!("<p>item {i}</p>")).collect();
        let html = format!("<html><body>{items}</body></html>");
        assert_eq!(
            ChallengeDetector::new().classify_page(&html),
            PageVerdict::Normal(NormalSignal::Default)
        );
    }

    #[test]
    fn custom_signals_override_defaults() {
        let signals = DetectionSignals {
            title_markers: vec!["Hold on".into()],
            ..DetectionSignals::default()
        };
        let detector = ChallengeDetector::with_signals(signals);
        assert!(detector.is_challenge_text("<title>Hold on!</title>"));
        assert!(!detector.is_challenge_text("<title>Just a moment...</title><p>hi</p>"));
    }

    #[test]
    fn text_variant_ignores_plain_stream_data() {
        let detector = ChallengeDetector::new();
        assert!(!detector.is_challenge_text("a0:\"Just a moment, let me think\"\n"));
        assert!(detector.is_challenge_text("<div class=\"cf-browser-verification\"></div>"));
    }
}
