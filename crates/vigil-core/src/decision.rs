//! Block/allow decisions against the active category set.
//!
//! Categories are evaluated in ascending id order and the first category
//! producing a block wins. Within a category, exception rules are checked
//! before blocking rules and a matching exception short-circuits that
//! category to "allow". This ordering is externally observable through the
//! reporting callbacks and is part of the contract.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::category::CategoryId;
use crate::index::RuleIndex;
use crate::rules::{RequestUrl, ResourceKind};

/// A block decision, reported to the embedder for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReport {
    /// The category the matching rule was loaded into.
    pub category: CategoryId,
    /// The source text of the matching rule.
    pub rule: String,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum RequestVerdict {
    /// No enabled category produced a block.
    Allow,
    /// A blocking rule matched and no exception overrode it.
    Block(BlockReport),
}

impl RequestVerdict {
    /// Returns true if the request should be blocked.
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block(_))
    }
}

/// Element-hiding selectors collected for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementReport {
    /// Deduplicated selectors to strip, in stable (sorted) order.
    pub selectors: Vec<String>,
}

/// A text-trigger hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMatch {
    pub category: CategoryId,
    /// The literal substring that matched.
    pub trigger: String,
}

/// Read-only query surface over a [`RuleIndex`]. Never mutates the index.
#[derive(Clone)]
pub struct DecisionEngine {
    index: Arc<RuleIndex>,
}

impl DecisionEngine {
    /// Creates an engine reading from `index`.
    pub fn new(index: Arc<RuleIndex>) -> Self {
        Self { index }
    }

    /// The index this engine reads from.
    pub fn index(&self) -> &Arc<RuleIndex> {
        &self.index
    }

    fn enabled_categories(&self) -> impl Iterator<Item = CategoryId> + '_ {
        (0..=u8::MAX).filter(|id| self.index.is_enabled(*id))
    }

    /// Decides whether a request is blocked.
    ///
    /// Within each enabled category (ascending id order) exceptions are
    /// checked first; a matching exception yields "allow" for that category
    /// and evaluation moves on. The first category with an unexcepted
    /// blocking match wins.
    pub fn evaluate_request(
        &self,
        method: &str,
        url: &str,
        requesting_domain: &str,
        resource: ResourceKind,
    ) -> RequestVerdict {
        let request = RequestUrl::parse(url);
        let requesting_domain = requesting_domain.to_ascii_lowercase();

        for category in self.enabled_categories() {
            let rules = self.index.rules(category);
            if rules.is_empty() {
                continue;
            }

            if rules
                .exceptions
                .iter()
                .any(|rule| rule.matches(&request, &requesting_domain, resource))
            {
                continue;
            }

            if let Some(rule) = rules
                .blocking
                .iter()
                .find(|rule| rule.matches(&request, &requesting_domain, resource))
            {
                tracing::debug!(method, url, category, rule = %rule.raw, "request blocked");
                return RequestVerdict::Block(BlockReport {
                    category,
                    rule: rule.raw.clone(),
                });
            }
        }

        RequestVerdict::Allow
    }

    /// Collects the element-hiding selectors to strip from a document
    /// served by `requesting_domain`.
    ///
    /// `#@#` exception selectors suppress identical selectors from any
    /// category. Only selectors whose bare tail token appears in the
    /// document are returned; precise selector evaluation is left to the
    /// external HTML pipeline, which also performs the actual removal.
    pub fn evaluate_elements(&self, html_document: &str, requesting_domain: &str) -> ElementReport {
        let domain = requesting_domain.to_ascii_lowercase();
        let mut selectors = BTreeSet::new();
        let mut excepted = BTreeSet::new();

        for category in self.enabled_categories() {
            let rules = self.index.rules(category);
            for rule in &rules.hiding {
                if !rule.applies_to(&domain) {
                    continue;
                }
                if rule.exception {
                    excepted.insert(rule.selector.clone());
                } else if document_mentions(html_document, &rule.selector) {
                    selectors.insert(rule.selector.clone());
                }
            }
        }

        ElementReport {
            selectors: selectors.difference(&excepted).cloned().collect(),
        }
    }

    /// Scans `payload` against the enabled categories' text triggers and
    /// returns the first match, in ascending category order then load
    /// order.
    pub fn evaluate_text_triggers(&self, payload: &str) -> Option<TriggerMatch> {
        for category in self.enabled_categories() {
            let triggers = self.index.triggers(category);
            if let Some(hit) = triggers.iter().find(|t| payload.contains(&t.text)) {
                tracing::debug!(category, trigger = %hit.text, "text trigger matched");
                return Some(TriggerMatch {
                    category,
                    trigger: hit.text.clone(),
                });
            }
        }
        None
    }
}

/// Cheap containment probe: does the document mention the selector's tail
/// token (class or id name) at all? Avoids handing the pipeline selectors
/// that cannot possibly match.
fn document_mentions(html: &str, selector: &str) -> bool {
    let tail = selector
        .rsplit([' ', '>', '+', '~'])
        .next()
        .unwrap_or(selector)
        .trim_start_matches(['.', '#']);
    tail.is_empty() || html.contains(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;

    fn engine_with(lists: &[(CategoryId, &str)]) -> DecisionEngine {
        let index = Arc::new(RuleIndex::new());
        for (category, text) in lists {
            index.load_rules(text, *category, false);
            if let Some(cat) = Category::new(*category) {
                index.set_enabled(cat, true);
            }
        }
        DecisionEngine::new(index)
    }

    #[test]
    fn no_rules_means_allow() {
        let engine = engine_with(&[]);
        let verdict = engine.evaluate_request(
            "GET",
            "https://example.com/",
            "example.com",
            ResourceKind::Document,
        );
        assert_eq!(verdict, RequestVerdict::Allow);
    }

    #[test]
    fn blocking_rule_produces_report() {
        let engine = engine_with(&[(1, "||ads.example.com^\n")]);
        let verdict = engine.evaluate_request(
            "GET",
            "https://ads.example.com/x.js",
            "news.org",
            ResourceKind::Script,
        );
        assert_eq!(
            verdict,
            RequestVerdict::Block(BlockReport {
                category: 1,
                rule: "||ads.example.com^".to_string(),
            })
        );
    }

    #[test]
    fn disabled_category_is_ignored() {
        let index = Arc::new(RuleIndex::new());
        index.load_rules("||ads.example.com^\n", 1, false);
        // Category 1 never enabled.
        let engine = DecisionEngine::new(index);
        let verdict = engine.evaluate_request(
            "GET",
            "https://ads.example.com/x.js",
            "",
            ResourceKind::Script,
        );
        assert_eq!(verdict, RequestVerdict::Allow);
    }

    #[test]
    fn unfiltered_category_always_participates() {
        let engine = engine_with(&[(0, "||ads.example.com^\n")]);
        let verdict = engine.evaluate_request(
            "GET",
            "https://ads.example.com/x.js",
            "",
            ResourceKind::Script,
        );
        assert!(verdict.is_block());
    }

    #[test]
    fn exception_wins_within_category() {
        let engine = engine_with(&[(1, "||ads.example.com^\n@@||ads.example.com/safe.js\n")]);

        let safe = engine.evaluate_request(
            "GET",
            "https://ads.example.com/safe.js",
            "",
            ResourceKind::Script,
        );
        assert_eq!(safe, RequestVerdict::Allow);

        let other = engine.evaluate_request(
            "GET",
            "https://ads.example.com/other.js",
            "",
            ResourceKind::Script,
        );
        assert!(other.is_block());
    }

    #[test]
    fn lowest_category_id_wins_the_tie_break() {
        // Category 2 also blocks the URL; category 1 must be reported.
        let engine = engine_with(&[(2, "||ads.example.com^\n"), (1, "||ads.example.com^\n")]);
        let verdict = engine.evaluate_request(
            "GET",
            "https://ads.example.com/x.js",
            "",
            ResourceKind::Script,
        );
        match verdict {
            RequestVerdict::Block(report) => assert_eq!(report.category, 1),
            RequestVerdict::Allow => panic!("expected block"),
        }
    }

    #[test]
    fn third_party_rule_round_trip() {
        let engine = engine_with(&[(1, "||ads.example.com^$third-party\n")]);

        let third = engine.evaluate_request(
            "GET",
            "https://ads.example.com/x.js",
            "news.org",
            ResourceKind::Script,
        );
        assert!(third.is_block());

        let first = engine.evaluate_request(
            "GET",
            "https://ads.example.com/x.js",
            "example.com",
            ResourceKind::Script,
        );
        assert_eq!(first, RequestVerdict::Allow);
    }

    #[test]
    fn element_hiding_collects_applicable_selectors() {
        let engine = engine_with(&[(1, "##.banner-ad\nexample.com##div#promo\nother.org##.only-there\n")]);
        let html = r#"<div class="banner-ad"></div><div id="promo"></div>"#;

        let report = engine.evaluate_elements(html, "example.com");
        assert_eq!(report.selectors, vec![".banner-ad".to_string(), "div#promo".to_string()]);
    }

    #[test]
    fn element_hiding_skips_selectors_absent_from_document() {
        let engine = engine_with(&[(1, "##.banner-ad\n##.not-present\n")]);
        let html = r#"<div class="banner-ad"></div>"#;

        let report = engine.evaluate_elements(html, "example.com");
        assert_eq!(report.selectors, vec![".banner-ad".to_string()]);
    }

    #[test]
    fn hiding_exception_suppresses_selector() {
        let engine = engine_with(&[(1, "##.banner-ad\nexample.com#@#.banner-ad\n")]);
        let html = r#"<div class="banner-ad"></div>"#;

        let report = engine.evaluate_elements(html, "example.com");
        assert!(report.selectors.is_empty());

        // The exception is scoped to example.com only.
        let report = engine.evaluate_elements(html, "other.org");
        assert_eq!(report.selectors, vec![".banner-ad".to_string()]);
    }

    #[test]
    fn text_triggers_first_match_in_category_order() {
        let index = Arc::new(RuleIndex::new());
        index.load_text_triggers("casino\n", 2, false);
        index.load_text_triggers("poker\n", 1, false);
        index.set_enabled(Category::new(1).unwrap(), true);
        index.set_enabled(Category::new(2).unwrap(), true);
        let engine = DecisionEngine::new(index);

        let hit = engine
            .evaluate_text_triggers("an evening of poker and casino games")
            .unwrap();
        assert_eq!(hit.category, 1);
        assert_eq!(hit.trigger, "poker");

        assert!(engine.evaluate_text_triggers("nothing here").is_none());
    }

    #[test]
    fn verdict_serialization() {
        let verdict = RequestVerdict::Block(BlockReport {
            category: 3,
            rule: "||x.com^".to_string(),
        });
        let json = serde_json::to_string(&verdict).unwrap();
        let back: RequestVerdict = serde_json::from_str(&json).unwrap();
        assert_eq!(verdict, back);
    }
}
