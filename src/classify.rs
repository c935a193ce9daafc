//! Reply classification — ordered, first-match-wins keyword rules.
//!
//! A single deterministic label per message: rules are checked in order
//! and the first hit wins, so a body mentioning several keyword classes
//! resolves by rule priority, not by which check happens to run last.

use tracing::debug;

use crate::stage::Stage;

/// One classification rule: a target stage plus the keywords that select
/// it. `masked` phrases are blanked out of the text before this rule's
/// keywords are checked, so a negated mention ("not interested") cannot
/// satisfy a positive rule.
#[derive(Debug, Clone)]
struct StageRule {
    stage: Stage,
    keywords: Vec<String>,
    masked: Vec<String>,
}

impl StageRule {
    fn matches(&self, text: &str) -> bool {
        let scrubbed: std::borrow::Cow<'_, str> = if self.masked.is_empty() {
            text.into()
        } else {
            let mut owned = text.to_string();
            for phrase in &self.masked {
                owned = owned.replace(phrase.as_str(), " ");
            }
            owned.into()
        };
        self.keywords.iter().any(|k| scrubbed.contains(k.as_str()))
    }
}

/// Pure mapping from `(subject, body)` to a stage-transition label.
pub struct ResponseClassifier {
    rules: Vec<StageRule>,
}

impl ResponseClassifier {
    /// Build the default rule set. `scheduling_domain` is the booking-link
    /// domain whose mention confirms a scheduled demo.
    pub fn new(scheduling_domain: &str) -> Self {
        let rules = vec![
            StageRule {
                stage: Stage::DemoScheduled,
                keywords: vec![
                    scheduling_domain.to_lowercase(),
                    "scheduled".to_string(),
                    "appointment".to_string(),
                ],
                masked: Vec::new(),
            },
            StageRule {
                stage: Stage::Interested,
                keywords: vec![
                    "interested".to_string(),
                    "tell me more".to_string(),
                    "demo".to_string(),
                    "learn more".to_string(),
                ],
                masked: vec![
                    "not interested".to_string(),
                    "no longer interested".to_string(),
                    "uninterested".to_string(),
                ],
            },
            StageRule {
                stage: Stage::NotInterested,
                keywords: vec![
                    "not interested".to_string(),
                    "unsubscribe".to_string(),
                    "remove me".to_string(),
                    "stop".to_string(),
                ],
                masked: Vec::new(),
            },
        ];
        Self { rules }
    }

    /// Classify a message. Matching is case-insensitive substring search
    /// over subject + plain-text body. `is_tracked_reply` enables the
    /// default `responded` label for replies that match no keyword rule;
    /// an unmatched non-reply produces no label at all.
    pub fn classify(&self, subject: &str, body: &str, is_tracked_reply: bool) -> Option<Stage> {
        let text = format!("{}\n{}", subject, body).to_lowercase();

        for rule in &self.rules {
            if rule.matches(&text) {
                debug!(stage = %rule.stage, "Reply matched classification rule");
                return Some(rule.stage);
            }
        }

        if is_tracked_reply {
            Some(Stage::Responded)
        } else {
            None
        }
    }
}
