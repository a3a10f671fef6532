//! Conversation router — pure classification of inbound text.
//!
//! `route()` has no clock, no randomness, and no I/O: given the same user
//! record and text it always produces the same outcome. All side effects
//! (reply delivery, stage writes, enrollment) happen in the inbound handler.

use crate::campaign::GIFT_CAMPAIGN;
use crate::store::{Stage, UserRecord};

/// An out-of-band quick-choice affordance attached to a reply. Passed
/// through opaquely to the delivery gateway.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QuickChoice {
    pub label: String,
    pub text: String,
}

/// What to say back: a catalog key, or the literal fallback instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyText {
    CatalogKey(&'static str),
    Fallback,
}

/// The router's decision for one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub reply: ReplyText,
    /// Stage to advance to, if this transition moves the lattice.
    pub advance_to: Option<Stage>,
    /// Campaign to enroll the user in, if the transition triggers one.
    pub enroll: Option<&'static str>,
    pub quick_choices: Vec<QuickChoice>,
}

impl RouteOutcome {
    fn reply_only(key: &'static str) -> Self {
        Self {
            reply: ReplyText::CatalogKey(key),
            advance_to: None,
            enroll: None,
            quick_choices: Vec::new(),
        }
    }
}

/// Exact gift trigger phrases (compared case-insensitively).
const GIFT_TRIGGERS: &[&str] = &["receive gift", "🎁", "gift"];

/// Classify one inbound event against the user's conversation state.
///
/// Rules in fixed priority order, first match wins. A user still at stage
/// `New` has never been greeted — that first transition fires whatever the
/// text says. (A crash between user creation and the stage write re-greets
/// on the next event, which is the right recovery.)
pub fn route(record: &UserRecord, text: &str) -> RouteOutcome {
    let text = text.trim();
    let lowered = text.to_lowercase();

    if record.stage == Stage::New {
        return RouteOutcome {
            reply: ReplyText::CatalogKey("greeting"),
            advance_to: Some(Stage::Greeted),
            enroll: None,
            quick_choices: vec![QuickChoice {
                label: "🎁 Gift".to_string(),
                text: "receive gift".to_string(),
            }],
        };
    }

    if GIFT_TRIGGERS.iter().any(|t| lowered == *t) {
        return RouteOutcome {
            reply: ReplyText::CatalogKey("gift"),
            advance_to: Some(Stage::GiftEnrolled),
            // Enrollment is idempotent downstream: repeating the trigger
            // while a batch is live creates nothing new.
            enroll: Some(GIFT_CAMPAIGN),
            quick_choices: Vec::new(),
        };
    }

    if text.contains('⚡') || lowered.contains("activated") {
        return RouteOutcome::reply_only("activated");
    }

    if text.contains('🌹') || lowered.contains("rose") {
        return RouteOutcome::reply_only("rose_path");
    }

    RouteOutcome {
        reply: ReplyText::Fallback,
        advance_to: None,
        enroll: None,
        quick_choices: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn record(stage: Stage) -> UserRecord {
        UserRecord {
            user_id: "U1".to_string(),
            stage,
            joined_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn first_event_always_greets() {
        for text in ["hello", "gift", "🌹", "", "⚡ activated"] {
            let outcome = route(&record(Stage::New), text);
            assert_eq!(outcome.reply, ReplyText::CatalogKey("greeting"));
            assert_eq!(outcome.advance_to, Some(Stage::Greeted));
            assert!(outcome.enroll.is_none());
            assert_eq!(outcome.quick_choices.len(), 1);
            assert_eq!(outcome.quick_choices[0].text, "receive gift");
        }
    }

    #[test]
    fn gift_trigger_enrolls() {
        for text in ["gift", "GIFT", " Receive Gift ", "🎁"] {
            let outcome = route(&record(Stage::Greeted), text);
            assert_eq!(outcome.reply, ReplyText::CatalogKey("gift"));
            assert_eq!(outcome.advance_to, Some(Stage::GiftEnrolled));
            assert_eq!(outcome.enroll, Some(GIFT_CAMPAIGN));
        }
    }

    #[test]
    fn gift_trigger_is_exact_match() {
        // "gift" embedded in a sentence is not the trigger phrase.
        let outcome = route(&record(Stage::Greeted), "what gift?");
        assert_eq!(outcome.reply, ReplyText::Fallback);
        assert!(outcome.enroll.is_none());
    }

    #[test]
    fn activation_markers_match_substring() {
        for text in ["⚡", "it is ACTIVATED now", "activated"] {
            let outcome = route(&record(Stage::Greeted), text);
            assert_eq!(outcome.reply, ReplyText::CatalogKey("activated"));
            assert!(outcome.advance_to.is_none());
            assert!(outcome.enroll.is_none());
        }
    }

    #[test]
    fn rose_markers_match_substring() {
        for text in ["🌹", "the Rose path", "rose"] {
            let outcome = route(&record(Stage::GiftEnrolled), text);
            assert_eq!(outcome.reply, ReplyText::CatalogKey("rose_path"));
            assert!(outcome.advance_to.is_none());
            assert!(outcome.enroll.is_none());
        }
    }

    #[test]
    fn priority_order_gift_before_activation() {
        // "🎁" is an exact gift trigger even though other rules also scan
        // substrings; rule order decides.
        let outcome = route(&record(Stage::Greeted), "🎁");
        assert_eq!(outcome.reply, ReplyText::CatalogKey("gift"));
    }

    #[test]
    fn unmatched_text_gets_fallback() {
        let outcome = route(&record(Stage::Greeted), "how do I start?");
        assert_eq!(outcome.reply, ReplyText::Fallback);
        assert!(outcome.advance_to.is_none());
        assert!(outcome.enroll.is_none());
        assert!(outcome.quick_choices.is_empty());
    }

    #[test]
    fn routing_is_deterministic() {
        let a = route(&record(Stage::Greeted), "Receive Gift");
        let b = route(&record(Stage::Greeted), "Receive Gift");
        assert_eq!(a, b);
    }
}
