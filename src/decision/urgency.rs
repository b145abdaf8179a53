//! Urgency evaluation.
//!
//! Two deterministic fast paths run first (trigger keyword, then test
//! sender/channel). Everything else is classified by the language capability,
//! falling back to `medium` when classification fails twice.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{Principal, TriggerConfig};
use crate::decision::capability::{
    ClassifyRequest, ClassifyTask, LanguageCapability, classify_with_retry,
};
use crate::decision::types::{Message, Source, UrgencyAssessment, UrgencyLevel};

/// Level used when the capability cannot classify the message.
pub const FALLBACK_LEVEL: UrgencyLevel = UrgencyLevel::Medium;

pub struct UrgencyEvaluator {
    capability: Arc<dyn LanguageCapability>,
    triggers: TriggerConfig,
    principal: Principal,
    timeout: Duration,
}

impl UrgencyEvaluator {
    pub fn new(
        capability: Arc<dyn LanguageCapability>,
        mut triggers: TriggerConfig,
        principal: Principal,
        timeout: Duration,
    ) -> Self {
        triggers.keywords = triggers
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            capability,
            triggers,
            principal,
            timeout,
        }
    }

    /// Assess a message. Never fails; empty `channel_context` is valid.
    pub async fn evaluate(&self, message: &Message, channel_context: &[Message]) -> UrgencyAssessment {
        if let Some(assessment) = self.fast_path(message) {
            debug!(
                message_id = %message.id,
                urgency = %assessment.level,
                "Urgency decided by fast path"
            );
            return assessment;
        }

        let request = ClassifyRequest::new(
            ClassifyTask::Urgency,
            message.clone(),
            channel_context.to_vec(),
            self.principal.clone(),
        );

        match classify_with_retry(self.capability.as_ref(), &request, self.timeout, |c| {
            UrgencyLevel::parse_classified(&c.label)
        })
        .await
        {
            Ok((level, classification)) => UrgencyAssessment {
                level,
                rationale: classification.rationale,
                factors: classification.factors,
                source: Source::Model,
            },
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    error = %e,
                    fallback = %FALLBACK_LEVEL,
                    "Urgency classification failed, using fallback level"
                );
                UrgencyAssessment {
                    level: FALLBACK_LEVEL,
                    rationale: format!("classification unavailable ({})", e.label()),
                    factors: Vec::new(),
                    source: Source::Fallback,
                }
            }
        }
    }

    /// Deterministic levels that need no model call.
    fn fast_path(&self, message: &Message) -> Option<UrgencyAssessment> {
        if let Some(keyword) = self.matched_keyword(&message.text) {
            return Some(UrgencyAssessment {
                level: UrgencyLevel::Loco,
                rationale: format!("trigger keyword '{keyword}'"),
                factors: vec!["trigger_keyword".to_string()],
                source: Source::Keyword,
            });
        }

        let test_user = self.triggers.test_users.iter().any(|u| *u == message.user_id);
        let test_channel = self
            .triggers
            .test_channels
            .iter()
            .any(|c| *c == message.channel_id);
        if test_user || test_channel {
            return Some(UrgencyAssessment {
                level: UrgencyLevel::Test,
                rationale: if test_user {
                    "designated test sender".to_string()
                } else {
                    "designated test channel".to_string()
                },
                factors: vec!["test_trigger".to_string()],
                source: Source::TestTrigger,
            });
        }

        None
    }

    fn matched_keyword(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        self.triggers
            .keywords
            .iter()
            .find(|k| lowered.contains(k.as_str()))
            .map(String::as_str)
    }
}
