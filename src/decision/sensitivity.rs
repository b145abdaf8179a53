//! Sensitivity gate.
//!
//! A regex pre-filter over the message and the recent conversation catches
//! obvious cases without a model call:
//! - open conflict between people
//! - anger or frustration
//! - complaints and criticism
//! - personal matters
//! - politics and religion
//! - insults
//! - workplace tension (firing, salary, HR)
//!
//! Anything the rules don't catch is classified by the language capability.
//! When classification fails twice the conversation is treated as sensitive.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::Principal;
use crate::decision::capability::{
    ClassifyRequest, ClassifyTask, LanguageCapability, classify_with_retry,
};
use crate::decision::types::{
    Message, SensitivityLevel, SensitivityVerdict, Source, UrgencyAssessment,
};

/// Context messages scanned by the pre-filter, newest first.
const SCANNED_CONTEXT_MESSAGES: usize = 5;

/// A compiled pattern and the factor it reports.
#[derive(Debug, Clone)]
pub struct SensitivityRule {
    pub factor: String,
    pub regex: Regex,
}

/// Pre-model pattern matcher.
pub struct SensitivityRules {
    rules: Vec<SensitivityRule>,
}

impl SensitivityRules {
    /// Rules covering the common sensitive categories.
    pub fn default_rules() -> Self {
        let table: &[(&str, &str)] = &[
            (
                "interpersonal conflict",
                r"(?i)\b(you always|you never|your fault|not my fault|stop blaming|that'?s not fair|stop arguing)\b",
            ),
            (
                "anger or frustration",
                r"(?i)\b(furious|pissed( off)?|fed up|sick of|so annoyed|frustrat(ed|ing)|angry|wtf)\b",
            ),
            (
                "complaint or criticism",
                r"(?i)\b(unacceptable|ridiculous|terrible (job|work)|(this|that) is the worst|fed up with)\b",
            ),
            (
                "personal matter",
                r"(?i)\b(divorce|funeral|passed away|diagnos(is|ed)|pregnan(t|cy)|break ?up|therapist|mental health)\b",
            ),
            (
                "politics or religion",
                r"(?i)\b(elections?|democrats?|republicans?|abortion|religio(n|us)|politic(s|al)|church|mosque)\b",
            ),
            (
                "insult",
                r"(?i)\b(idiot|stupid|moron|incompetent|useless|dumbass|shut up)\b",
            ),
            (
                "workplace tension",
                r"(?i)\b(layoffs?|getting fired|fire (him|her|them)|salary|pay raise|hr complaint|report(ed)? .{0,20} to hr)\b",
            ),
        ];

        let rules = table
            .iter()
            .map(|(factor, pattern)| SensitivityRule {
                factor: (*factor).to_string(),
                regex: Regex::new(pattern).expect("static sensitivity pattern"),
            })
            .collect();

        Self { rules }
    }

    /// No rules. Every conversation goes to the model.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a custom rule.
    pub fn add_rule(&mut self, pattern: &str, factor: &str) -> Result<(), regex::Error> {
        self.rules.push(SensitivityRule {
            factor: factor.into(),
            regex: Regex::new(pattern)?,
        });
        Ok(())
    }

    /// Factors matched by the message or the recent context, deduplicated.
    pub fn evaluate(&self, message: &Message, channel_context: &[Message]) -> Vec<String> {
        let recent = channel_context.iter().rev().take(SCANNED_CONTEXT_MESSAGES);
        let texts: Vec<&str> = std::iter::once(message)
            .chain(recent)
            .map(|m| m.text.as_str())
            .collect();

        self.rules
            .iter()
            .filter(|rule| texts.iter().any(|t| rule.regex.is_match(t)))
            .map(|rule| rule.factor.clone())
            .collect()
    }
}

pub struct SensitivityGate {
    capability: Arc<dyn LanguageCapability>,
    rules: SensitivityRules,
    principal: Principal,
    timeout: Duration,
}

impl SensitivityGate {
    pub fn new(
        capability: Arc<dyn LanguageCapability>,
        rules: SensitivityRules,
        principal: Principal,
        timeout: Duration,
    ) -> Self {
        Self {
            capability,
            rules,
            principal,
            timeout,
        }
    }

    /// Verdict for a level that skips the gate.
    pub fn bypass(reason: &str) -> SensitivityVerdict {
        SensitivityVerdict {
            is_safe: true,
            level: SensitivityLevel::Low,
            factors: Vec::new(),
            rationale: reason.to_string(),
            source: Source::Bypass,
        }
    }

    /// Decide whether replying is safe. Never fails.
    pub async fn check(
        &self,
        message: &Message,
        channel_context: &[Message],
        urgency: Option<&UrgencyAssessment>,
    ) -> SensitivityVerdict {
        let matched = self.rules.evaluate(message, channel_context);
        if !matched.is_empty() {
            debug!(
                message_id = %message.id,
                factors = ?matched,
                "Sensitivity rules matched, skipping model"
            );
            return SensitivityVerdict {
                is_safe: false,
                level: SensitivityLevel::High,
                rationale: format!("matched: {}", matched.join(", ")),
                factors: matched,
                source: Source::Heuristic,
            };
        }

        let request = ClassifyRequest::new(
            ClassifyTask::Sensitivity,
            message.clone(),
            channel_context.to_vec(),
            self.principal.clone(),
        )
        .with_urgency(urgency.cloned());

        match classify_with_retry(self.capability.as_ref(), &request, self.timeout, |c| {
            SensitivityLevel::parse(&c.label)
        })
        .await
        {
            Ok((level, classification)) => SensitivityVerdict {
                is_safe: !level.is_sensitive(),
                level,
                factors: classification.factors,
                rationale: classification.rationale,
                source: Source::Model,
            },
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    error = %e,
                    "Sensitivity check failed, treating conversation as sensitive"
                );
                SensitivityVerdict {
                    is_safe: false,
                    level: SensitivityLevel::High,
                    factors: Vec::new(),
                    rationale: format!("classification unavailable ({})", e.label()),
                    source: Source::Fallback,
                }
            }
        }
    }
}
