//! Reply text production.
//!
//! Three branches: a fixed template for the trigger keyword, a generic
//! deflection for sensitive conversations, and a model-written reply in the
//! principal's voice for everything else.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::config::Principal;
use crate::decision::capability::{
    GenerateRequest, LanguageCapability, PROMPT_VERSION, generate_with_retry,
};
use crate::decision::types::{Message, UrgencyLevel};

/// Reply sent for the trigger keyword.
pub const KEYWORD_REPLY: &str = "Hi! 🎯 I picked up the trigger keyword in your message. \
     This is a test reply from the automatic responder: keyword detection and delayed \
     replies are working.";

/// Deflections used for sensitive conversations. None of them refer to the
/// conversation itself.
pub const EVASION_REPLIES: &[&str] = &[
    "Let's talk about it later 👍",
    "I'll look at it later",
    "Can't right now, let's talk later",
    "I'll check it afterwards",
    "Let's chat about it later",
    "We'll look at it later",
    "Busy at the moment, talk later",
    "I'll review it when I can",
    "Let's pick this up later",
    "We'll sort it out later",
];

pub struct ResponseGenerator {
    capability: Arc<dyn LanguageCapability>,
    principal: Principal,
    timeout: Duration,
    max_chars: usize,
}

impl ResponseGenerator {
    pub fn new(
        capability: Arc<dyn LanguageCapability>,
        principal: Principal,
        timeout: Duration,
        max_chars: usize,
    ) -> Self {
        Self {
            capability,
            principal,
            timeout,
            max_chars,
        }
    }

    /// Fixed reply for the keyword fast path.
    pub fn keyword_reply(&self) -> String {
        KEYWORD_REPLY.to_string()
    }

    /// A deflection picked at random from [`EVASION_REPLIES`].
    pub fn evasion_reply(&self) -> String {
        EVASION_REPLIES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("Let's talk later")
            .to_string()
    }

    /// Reply written by the language capability. `None` when generation
    /// failed twice or produced nothing usable.
    pub async fn generated_reply(
        &self,
        message: &Message,
        channel_context: &[Message],
        style_examples: &[Message],
        urgency: Option<UrgencyLevel>,
    ) -> Option<String> {
        let request = GenerateRequest {
            version: PROMPT_VERSION,
            message: message.clone(),
            channel_context: channel_context.to_vec(),
            style_examples: style_examples.to_vec(),
            urgency,
            principal: self.principal.clone(),
            max_chars: self.max_chars,
        };

        match generate_with_retry(self.capability.as_ref(), &request, self.timeout).await {
            Ok(text) => {
                let bounded = truncate(text.trim(), self.max_chars);
                debug!(
                    message_id = %message.id,
                    chars = bounded.chars().count(),
                    "Reply generated"
                );
                (!bounded.is_empty()).then_some(bounded)
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Reply generation failed");
                None
            }
        }
    }
}

/// Cut `s` to at most `max` chars, preferring the last word boundary.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .nth(max)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let head = &s[..end];
    let cut = match head.rfind(char::is_whitespace) {
        Some(space) if space > 0 => &head[..space],
        _ => head,
    };
    cut.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::decision::capability::{Classification, ClassifyRequest};
    use crate::error::CapabilityError;

    struct Writer {
        reply: Option<String>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LanguageCapability for Writer {
        async fn classify(&self, _r: &ClassifyRequest) -> Result<Classification, CapabilityError> {
            unimplemented!("generator never classifies")
        }

        async fn generate(&self, _r: &GenerateRequest) -> Result<String, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().ok_or(CapabilityError::Timeout {
                task: "generate".into(),
                timeout: Duration::from_secs(1),
            })
        }
    }

    fn generator(reply: Option<&str>, max_chars: usize) -> (ResponseGenerator, Arc<Writer>) {
        let cap = Arc::new(Writer {
            reply: reply.map(String::from),
            calls: AtomicU32::new(0),
        });
        let generator =
            ResponseGenerator::new(cap.clone(), Principal::default(), Duration::from_secs(1), max_chars);
        (generator, cap)
    }

    #[test]
    fn evasion_is_always_from_the_fixed_list() {
        let (generator, _) = generator(None, 100);
        for _ in 0..50 {
            let text = generator.evasion_reply();
            assert!(EVASION_REPLIES.contains(&text.as_str()));
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world again", 12), "hello world");
        assert_eq!(truncate("ñññññññññ", 4), "ññññ");
        assert_eq!(truncate("🎯🎯🎯", 2).chars().count(), 2);
    }

    #[tokio::test]
    async fn generated_reply_is_trimmed_and_bounded() {
        let (generator, _) = generator(Some("  sure thing, deploying the fix right now  "), 20);
        let text = generator
            .generated_reply(&Message::new("m1", "C1", "U1", "fix?"), &[], &[], Some(UrgencyLevel::High))
            .await
            .unwrap();
        assert!(text.chars().count() <= 20);
        assert_eq!(text, "sure thing,");
    }

    #[tokio::test]
    async fn failed_generation_yields_nothing_after_one_retry() {
        let (generator, cap) = generator(None, 100);
        let text = generator
            .generated_reply(&Message::new("m1", "C1", "U1", "fix?"), &[], &[], None)
            .await;
        assert!(text.is_none());
        assert_eq!(cap.calls.load(Ordering::SeqCst), 2);
    }
}
