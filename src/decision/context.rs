//! Conversation context consumed by the planner.

use async_trait::async_trait;

use crate::decision::types::Message;
use crate::error::ContextError;

/// Prefixes that mark a principal message as a poor style example
/// (questions, exclamations, slash commands, bare links).
const NON_STYLE_PREFIXES: &[&str] = &["?", "¿", "!", "/", "http"];

/// Minimum length, in chars, of a usable style example.
const MIN_STYLE_CHARS: usize = 6;

/// Source of channel history and of the principal's past messages.
///
/// Both methods return messages ordered oldest to newest. An empty result is
/// valid. Errors are treated as soft by the planner.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Most recent `limit` messages in a channel.
    async fn channel_context(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ContextError>;

    /// Most recent `limit` messages written by `user_id`, across channels.
    async fn principal_responses(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ContextError>;
}

/// Provider with no history. Every request returns an empty sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

#[async_trait]
impl ContextProvider for NoContext {
    async fn channel_context(&self, _: &str, _: usize) -> Result<Vec<Message>, ContextError> {
        Ok(Vec::new())
    }

    async fn principal_responses(&self, _: &str, _: usize) -> Result<Vec<Message>, ContextError> {
        Ok(Vec::new())
    }
}

/// Keep principal messages that read like normal conversational replies,
/// then retain only the newest `max`.
pub fn select_style_examples(responses: Vec<Message>, max: usize) -> Vec<Message> {
    let mut kept: Vec<Message> = responses
        .into_iter()
        .filter(|m| is_style_example(&m.text))
        .collect();
    if kept.len() > max {
        kept.drain(..kept.len() - max);
    }
    kept
}

fn is_style_example(text: &str) -> bool {
    let text = text.trim();
    text.chars().count() >= MIN_STYLE_CHARS
        && !NON_STYLE_PREFIXES.iter().any(|p| text.starts_with(p))
}

/// Drop the message under evaluation from its own channel history.
pub fn exclude_message(context: Vec<Message>, message_id: &str) -> Vec<Message> {
    context.into_iter().filter(|m| m.id != message_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, text: &str) -> Message {
        Message::new(id, "C1", "UP", text)
    }

    #[test]
    fn style_filter_drops_short_and_command_like_messages() {
        let kept = select_style_examples(
            vec![
                msg("1", "ok"),
                msg("2", "?what now"),
                msg("3", "¿qué pasa?"),
                msg("4", "!deploy prod"),
                msg("5", "/remind me later"),
                msg("6", "https://example.com/doc"),
                msg("7", "sounds good, ship it"),
            ],
            10,
        );
        let ids: Vec<&str> = kept.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["7"]);
    }

    #[test]
    fn style_filter_keeps_the_newest() {
        let input: Vec<Message> = (0..15)
            .map(|i| msg(&i.to_string(), "a normal reply"))
            .collect();
        let kept = select_style_examples(input, 10);
        assert_eq!(kept.len(), 10);
        assert_eq!(kept.first().map(|m| m.id.as_str()), Some("5"));
        assert_eq!(kept.last().map(|m| m.id.as_str()), Some("14"));
    }

    #[test]
    fn five_chars_is_too_short() {
        assert!(!is_style_example("hello"));
        assert!(is_style_example("hello!"));
    }

    #[test]
    fn excludes_the_evaluated_message() {
        let ctx = vec![msg("a", "first"), msg("b", "second")];
        let out = exclude_message(ctx, "b");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "a");
    }

    #[tokio::test]
    async fn no_context_is_empty() {
        assert!(NoContext.channel_context("C1", 10).await.unwrap().is_empty());
        assert!(NoContext.principal_responses("U1", 10).await.unwrap().is_empty());
    }
}
