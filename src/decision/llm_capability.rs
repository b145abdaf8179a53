//! `LanguageCapability` backed by an `LlmProvider`.
//!
//! Each typed request becomes a system + user prompt pair. Classification
//! answers are JSON objects; generation answers are the reply text itself.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::Principal;
use crate::decision::capability::{
    Classification, ClassifyRequest, ClassifyTask, GenerateRequest, LanguageCapability,
};
use crate::decision::types::{Message, UrgencyLevel};
use crate::error::CapabilityError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Channel messages rendered into a prompt.
const PROMPT_CONTEXT_MESSAGES: usize = 5;

/// Per-message preview length inside a prompt.
const CONTEXT_PREVIEW_CHARS: usize = 300;

const CLASSIFY_MAX_TOKENS: u32 = 400;
const CLASSIFY_TEMPERATURE: f32 = 0.1;

const GENERATE_MAX_TOKENS: u32 = 400;
const GENERATE_TEMPERATURE: f32 = 0.7;

pub struct LlmCapability {
    llm: Arc<dyn LlmProvider>,
}

impl LlmCapability {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl LanguageCapability for LlmCapability {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, CapabilityError> {
        let task = request.task.label();
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt(request.task, &request.principal)),
            ChatMessage::user(build_classify_user_prompt(request)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self.llm.complete(completion).await?;
        debug!(
            message_id = %request.message.id,
            task,
            output_tokens = response.output_tokens,
            "Classification received"
        );

        parse_classification(&response.content).map_err(|reason| CapabilityError::Malformed {
            task: task.to_string(),
            reason,
        })
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, CapabilityError> {
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(build_generate_system_prompt(&request.principal, request.max_chars)),
            ChatMessage::user(build_generate_user_prompt(request)),
        ])
        .with_temperature(GENERATE_TEMPERATURE)
        .with_max_tokens(GENERATE_MAX_TOKENS);

        let response = self.llm.complete(completion).await?;
        Ok(clean_reply(&response.content))
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_classify_system_prompt(task: ClassifyTask, principal: &Principal) -> String {
    let body = match task {
        ClassifyTask::Urgency => "You rate the urgency of chat messages. Do not rely on words like \
             \"urgent\" or \"important\" alone. Weigh these factors:\n\
             - business impact (critical operations, customers, revenue)\n\
             - required response time\n\
             - dependencies (is someone blocked?)\n\
             - channel context (production, development, general)\n\
             - request type (critical bug, feature request, question)\n\
             - sender role\n\n\
             Levels:\n\
             - \"high\": needs attention within the hour, affects critical work\n\
             - \"medium\": needs attention within a few hours\n\
             - \"low\": can wait\n"
            .to_string(),
        ClassifyTask::ResponseNeed => format!(
            "You decide whether {name} ({role} at {company}) needs to answer a chat message.\n\n\
             Labels:\n\
             - \"direct\": addressed to {name} (mention, direct question, request) and expects an answer\n\
             - \"indirect\": expects an answer from someone, but not specifically {name}\n\
             - \"none\": no answer needed (FYI, chatter, acknowledgements)\n\n\
             Consider the recent conversation and the urgency already assessed.\n",
            name = principal.name,
            role = principal.role,
            company = principal.company,
        ),
        ClassifyTask::Sensitivity => format!(
            "You detect conversations {name} should stay out of. Look for:\n\
             - conflict or disagreement between people\n\
             - anger, frustration, annoyance\n\
             - complaints or criticism of people, work, or processes\n\
             - personal matters\n\
             - politics, religion, or other controversial topics\n\
             - workplace tension (managers vs reports, disputes)\n\
             - insults or offensive language\n\n\
             Levels:\n\
             - \"high\": clearly delicate, do not answer\n\
             - \"medium\": moderately sensitive\n\
             - \"low\": normal conversation, safe to answer\n",
            name = principal.name,
        ),
    };

    format!(
        "{body}\nRespond with ONLY a JSON object:\n\
         {{\"label\": \"...\", \"factors\": [\"...\"], \"rationale\": \"...\"}}\n\
         Keep the rationale to one sentence."
    )
}

fn build_classify_user_prompt(request: &ClassifyRequest) -> String {
    let mut prompt = String::with_capacity(512);

    push_header(&mut prompt, &request.message);
    push_context(&mut prompt, &request.channel_context);

    if let Some(ref urgency) = request.urgency {
        prompt.push_str(&format!(
            "\nUrgency: {} ({})\n",
            urgency.level, urgency.rationale
        ));
    }

    prompt.push_str(&format!("\nMessage:\n{}", request.message.text));
    prompt
}

fn build_generate_system_prompt(principal: &Principal, max_chars: usize) -> String {
    format!(
        "You are {name}, {role} at {company}, replying in a team chat.\n\n\
         Write exactly as {name} would: same tone, vocabulary, length, and emoji habits as \
         the example replies. Be direct and natural. The example replies only show style; \
         they are not part of the current conversation.\n\n\
         Match the urgency: pressing messages get a prompt, focused answer; low urgency \
         allows a relaxed tone.\n\n\
         Never describe yourself as an assistant or offer help in assistant phrasing. \
         Reply with the message text only, at most {max_chars} characters.",
        name = principal.name,
        role = principal.role,
        company = principal.company,
    )
}

fn build_generate_user_prompt(request: &GenerateRequest) -> String {
    let mut prompt = String::with_capacity(1024);

    push_header(&mut prompt, &request.message);
    push_context(&mut prompt, &request.channel_context);

    if let Some(level) = request.urgency {
        prompt.push_str(&format!("\nUrgency: {}\n", urgency_hint(level)));
    }

    if !request.style_examples.is_empty() {
        prompt.push_str("\nYour earlier replies (style only):\n");
        for example in &request.style_examples {
            prompt.push_str(&format!("  - {}\n", preview(&example.text)));
        }
    }

    prompt.push_str(&format!("\nReply to:\n{}", request.message.text));
    prompt
}

fn push_header(prompt: &mut String, message: &Message) {
    prompt.push_str(&format!("Channel: {}\n", message.channel_id));
    prompt.push_str(&format!("From: {}\n", message.sender_label()));
}

fn push_context(prompt: &mut String, context: &[Message]) {
    if context.is_empty() {
        prompt.push_str("\nRecent conversation: (none)\n");
        return;
    }
    prompt.push_str("\nRecent conversation:\n");
    let skip = context.len().saturating_sub(PROMPT_CONTEXT_MESSAGES);
    for msg in &context[skip..] {
        prompt.push_str(&format!("  {}: {}\n", msg.sender_label(), preview(&msg.text)));
    }
}

fn urgency_hint(level: UrgencyLevel) -> &'static str {
    match level {
        UrgencyLevel::High => "high, answer promptly and to the point",
        UrgencyLevel::Medium => "medium, balanced and friendly",
        _ => "low, casual",
    }
}

fn preview(text: &str) -> String {
    text.chars().take(CONTEXT_PREVIEW_CHARS).collect()
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct ClassifyResponse {
    #[serde(alias = "level")]
    label: String,
    #[serde(default, alias = "reasoning")]
    rationale: String,
    #[serde(default)]
    factors: Vec<String>,
}

fn parse_classification(raw: &str) -> Result<Classification, String> {
    let json_str = extract_json_object(raw);
    let response: ClassifyResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let label = response.label.trim().to_lowercase();
    if label.is_empty() {
        return Err("empty label".into());
    }

    Ok(Classification {
        label,
        rationale: response.rationale,
        factors: response.factors,
    })
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Strip wrapping quotes some models add around a bare reply.
fn clean_reply(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}
