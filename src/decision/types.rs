//! Shared types for the reply decision workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound message ─────────────────────────────────────────────────

/// An inbound channel message. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Channel-native message id (also the scheduling key).
    pub id: String,
    pub channel_id: String,
    /// Sender id.
    pub user_id: String,
    /// Display name of the sender, when the transport resolved one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Thread to reply into, if the message was posted in one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl Message {
    /// Create a top-level message stamped now.
    pub fn new(
        id: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            user_name: None,
            text: text.into(),
            timestamp: Utc::now(),
            thread_id: None,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    /// Name to show in prompts.
    pub fn sender_label(&self) -> &str {
        self.user_name.as_deref().unwrap_or(&self.user_id)
    }
}

// ── Urgency ─────────────────────────────────────────────────────────

/// Discrete priority of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    High,
    Medium,
    Low,
    /// Trigger keyword fast path.
    Loco,
    /// Designated test sender/channel fast path.
    Test,
}

impl UrgencyLevel {
    /// Levels decided without a model call.
    pub fn is_fast_path(&self) -> bool {
        matches!(self, Self::Loco | Self::Test)
    }

    /// Levels that justify answering an indirect message.
    pub fn is_pressing(&self) -> bool {
        matches!(self, Self::High | Self::Medium)
    }

    /// Parse a model-produced level. Only the classifiable levels are accepted.
    pub fn parse_classified(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for UrgencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Loco => "loco",
            Self::Test => "test",
        };
        write!(f, "{s}")
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Trigger keyword matched.
    Keyword,
    /// Designated test sender or channel.
    TestTrigger,
    /// Regex pre-filter.
    Heuristic,
    /// Language model classification.
    Model,
    /// Deterministic default after the model failed twice.
    Fallback,
    /// Stage skipped for a fast-path level.
    Bypass,
}

/// Output of the urgency stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrgencyAssessment {
    pub level: UrgencyLevel,
    pub rationale: String,
    #[serde(default)]
    pub factors: Vec<String>,
    pub source: Source,
}

// ── Analysis ────────────────────────────────────────────────────────

/// How much the message asks of the principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseNeed {
    /// Addressed to the principal and expects an answer.
    Direct,
    /// Expects an answer but is not addressed to the principal.
    Indirect,
    /// No answer needed.
    None,
}

impl ResponseNeed {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "indirect" => Some(Self::Indirect),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Output of the should-respond stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub need: ResponseNeed,
    pub should_respond: bool,
    pub rationale: String,
    pub source: Source,
}

// ── Sensitivity ─────────────────────────────────────────────────────

/// Sensitivity of the conversation, as rated by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityLevel {
    High,
    Medium,
    Low,
}

impl SensitivityLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Medium and high both suppress a normal reply.
    pub fn is_sensitive(&self) -> bool {
        !matches!(self, Self::Low)
    }
}

/// Output of the sensitivity gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityVerdict {
    pub is_safe: bool,
    pub level: SensitivityLevel,
    #[serde(default)]
    pub factors: Vec<String>,
    pub rationale: String,
    pub source: Source,
}

// ── Response ────────────────────────────────────────────────────────

/// Which generator branch produced the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBranch {
    Keyword,
    Evasion,
    Generated,
}

impl ResponseBranch {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Evasion => "evasion",
            Self::Generated => "generated",
        }
    }
}

// ── State machine ───────────────────────────────────────────────────

/// Planner stage. `End` is the only terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    ContextGathered,
    UrgencyEvaluated,
    Analyzed,
    SensitivityChecked,
    ResponseGenerated,
    End,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End)
    }

    /// Legal forward transitions.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;

        matches!(
            (self, target),
            (Start, ContextGathered)
                | (ContextGathered, UrgencyEvaluated)
                | (UrgencyEvaluated, Analyzed)
                | (Analyzed, SensitivityChecked)
                | (Analyzed, End)
                | (SensitivityChecked, ResponseGenerated)
                | (ResponseGenerated, End)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ContextGathered => "context_gathered",
            Self::UrgencyEvaluated => "urgency_evaluated",
            Self::Analyzed => "analyzed",
            Self::SensitivityChecked => "sensitivity_checked",
            Self::ResponseGenerated => "response_generated",
            Self::End => "end",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Self::Start),
            "context_gathered" => Some(Self::ContextGathered),
            "urgency_evaluated" => Some(Self::UrgencyEvaluated),
            "analyzed" => Some(Self::Analyzed),
            "sensitivity_checked" => Some(Self::SensitivityChecked),
            "response_generated" => Some(Self::ResponseGenerated),
            "end" => Some(Self::End),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message workflow state. Each transition consumes one and returns the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub message: Message,
    pub channel_context: Vec<Message>,
    pub user_responses: Vec<Message>,
    pub urgency: Option<UrgencyAssessment>,
    pub analysis: Option<Analysis>,
    pub sensitivity: Option<SensitivityVerdict>,
    pub should_respond: bool,
    pub response: Option<String>,
    pub branch: Option<ResponseBranch>,
    /// Internal explanation of the latest decision. Never sent to the channel.
    pub reasoning: String,
    pub stage: Stage,
}

impl ConversationState {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            channel_context: Vec::new(),
            user_responses: Vec::new(),
            urgency: None,
            analysis: None,
            sensitivity: None,
            should_respond: false,
            response: None,
            branch: None,
            reasoning: String::new(),
            stage: Stage::Start,
        }
    }

    /// Urgency level decided so far, if any.
    pub fn urgency_level(&self) -> Option<UrgencyLevel> {
        self.urgency.as_ref().map(|u| u.level)
    }
}

/// Persisted `(stage, state)` pair for one message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub message_id: String,
    pub stage: Stage,
    pub state: ConversationState,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn of(state: &ConversationState) -> Self {
        Self {
            message_id: state.message.id.clone(),
            stage: state.stage,
            state: state.clone(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_transitions_follow_the_workflow() {
        assert!(Stage::Start.can_transition_to(Stage::ContextGathered));
        assert!(Stage::Analyzed.can_transition_to(Stage::End));
        assert!(Stage::Analyzed.can_transition_to(Stage::SensitivityChecked));
        assert!(Stage::SensitivityChecked.can_transition_to(Stage::ResponseGenerated));
        assert!(!Stage::SensitivityChecked.can_transition_to(Stage::End));
        assert!(!Stage::Start.can_transition_to(Stage::Analyzed));
        assert!(!Stage::End.can_transition_to(Stage::Start));
    }

    #[test]
    fn only_end_is_terminal() {
        assert!(Stage::End.is_terminal());
        assert!(!Stage::ResponseGenerated.is_terminal());
    }

    #[test]
    fn stage_string_round_trip() {
        for stage in [
            Stage::Start,
            Stage::ContextGathered,
            Stage::UrgencyEvaluated,
            Stage::Analyzed,
            Stage::SensitivityChecked,
            Stage::ResponseGenerated,
            Stage::End,
        ] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn classified_levels_exclude_fast_paths() {
        assert_eq!(UrgencyLevel::parse_classified(" HIGH "), Some(UrgencyLevel::High));
        assert_eq!(UrgencyLevel::parse_classified("loco"), None);
        assert_eq!(UrgencyLevel::parse_classified("test"), None);
        assert_eq!(UrgencyLevel::parse_classified("critical"), None);
    }

    #[test]
    fn sensitivity_medium_counts_as_sensitive() {
        assert!(SensitivityLevel::High.is_sensitive());
        assert!(SensitivityLevel::Medium.is_sensitive());
        assert!(!SensitivityLevel::Low.is_sensitive());
    }

    #[test]
    fn message_serialization_omits_empty_thread() {
        let msg = Message::new("m1", "C1", "U1", "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("thread_id").is_none());
        let threaded = msg.with_thread("1700000000.0001");
        let json = serde_json::to_value(&threaded).unwrap();
        assert_eq!(json["thread_id"], "1700000000.0001");
    }

    #[test]
    fn checkpoint_captures_stage() {
        let mut state = ConversationState::new(Message::new("m1", "C1", "U1", "hi"));
        state.stage = Stage::Analyzed;
        let cp = Checkpoint::of(&state);
        assert_eq!(cp.message_id, "m1");
        assert_eq!(cp.stage, Stage::Analyzed);
    }
}
