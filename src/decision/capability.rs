//! The language capability contract consumed by the decision workflow.
//!
//! Requests are typed and versioned so prompt wording can change behind the
//! trait without touching the planner. Every call made by the workflow goes
//! through [`classify_with_retry`] or [`generate_with_retry`], which bound
//! latency and retry exactly once.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Principal;
use crate::decision::types::{Message, UrgencyAssessment, UrgencyLevel};
use crate::error::CapabilityError;

/// Bumped whenever request fields change meaning.
pub const PROMPT_VERSION: u32 = 1;

/// Total attempts per call (first try plus one retry).
const MAX_ATTEMPTS: u32 = 2;

/// What a `classify` call is asked to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyTask {
    /// `high | medium | low`
    Urgency,
    /// `direct | indirect | none`
    ResponseNeed,
    /// `high | medium | low`
    Sensitivity,
}

impl ClassifyTask {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Urgency => "urgency",
            Self::ResponseNeed => "response_need",
            Self::Sensitivity => "sensitivity",
        }
    }
}

/// Input to a `classify` call.
#[derive(Debug, Clone)]
pub struct ClassifyRequest {
    pub version: u32,
    pub task: ClassifyTask,
    pub message: Message,
    /// Oldest to newest. May be empty.
    pub channel_context: Vec<Message>,
    /// Urgency decided earlier in the workflow, when relevant.
    pub urgency: Option<UrgencyAssessment>,
    pub principal: Principal,
}

impl ClassifyRequest {
    pub fn new(
        task: ClassifyTask,
        message: Message,
        channel_context: Vec<Message>,
        principal: Principal,
    ) -> Self {
        Self {
            version: PROMPT_VERSION,
            task,
            message,
            channel_context,
            urgency: None,
            principal,
        }
    }

    pub fn with_urgency(mut self, urgency: Option<UrgencyAssessment>) -> Self {
        self.urgency = urgency;
        self
    }
}

/// Parsed `classify` output. `label` is validated by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub factors: Vec<String>,
}

/// Input to a `generate` call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub version: u32,
    pub message: Message,
    pub channel_context: Vec<Message>,
    /// Earlier messages by the principal, used only to approximate tone.
    pub style_examples: Vec<Message>,
    pub urgency: Option<UrgencyLevel>,
    pub principal: Principal,
    pub max_chars: usize,
}

/// Classification and generation backend.
#[async_trait]
pub trait LanguageCapability: Send + Sync {
    /// Classify the request. Output that cannot be parsed is `Malformed`.
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, CapabilityError>;

    /// Produce reply text. Empty output is `Malformed`.
    async fn generate(&self, request: &GenerateRequest) -> Result<String, CapabilityError>;
}

/// Classify with a bounded timeout and one retry. `accept` validates the
/// label; a rejected label counts as malformed output.
pub async fn classify_with_retry<T, F>(
    capability: &dyn LanguageCapability,
    request: &ClassifyRequest,
    timeout: Duration,
    accept: F,
) -> Result<(T, Classification), CapabilityError>
where
    F: Fn(&Classification) -> Option<T>,
{
    let task = request.task.label();
    let accept = &accept;
    with_retry(task, &request.message.id, move || async move {
        let classification = bounded(task, timeout, capability.classify(request)).await?;
        match accept(&classification) {
            Some(value) => Ok((value, classification)),
            None => Err(CapabilityError::Malformed {
                task: task.to_string(),
                reason: format!("unexpected label '{}'", classification.label),
            }),
        }
    })
    .await
}

/// Generate with a bounded timeout and one retry.
pub async fn generate_with_retry(
    capability: &dyn LanguageCapability,
    request: &GenerateRequest,
    timeout: Duration,
) -> Result<String, CapabilityError> {
    with_retry("generate", &request.message.id, move || async move {
        let text = bounded("generate", timeout, capability.generate(request)).await?;
        if text.trim().is_empty() {
            return Err(CapabilityError::Malformed {
                task: "generate".to_string(),
                reason: "empty reply".to_string(),
            });
        }
        Ok(text)
    })
    .await
}

async fn bounded<T>(
    task: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T, CapabilityError>>,
) -> Result<T, CapabilityError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Timeout {
            task: task.to_string(),
            timeout,
        }),
    }
}

async fn with_retry<T, Fut>(
    task: &str,
    message_id: &str,
    mut attempt: impl FnMut() -> Fut,
) -> Result<T, CapabilityError>
where
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut last_error = None;
    for n in 1..=MAX_ATTEMPTS {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    message_id = %message_id,
                    task = task,
                    attempt = n,
                    kind = e.label(),
                    error = %e,
                    "Capability call failed"
                );
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| CapabilityError::Malformed {
        task: task.to_string(),
        reason: "no attempts made".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::decision::types::UrgencyLevel;

    /// Replays a fixed script of results, one per call.
    struct Scripted {
        calls: AtomicU32,
        labels: Vec<Option<&'static str>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl LanguageCapability for Scripted {
        async fn classify(&self, _r: &ClassifyRequest) -> Result<Classification, CapabilityError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.labels.get(n).copied().flatten() {
                Some(label) => Ok(Classification {
                    label: label.to_string(),
                    rationale: "r".into(),
                    factors: vec![],
                }),
                None => Err(CapabilityError::Malformed {
                    task: "urgency".into(),
                    reason: "no json".into(),
                }),
            }
        }

        async fn generate(&self, _r: &GenerateRequest) -> Result<String, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("   ".into())
        }
    }

    fn request() -> ClassifyRequest {
        ClassifyRequest::new(
            ClassifyTask::Urgency,
            Message::new("m1", "C1", "U1", "is this urgent??"),
            vec![],
            Principal::default(),
        )
    }

    #[tokio::test]
    async fn retries_once_after_malformed_output() {
        let cap = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            labels: vec![None, Some("high")],
            delay: None,
        });
        let (level, _) = classify_with_retry(cap.as_ref(), &request(), Duration::from_secs(1), |c| {
            UrgencyLevel::parse_classified(&c.label)
        })
        .await
        .unwrap();
        assert_eq!(level, UrgencyLevel::High);
        assert_eq!(cap.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_two_attempts() {
        let cap = Scripted {
            calls: AtomicU32::new(0),
            labels: vec![Some("urgentish"), Some("urgentish"), Some("high")],
            delay: None,
        };
        let result = classify_with_retry(&cap, &request(), Duration::from_secs(1), |c| {
            UrgencyLevel::parse_classified(&c.label)
        })
        .await;
        assert!(matches!(result, Err(CapabilityError::Malformed { .. })));
        assert_eq!(cap.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let cap = Scripted {
            calls: AtomicU32::new(0),
            labels: vec![Some("high"), Some("high")],
            delay: Some(Duration::from_secs(60)),
        };
        let result = classify_with_retry(&cap, &request(), Duration::from_secs(5), |c| {
            UrgencyLevel::parse_classified(&c.label)
        })
        .await;
        assert!(matches!(result, Err(CapabilityError::Timeout { .. })));
        assert_eq!(cap.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn blank_generation_is_malformed() {
        let cap = Scripted {
            calls: AtomicU32::new(0),
            labels: vec![],
            delay: None,
        };
        let req = GenerateRequest {
            version: PROMPT_VERSION,
            message: Message::new("m1", "C1", "U1", "hi"),
            channel_context: vec![],
            style_examples: vec![],
            urgency: None,
            principal: Principal::default(),
            max_chars: 100,
        };
        let result = generate_with_retry(&cap, &req, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CapabilityError::Malformed { .. })));
        assert_eq!(cap.calls.load(Ordering::SeqCst), 2);
    }
}
