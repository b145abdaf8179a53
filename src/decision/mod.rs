//! Reply decision workflow: urgency, should-respond analysis, sensitivity
//! gate and reply text, driven per message by [`ResponsePlanner`].

pub mod capability;
pub mod context;
pub mod generator;
mod llm_capability;
pub mod planner;
pub mod sensitivity;
pub mod types;
pub mod urgency;

pub use capability::{Classification, ClassifyRequest, ClassifyTask, GenerateRequest, LanguageCapability};
pub use context::{ContextProvider, NoContext};
pub use generator::ResponseGenerator;
pub use llm_capability::LlmCapability;
pub use planner::{Outcome, PlannerBuilder, ResponsePlanner};
pub use sensitivity::{SensitivityGate, SensitivityRules};
pub use types::*;
pub use urgency::UrgencyEvaluator;
