//! Response planner: drives one message through the decision workflow.
//!
//! Flow:
//! 1. Gather channel context and principal style examples
//! 2. Urgency (fast paths first, then the model)
//! 3. Should-respond analysis; `false` ends the run with nothing scheduled
//! 4. Sensitivity gate; unsafe conversations get an evasive reply
//! 5. Reply text (keyword template, evasion, or generated)
//! 6. Schedule with the urgency's delay
//!
//! Every transition is checkpointed under the message id. A message whose
//! checkpoint reached `End` is never planned again; a non-terminal checkpoint
//! resumes where it stopped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::config::{Principal, PlannerConfig, TriggerConfig};
use crate::decision::capability::{
    ClassifyRequest, ClassifyTask, LanguageCapability, classify_with_retry,
};
use crate::decision::context::{ContextProvider, exclude_message, select_style_examples};
use crate::decision::generator::ResponseGenerator;
use crate::decision::sensitivity::{SensitivityGate, SensitivityRules};
use crate::decision::types::{
    Analysis, Checkpoint, ConversationState, Message, ResponseBranch, ResponseNeed, Source, Stage,
    UrgencyLevel,
};
use crate::decision::urgency::{FALLBACK_LEVEL, UrgencyEvaluator};
use crate::error::PlannerError;
use crate::scheduler::{DelayScheduler, ReplyPayload, ScheduledResponse};
use crate::store::{CheckpointStore, MemoryCheckpointStore};

/// What the planner did with a message.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A reply is pending in the scheduler.
    Scheduled(ScheduledResponse),
    /// No reply needed.
    Skipped { reasoning: String },
    /// A reply was wanted but no text could be produced.
    Suppressed { reasoning: String },
    /// The message already finished an earlier run.
    AlreadyProcessed { stage: Stage },
    /// Another run for the same message id is in progress.
    InFlight,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Scheduled(_) => "scheduled",
            Self::Skipped { .. } => "skipped",
            Self::Suppressed { .. } => "suppressed",
            Self::AlreadyProcessed { .. } => "already_processed",
            Self::InFlight => "in_flight",
        }
    }
}

/// Result of one transition.
enum Step {
    Next(ConversationState),
    Done(ConversationState, Outcome),
}

pub struct ResponsePlanner {
    capability: Arc<dyn LanguageCapability>,
    context: Arc<dyn ContextProvider>,
    scheduler: Arc<DelayScheduler>,
    checkpoints: Arc<dyn CheckpointStore>,
    urgency: UrgencyEvaluator,
    sensitivity: SensitivityGate,
    generator: ResponseGenerator,
    principal: Principal,
    config: PlannerConfig,
    active: Mutex<HashSet<String>>,
}

/// Builder for [`ResponsePlanner`]. Everything but the three required
/// collaborators has a default.
pub struct PlannerBuilder {
    capability: Arc<dyn LanguageCapability>,
    context: Arc<dyn ContextProvider>,
    scheduler: Arc<DelayScheduler>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    triggers: TriggerConfig,
    principal: Principal,
    config: PlannerConfig,
    rules: Option<SensitivityRules>,
}

impl PlannerBuilder {
    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn triggers(mut self, triggers: TriggerConfig) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    pub fn config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sensitivity_rules(mut self, rules: SensitivityRules) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn build(self) -> ResponsePlanner {
        let timeout = self.config.capability_timeout;
        ResponsePlanner {
            urgency: UrgencyEvaluator::new(
                self.capability.clone(),
                self.triggers,
                self.principal.clone(),
                timeout,
            ),
            sensitivity: SensitivityGate::new(
                self.capability.clone(),
                self.rules.unwrap_or_else(SensitivityRules::default_rules),
                self.principal.clone(),
                timeout,
            ),
            generator: ResponseGenerator::new(
                self.capability.clone(),
                self.principal.clone(),
                timeout,
                self.config.max_response_chars,
            ),
            capability: self.capability,
            context: self.context,
            scheduler: self.scheduler,
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
            principal: self.principal,
            config: self.config,
            active: Mutex::new(HashSet::new()),
        }
    }
}

/// Marks a message id as in flight until dropped.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    message_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.message_id);
    }
}

impl ResponsePlanner {
    pub fn builder(
        capability: Arc<dyn LanguageCapability>,
        context: Arc<dyn ContextProvider>,
        scheduler: Arc<DelayScheduler>,
    ) -> PlannerBuilder {
        PlannerBuilder {
            capability,
            context,
            scheduler,
            checkpoints: None,
            triggers: TriggerConfig::default(),
            principal: Principal::default(),
            config: PlannerConfig::default(),
            rules: None,
        }
    }

    pub fn scheduler(&self) -> &Arc<DelayScheduler> {
        &self.scheduler
    }

    /// Plan a reply for one message. Never fails; every degradation is
    /// logged and reflected in the outcome.
    pub async fn handle(&self, message: Message) -> Outcome {
        let message_id = message.id.clone();

        let Some(_guard) = self.claim(&message_id) else {
            info!(message_id = %message_id, "Message already in flight, skipping");
            return Outcome::InFlight;
        };

        let state = match self.load_checkpoint(&message_id).await {
            Some(checkpoint) if checkpoint.stage.is_terminal() => {
                debug!(message_id = %message_id, "Message already processed");
                return Outcome::AlreadyProcessed {
                    stage: checkpoint.stage,
                };
            }
            Some(checkpoint) => {
                info!(
                    message_id = %message_id,
                    stage = %checkpoint.stage,
                    "Resuming from checkpoint"
                );
                checkpoint.state
            }
            None => {
                info!(
                    message_id = %message_id,
                    channel_id = %message.channel_id,
                    user_id = %message.user_id,
                    "Planning reply"
                );
                ConversationState::new(message)
            }
        };

        let outcome = self.run(state).await;
        info!(message_id = %message_id, outcome = outcome.label(), "Planning finished");
        outcome
    }

    /// Plan several messages concurrently. One failure never affects the rest.
    pub async fn handle_batch(
        self: &Arc<Self>,
        messages: Vec<Message>,
    ) -> Vec<(String, Result<Outcome, PlannerError>)> {
        let count = messages.len();
        info!(count, "Planning message batch");

        let tasks: Vec<_> = messages
            .into_iter()
            .map(|message| {
                let planner = Arc::clone(self);
                let message_id = message.id.clone();
                (message_id, tokio::spawn(async move { planner.handle(message).await }))
            })
            .collect();

        let mut results = Vec::with_capacity(count);
        for (message_id, task) in tasks {
            let result = task.await.map_err(|e| PlannerError::Task {
                message_id: message_id.clone(),
                reason: e.to_string(),
            });
            if let Err(ref e) = result {
                error!(message_id = %message_id, error = %e, "Planner task failed");
            }
            results.push((message_id, result));
        }

        let scheduled = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(Outcome::Scheduled(_))))
            .count();
        info!(scheduled, total = count, "Batch planning complete");
        results
    }

    fn claim(&self, message_id: &str) -> Option<ActiveGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(message_id.to_string()) {
            return None;
        }
        Some(ActiveGuard {
            active: &self.active,
            message_id: message_id.to_string(),
        })
    }

    async fn load_checkpoint(&self, message_id: &str) -> Option<Checkpoint> {
        match self.checkpoints.load(message_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                let e = PlannerError::from(e);
                warn!(message_id, error = %e, "Checkpoint load failed, starting fresh");
                None
            }
        }
    }

    async fn save_checkpoint(&self, state: &ConversationState) {
        if let Err(e) = self.checkpoints.save(&Checkpoint::of(state)).await {
            let e = PlannerError::from(e);
            warn!(
                message_id = %state.message.id,
                stage = %state.stage,
                error = %e,
                "Checkpoint save failed, continuing in memory"
            );
        }
    }

    async fn run(&self, mut state: ConversationState) -> Outcome {
        loop {
            let from = state.stage;
            let step = self.step(state).await;
            let (next, outcome) = match step {
                Step::Next(next) => (next, None),
                Step::Done(next, outcome) => (next, Some(outcome)),
            };

            if !from.can_transition_to(next.stage) {
                error!(
                    message_id = %next.message.id,
                    from = %from,
                    to = %next.stage,
                    "Illegal stage transition"
                );
            }
            debug!(message_id = %next.message.id, from = %from, to = %next.stage, "Transition");
            self.save_checkpoint(&next).await;

            match outcome {
                Some(outcome) => return outcome,
                None => state = next,
            }
        }
    }

    async fn step(&self, state: ConversationState) -> Step {
        match state.stage {
            Stage::Start => Step::Next(self.gather_context(state).await),
            Stage::ContextGathered => Step::Next(self.evaluate_urgency(state).await),
            Stage::UrgencyEvaluated => Step::Next(self.analyze(state).await),
            Stage::Analyzed if !state.should_respond => {
                let reasoning = state.reasoning.clone();
                Step::Done(
                    ConversationState {
                        stage: Stage::End,
                        ..state
                    },
                    Outcome::Skipped { reasoning },
                )
            }
            Stage::Analyzed => Step::Next(self.check_sensitivity(state).await),
            Stage::SensitivityChecked => Step::Next(self.produce_response(state).await),
            Stage::ResponseGenerated => self.schedule(state).await,
            Stage::End => Step::Done(
                state,
                Outcome::AlreadyProcessed { stage: Stage::End },
            ),
        }
    }

    // ── Stages ──────────────────────────────────────────────────────

    async fn gather_context(&self, state: ConversationState) -> ConversationState {
        let message = &state.message;

        // One extra so the limit still holds after dropping the message itself.
        let fetch = self.config.channel_context_limit + 1;
        let channel_context = match self.context.channel_context(&message.channel_id, fetch).await {
            Ok(ctx) => {
                let mut ctx = exclude_message(ctx, &message.id);
                let excess = ctx.len().saturating_sub(self.config.channel_context_limit);
                ctx.drain(..excess);
                ctx
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Channel context unavailable");
                Vec::new()
            }
        };

        let user_responses = if self.principal.user_id.is_empty() {
            Vec::new()
        } else {
            match self
                .context
                .principal_responses(&self.principal.user_id, self.config.principal_responses_limit)
                .await
            {
                Ok(responses) => select_style_examples(responses, self.config.max_style_examples),
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Principal responses unavailable");
                    Vec::new()
                }
            }
        };

        debug!(
            message_id = %message.id,
            context = channel_context.len(),
            style_examples = user_responses.len(),
            "Context gathered"
        );

        ConversationState {
            channel_context,
            user_responses,
            reasoning: "context gathered".to_string(),
            stage: Stage::ContextGathered,
            ..state
        }
    }

    async fn evaluate_urgency(&self, state: ConversationState) -> ConversationState {
        let assessment = self
            .urgency
            .evaluate(&state.message, &state.channel_context)
            .await;

        info!(
            message_id = %state.message.id,
            urgency = %assessment.level,
            source = ?assessment.source,
            "Urgency evaluated"
        );

        ConversationState {
            reasoning: format!("urgency {}: {}", assessment.level, assessment.rationale),
            urgency: Some(assessment),
            stage: Stage::UrgencyEvaluated,
            ..state
        }
    }

    async fn analyze(&self, state: ConversationState) -> ConversationState {
        let level = state.urgency_level().unwrap_or(FALLBACK_LEVEL);

        let analysis = if level.is_fast_path() {
            Analysis {
                need: ResponseNeed::Direct,
                should_respond: true,
                rationale: format!("{level} level always responds"),
                source: Source::Bypass,
            }
        } else {
            let request = ClassifyRequest::new(
                ClassifyTask::ResponseNeed,
                state.message.clone(),
                state.channel_context.clone(),
                self.principal.clone(),
            )
            .with_urgency(state.urgency.clone());

            match classify_with_retry(
                self.capability.as_ref(),
                &request,
                self.config.capability_timeout,
                |c| ResponseNeed::parse(&c.label),
            )
            .await
            {
                Ok((need, classification)) => Analysis {
                    need,
                    should_respond: should_respond(need, level),
                    rationale: classification.rationale,
                    source: Source::Model,
                },
                Err(e) => {
                    warn!(
                        message_id = %state.message.id,
                        error = %e,
                        "Analysis failed, not responding"
                    );
                    Analysis {
                        need: ResponseNeed::None,
                        should_respond: false,
                        rationale: format!("analysis unavailable ({})", e.label()),
                        source: Source::Fallback,
                    }
                }
            }
        };

        info!(
            message_id = %state.message.id,
            need = ?analysis.need,
            should_respond = analysis.should_respond,
            "Message analyzed"
        );

        ConversationState {
            should_respond: analysis.should_respond,
            reasoning: format!("analysis: {}", analysis.rationale),
            analysis: Some(analysis),
            stage: Stage::Analyzed,
            ..state
        }
    }

    async fn check_sensitivity(&self, state: ConversationState) -> ConversationState {
        let verdict = if state.urgency_level() == Some(UrgencyLevel::Loco) {
            SensitivityGate::bypass("trigger keyword")
        } else {
            self.sensitivity
                .check(&state.message, &state.channel_context, state.urgency.as_ref())
                .await
        };

        info!(
            message_id = %state.message.id,
            safe = verdict.is_safe,
            level = ?verdict.level,
            source = ?verdict.source,
            "Sensitivity checked"
        );

        ConversationState {
            reasoning: format!("sensitivity: {}", verdict.rationale),
            sensitivity: Some(verdict),
            stage: Stage::SensitivityChecked,
            ..state
        }
    }

    async fn produce_response(&self, state: ConversationState) -> ConversationState {
        let level = state.urgency_level();
        let safe = state.sensitivity.as_ref().is_some_and(|v| v.is_safe);

        let (branch, response) = if level == Some(UrgencyLevel::Loco) {
            (ResponseBranch::Keyword, Some(self.generator.keyword_reply()))
        } else if !safe {
            (ResponseBranch::Evasion, Some(self.generator.evasion_reply()))
        } else {
            let text = self
                .generator
                .generated_reply(
                    &state.message,
                    &state.channel_context,
                    &state.user_responses,
                    level,
                )
                .await;
            (ResponseBranch::Generated, text)
        };

        debug!(
            message_id = %state.message.id,
            branch = branch.label(),
            produced = response.is_some(),
            "Response produced"
        );

        ConversationState {
            reasoning: format!("{} reply", branch.label()),
            response,
            branch: Some(branch),
            stage: Stage::ResponseGenerated,
            ..state
        }
    }

    async fn schedule(&self, state: ConversationState) -> Step {
        let (Some(text), Some(branch)) = (state.response.clone(), state.branch) else {
            let reasoning = "no reply text produced".to_string();
            warn!(message_id = %state.message.id, reason = %reasoning, "Reply suppressed");
            return Step::Done(
                ConversationState {
                    reasoning: reasoning.clone(),
                    stage: Stage::End,
                    ..state
                },
                Outcome::Suppressed { reasoning },
            );
        };

        // A resumed run whose reply was already queued must not queue another.
        if let Some(status) = self.scheduler.status(&state.message.id).await {
            info!(
                message_id = %state.message.id,
                status = ?status,
                "Reply already scheduled by an earlier run"
            );
            let stage = state.stage;
            return Step::Done(
                ConversationState {
                    stage: Stage::End,
                    ..state
                },
                Outcome::AlreadyProcessed { stage },
            );
        }

        let level = state.urgency_level().unwrap_or(FALLBACK_LEVEL);
        let payload = ReplyPayload {
            channel_id: state.message.channel_id.clone(),
            thread_id: state.message.thread_id.clone(),
            text,
            branch,
        };
        let scheduled = self
            .scheduler
            .schedule(&state.message.id, level, payload)
            .await;

        Step::Done(
            ConversationState {
                reasoning: format!("scheduled in {}s", scheduled.delay.as_secs()),
                stage: Stage::End,
                ..state
            },
            Outcome::Scheduled(scheduled),
        )
    }
}

/// Direct requests always get a reply; indirect ones only when pressing.
fn should_respond(need: ResponseNeed, level: UrgencyLevel) -> bool {
    match need {
        ResponseNeed::Direct => true,
        ResponseNeed::Indirect => level.is_pressing(),
        ResponseNeed::None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::DelayConfig;
    use crate::decision::capability::{Classification, GenerateRequest};
    use crate::decision::context::NoContext;
    use crate::decision::generator::{EVASION_REPLIES, KEYWORD_REPLY};
    use crate::dispatch::LogDispatcher;
    use crate::error::{CapabilityError, ContextError, DatabaseError};
    use crate::scheduler::ScheduleStatus;

    /// Answers each classify task with a fixed label; counts calls.
    struct Scripted {
        labels: HashMap<&'static str, &'static str>,
        reply: &'static str,
        classify_calls: AtomicU32,
        generate_calls: AtomicU32,
    }

    impl Scripted {
        fn new(labels: &[(&'static str, &'static str)]) -> Arc<Self> {
            Arc::new(Self {
                labels: labels.iter().copied().collect(),
                reply: "sure, give me a few minutes",
                classify_calls: AtomicU32::new(0),
                generate_calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LanguageCapability for Scripted {
        async fn classify(&self, r: &ClassifyRequest) -> Result<Classification, CapabilityError> {
            self.classify_calls.fetch_add(1, Ordering::SeqCst);
            match self.labels.get(r.task.label()) {
                Some(label) => Ok(Classification {
                    label: label.to_string(),
                    rationale: format!("{} rationale", r.task.label()),
                    factors: vec![],
                }),
                None => Err(CapabilityError::Malformed {
                    task: r.task.label().into(),
                    reason: "unscripted".into(),
                }),
            }
        }

        async fn generate(&self, _r: &GenerateRequest) -> Result<String, CapabilityError> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.to_string())
        }
    }

    fn planner(cap: Arc<Scripted>) -> ResponsePlanner {
        let scheduler = DelayScheduler::new(DelayConfig::default(), Arc::new(LogDispatcher));
        ResponsePlanner::builder(cap, Arc::new(NoContext), scheduler).build()
    }

    fn msg(id: &str, text: &str) -> Message {
        Message::new(id, "C1", "U1", text)
    }

    /// Context source whose backend is down.
    struct BrokenContext;

    #[async_trait]
    impl ContextProvider for BrokenContext {
        async fn channel_context(&self, _: &str, _: usize) -> Result<Vec<Message>, ContextError> {
            Err(ContextError::Database(DatabaseError::Query("disk I/O error".into())))
        }

        async fn principal_responses(&self, _: &str, _: usize) -> Result<Vec<Message>, ContextError> {
            Err(ContextError::Database(DatabaseError::Pool("closed".into())))
        }
    }

    /// Checkpoint store that fails every load, and every save at `fail_at`
    /// (or every save when `fail_at` is `None`).
    struct FlakyCheckpoints {
        inner: MemoryCheckpointStore,
        fail_at: Option<Stage>,
        fail_loads: bool,
    }

    #[async_trait]
    impl CheckpointStore for FlakyCheckpoints {
        async fn load(&self, message_id: &str) -> Result<Option<Checkpoint>, DatabaseError> {
            if self.fail_loads {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            self.inner.load(message_id).await
        }

        async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
            match self.fail_at {
                Some(stage) if stage != checkpoint.stage => self.inner.save(checkpoint).await,
                _ => Err(DatabaseError::Query("database is locked".into())),
            }
        }
    }

    #[test]
    fn should_respond_rules() {
        assert!(should_respond(ResponseNeed::Direct, UrgencyLevel::Low));
        assert!(should_respond(ResponseNeed::Indirect, UrgencyLevel::High));
        assert!(should_respond(ResponseNeed::Indirect, UrgencyLevel::Medium));
        assert!(!should_respond(ResponseNeed::Indirect, UrgencyLevel::Low));
        assert!(!should_respond(ResponseNeed::None, UrgencyLevel::High));
    }

    #[tokio::test(start_paused = true)]
    async fn keyword_schedules_template_without_model_calls() {
        let cap = Scripted::new(&[]);
        let p = planner(cap.clone());

        let outcome = p.handle(msg("m1", "loco, you there?")).await;
        let Outcome::Scheduled(s) = outcome else {
            panic!("expected scheduled, got {outcome:?}");
        };
        assert_eq!(s.urgency, UrgencyLevel::Loco);
        assert_eq!(s.delay, Duration::from_secs(5));
        assert_eq!(s.payload.text, KEYWORD_REPLY);
        assert_eq!(s.payload.branch, ResponseBranch::Keyword);
        assert_eq!(cap.classify_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cap.generate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_safe_message_gets_generated_reply() {
        let cap = Scripted::new(&[
            ("urgency", "high"),
            ("response_need", "direct"),
            ("sensitivity", "low"),
        ]);
        let p = planner(cap.clone());

        let outcome = p.handle(msg("m1", "is this urgent??")).await;
        let Outcome::Scheduled(s) = outcome else {
            panic!("expected scheduled, got {outcome:?}");
        };
        assert_eq!(s.delay, Duration::from_secs(30));
        assert_eq!(s.payload.branch, ResponseBranch::Generated);
        assert_eq!(s.payload.text, "sure, give me a few minutes");
    }

    #[tokio::test(start_paused = true)]
    async fn no_response_need_is_skipped() {
        let cap = Scripted::new(&[("urgency", "low"), ("response_need", "none")]);
        let p = planner(cap.clone());

        let outcome = p.handle(msg("m1", "fyi, lunch is here")).await;
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert_eq!(p.scheduler().pending_count().await, 0);
        // urgency + response_need only; sensitivity never asked
        assert_eq!(cap.classify_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn indirect_low_urgency_is_skipped() {
        let cap = Scripted::new(&[("urgency", "low"), ("response_need", "indirect")]);
        let outcome = planner(cap).handle(msg("m1", "anyone know?")).await;
        assert!(matches!(outcome, Outcome::Skipped { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn analysis_failure_means_no_reply() {
        let cap = Scripted::new(&[("urgency", "high")]);
        let outcome = planner(cap).handle(msg("m1", "hello?")).await;
        assert!(matches!(outcome, Outcome::Skipped { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn sensitive_conversation_gets_evasion() {
        let cap = Scripted::new(&[
            ("urgency", "high"),
            ("response_need", "direct"),
            ("sensitivity", "medium"),
        ]);
        let outcome = planner(cap.clone()).handle(msg("m1", "what do you think of the reorg?")).await;
        let Outcome::Scheduled(s) = outcome else {
            panic!("expected scheduled, got {outcome:?}");
        };
        assert_eq!(s.payload.branch, ResponseBranch::Evasion);
        assert!(EVASION_REPLIES.contains(&s.payload.text.as_str()));
        assert!(!s.payload.text.contains("high"));
        assert_eq!(cap.generate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_still_runs_the_gate() {
        let cap = Scripted::new(&[("sensitivity", "high")]);
        let scheduler = DelayScheduler::new(DelayConfig::default(), Arc::new(LogDispatcher));
        let p = ResponsePlanner::builder(cap.clone(), Arc::new(NoContext), scheduler)
            .triggers(TriggerConfig {
                test_users: vec!["U1".into()],
                ..TriggerConfig::default()
            })
            .build();

        let Outcome::Scheduled(s) = p.handle(msg("m1", "ping")).await else {
            panic!("expected scheduled");
        };
        assert_eq!(s.urgency, UrgencyLevel::Test);
        assert_eq!(s.delay, Duration::from_secs(30));
        assert_eq!(s.payload.branch, ResponseBranch::Evasion);
        assert_eq!(cap.classify_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_checkpoint_is_a_no_op() {
        let cap = Scripted::new(&[]);
        let p = planner(cap);

        assert!(matches!(p.handle(msg("m1", "loco")).await, Outcome::Scheduled(_)));
        p.scheduler().cancel("m1").await;

        let again = p.handle(msg("m1", "loco")).await;
        assert!(matches!(again, Outcome::AlreadyProcessed { stage: Stage::End }));
        assert_eq!(p.scheduler().pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_a_non_terminal_checkpoint() {
        let cap = Scripted::new(&[("response_need", "direct"), ("sensitivity", "low")]);
        let store = Arc::new(MemoryCheckpointStore::new());

        let mut state = ConversationState::new(msg("m1", "deploy status?"));
        state.stage = Stage::UrgencyEvaluated;
        state.urgency = Some(crate::decision::types::UrgencyAssessment {
            level: UrgencyLevel::Medium,
            rationale: "earlier run".into(),
            factors: vec![],
            source: Source::Model,
        });
        store.save(&Checkpoint::of(&state)).await.unwrap();

        let scheduler = DelayScheduler::new(DelayConfig::default(), Arc::new(LogDispatcher));
        let p = ResponsePlanner::builder(cap.clone(), Arc::new(NoContext), scheduler)
            .checkpoints(store.clone())
            .build();

        let Outcome::Scheduled(s) = p.handle(msg("m1", "deploy status?")).await else {
            panic!("expected scheduled");
        };
        assert_eq!(s.delay, Duration::from_secs(120));
        // urgency was not re-evaluated
        assert_eq!(cap.classify_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.load("m1").await.unwrap().unwrap().stage, Stage::End);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_context_degrades_to_empty() {
        let cap = Scripted::new(&[
            ("urgency", "high"),
            ("response_need", "direct"),
            ("sensitivity", "low"),
        ]);
        let store = Arc::new(MemoryCheckpointStore::new());
        let scheduler = DelayScheduler::new(DelayConfig::default(), Arc::new(LogDispatcher));
        let p = ResponsePlanner::builder(cap.clone(), Arc::new(BrokenContext), scheduler)
            .checkpoints(store.clone())
            .principal(Principal {
                user_id: "UP".into(),
                ..Principal::default()
            })
            .build();

        let Outcome::Scheduled(s) = p.handle(msg("m1", "is prod down?")).await else {
            panic!("expected scheduled");
        };
        assert_eq!(s.urgency, UrgencyLevel::High);
        assert_eq!(s.payload.branch, ResponseBranch::Generated);

        let state = store.load("m1").await.unwrap().unwrap().state;
        assert!(state.channel_context.is_empty());
        assert!(state.user_responses.is_empty());
        assert_eq!(cap.classify_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_checkpoint_store_does_not_stop_the_run() {
        let cap = Scripted::new(&[
            ("urgency", "medium"),
            ("response_need", "direct"),
            ("sensitivity", "low"),
        ]);
        let checkpoints = Arc::new(FlakyCheckpoints {
            inner: MemoryCheckpointStore::new(),
            fail_at: None,
            fail_loads: true,
        });
        let scheduler = DelayScheduler::new(DelayConfig::default(), Arc::new(LogDispatcher));
        let p = ResponsePlanner::builder(cap, Arc::new(NoContext), scheduler)
            .checkpoints(checkpoints)
            .build();

        let Outcome::Scheduled(first) = p.handle(msg("m1", "can you review this?")).await else {
            panic!("expected scheduled");
        };
        assert_eq!(first.delay, Duration::from_secs(120));

        // nothing persisted, but the scheduler still remembers the reply
        let again = p.handle(msg("m1", "can you review this?")).await;
        assert!(matches!(again, Outcome::AlreadyProcessed { .. }));
        assert_eq!(p.scheduler().pending_count().await, 1);
        assert_eq!(p.scheduler().get("m1").await.unwrap().id, first.id);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_after_lost_end_checkpoint_does_not_resend() {
        let cap = Scripted::new(&[]);
        let checkpoints = Arc::new(FlakyCheckpoints {
            inner: MemoryCheckpointStore::new(),
            fail_at: Some(Stage::End),
            fail_loads: false,
        });
        let scheduler = DelayScheduler::new(DelayConfig::default(), Arc::new(LogDispatcher));
        let p = ResponsePlanner::builder(cap, Arc::new(NoContext), scheduler)
            .checkpoints(checkpoints.clone())
            .build();

        let Outcome::Scheduled(first) = p.handle(msg("m1", "loco")).await else {
            panic!("expected scheduled");
        };
        let stored = checkpoints.inner.load("m1").await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::ResponseGenerated);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(p.scheduler().status("m1").await, Some(ScheduleStatus::Dispatched));

        let again = p.handle(msg("m1", "loco")).await;
        assert!(matches!(
            again,
            Outcome::AlreadyProcessed { stage: Stage::ResponseGenerated }
        ));
        let record = p.scheduler().get("m1").await.unwrap();
        assert_eq!(record.id, first.id);
        assert_eq!(record.status, ScheduleStatus::Dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_redelivery_schedules_once() {
        let cap = Scripted::new(&[]);
        let p = Arc::new(planner(cap));

        let batch = (0..5).map(|_| msg("m1", "loco")).collect();
        let results = p.handle_batch(batch).await;

        assert_eq!(results.len(), 5);
        let scheduled = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(Outcome::Scheduled(_))))
            .count();
        assert_eq!(scheduled, 1);
        assert_eq!(p.scheduler().pending_count().await, 1);
    }
}
