//! One conversational turn: load the claim, let the model drive the tools on a
//! working copy, then commit everything in one write.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::claim::{Claim, TranscriptEntry, next_timestamp};
use crate::directory::PolicyDirectory;
use crate::envelope::Envelope;
use crate::error::{ClaimError, Result};
use crate::guidance;
use crate::lifecycle::{Lifecycle, Stage};
use crate::llm::{ChatMessage, ChatModel, ModelReply, ModelRequest};
use crate::prompts::FALLBACK_MESSAGE;
use crate::publish::{ClaimEvent, ClaimPublisher, NoopPublisher};
use crate::storage::{ClaimStore, TurnCommit};
use crate::tools::{SAVE_CLAIM_DATA, ToolExecutor, ToolOutput, TurnState, tool_specs};

/// How structured output is obtained from the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStrategy {
    /// Native tool calling, looping until the model answers in prose.
    #[default]
    ToolCalling,
    /// One call per turn answering with a JSON envelope.
    JsonEnvelope,
}

impl OutputStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "tool_calling" | "tools" => Some(OutputStrategy::ToolCalling),
            "json_envelope" | "json" | "envelope" => Some(OutputStrategy::JsonEnvelope),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Rounds of tool calls allowed before the model must answer.
    pub max_tool_rounds: usize,
    pub model_timeout: Duration,
    pub strategy: OutputStrategy,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            model_timeout: Duration::from_secs(45),
            strategy: OutputStrategy::ToolCalling,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub claim_id: Uuid,
    pub user_message: String,
    /// What the caller believes the transcript is. The stored one wins.
    pub prior_transcript: Vec<TranscriptEntry>,
}

impl TurnRequest {
    pub fn new(claim_id: Uuid, user_message: impl Into<String>) -> Self {
        Self {
            claim_id,
            user_message: user_message.into(),
            prior_transcript: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub message: String,
    pub stage: Stage,
    pub claim: Claim,
    #[serde(skip)]
    pub tool_outputs: Vec<ToolOutput>,
}

type LockMap = DashMap<Uuid, Arc<Mutex<()>>>;

/// A claim's slot in the lock map. Dropping it, also when the turn future is
/// cancelled, removes the slot unless another turn still holds it.
struct ClaimLock<'a> {
    locks: &'a LockMap,
    claim_id: Uuid,
    lock: Arc<Mutex<()>>,
}

impl<'a> ClaimLock<'a> {
    fn acquire(locks: &'a LockMap, claim_id: Uuid) -> Self {
        let lock = locks
            .entry(claim_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self {
            locks,
            claim_id,
            lock,
        }
    }
}

impl Drop for ClaimLock<'_> {
    fn drop(&mut self) {
        // The map's copy plus ours.
        self.locks.remove_if(&self.claim_id, |_, held| {
            Arc::ptr_eq(held, &self.lock) && Arc::strong_count(held) == 2
        });
    }
}

/// Shared by every request; cheap to clone.
#[derive(Clone)]
pub struct ConversationRunner {
    store: Arc<dyn ClaimStore>,
    model: Arc<dyn ChatModel>,
    executor: ToolExecutor,
    publisher: Arc<dyn ClaimPublisher>,
    config: ConversationConfig,
    locks: Arc<LockMap>,
}

impl ConversationRunner {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        directory: Arc<dyn PolicyDirectory>,
        model: Arc<dyn ChatModel>,
        config: ConversationConfig,
    ) -> Self {
        Self {
            store,
            model,
            executor: ToolExecutor::new(directory, Arc::new(Lifecycle::standard())),
            publisher: Arc::new(NoopPublisher),
            config,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ClaimPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ClaimStore> {
        &self.store
    }

    /// Starts a claim, optionally with the assistant's opening line.
    pub async fn create_claim(&self, greeting: Option<&str>) -> Result<Claim> {
        let mut claim = Claim::new(Uuid::new_v4());
        if let Some(greeting) = greeting.map(str::trim).filter(|g| !g.is_empty()) {
            claim
                .transcript
                .push(TranscriptEntry::assistant(greeting, next_timestamp(None)));
        }
        let claim = self.store.create(claim).await?;
        info!(claim_id = %claim.id, "Claim created");
        self.publish(ClaimEvent {
            claim: claim.clone(),
            notifications: Vec::new(),
        })
        .await;
        Ok(claim)
    }

    /// Runs one turn. Turns on the same claim are serialized; nothing is
    /// persisted unless the whole turn succeeds.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let claim_id = request.claim_id;
        let entry = ClaimLock::acquire(&self.locks, claim_id);
        let result = {
            let _guard = entry.lock.lock().await;
            self.run_locked(request).await
        };
        drop(entry);

        if let Err(e) = &result {
            error!(claim_id = %claim_id, error = %e, transient = e.is_transient(), "Turn failed");
        }
        result
    }

    async fn run_locked(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let claim = self
            .store
            .load(request.claim_id)
            .await?
            .ok_or(ClaimError::ClaimNotFound(request.claim_id))?;
        info!(
            claim_id = %claim.id,
            stage = %claim.stage,
            strategy = ?self.config.strategy,
            "Running turn"
        );

        let mut transcript = reconcile_transcript(
            claim.id,
            &claim.transcript,
            &request.prior_transcript,
            &request.user_message,
        );

        let mut messages: Vec<ChatMessage> = claim
            .transcript
            .iter()
            .chain(transcript.iter())
            .map(ChatMessage::from)
            .collect();
        messages.push(ChatMessage::user(request.user_message.clone()));

        let mut state = TurnState::new(claim.clone());
        let reply = match self.config.strategy {
            OutputStrategy::ToolCalling => self.tool_loop(&mut state, messages).await?,
            OutputStrategy::JsonEnvelope => self.envelope_turn(&mut state, messages).await?,
        };
        let message = if reply.trim().is_empty() {
            FALLBACK_MESSAGE.to_string()
        } else {
            reply.trim().to_string()
        };

        let last = transcript
            .last()
            .map(|e| e.timestamp)
            .or_else(|| claim.last_timestamp());
        let user_at = next_timestamp(last);
        transcript.push(TranscriptEntry::user(request.user_message, user_at));
        transcript.push(TranscriptEntry::assistant(
            message.clone(),
            next_timestamp(Some(user_at)),
        ));

        let TurnState {
            patch,
            notifications,
            outputs,
            ..
        } = state;
        let commit = TurnCommit {
            claim_id: claim.id,
            expected_version: claim.version,
            patch,
            notifications,
            transcript,
        };
        let committed = self.store.commit_turn(&commit).await?;
        info!(
            claim_id = %committed.id,
            stage = %committed.stage,
            tools = outputs.len(),
            services = commit.patch.append_services.len(),
            notifications = commit.notifications.len(),
            "Turn committed"
        );

        self.publish(ClaimEvent {
            claim: committed.clone(),
            notifications: commit.notifications,
        })
        .await;

        Ok(TurnOutcome {
            message,
            stage: committed.stage,
            claim: committed,
            tool_outputs: outputs,
        })
    }

    async fn call_model(&self, request: ModelRequest) -> Result<ModelReply> {
        let timeout = self.config.model_timeout;
        tokio::time::timeout(timeout, self.model.complete(request))
            .await
            .map_err(|_| ClaimError::ModelTimeout(timeout))?
    }

    async fn tool_loop(
        &self,
        state: &mut TurnState,
        mut messages: Vec<ChatMessage>,
    ) -> Result<String> {
        let tools = tool_specs();
        let mut rounds = 0;
        loop {
            let request = ModelRequest {
                preamble: guidance::preamble(&state.claim, false),
                messages: messages.clone(),
                tools: tools.clone(),
            };
            let (content, calls) = match self.call_model(request).await? {
                ModelReply::Message(text) => return Ok(text),
                ModelReply::ToolCalls { content, calls } => (content, calls),
            };

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                warn!(
                    claim_id = %state.claim.id,
                    rounds = self.config.max_tool_rounds,
                    "Model kept calling tools, giving up on the turn"
                );
                return Err(ClaimError::ToolLoopExhausted(self.config.max_tool_rounds));
            }
            debug!(claim_id = %state.claim.id, round = rounds, calls = calls.len(), "Tool round");

            messages.push(ChatMessage::ToolRequest {
                content,
                calls: calls.clone(),
            });
            for call in calls {
                let output = self
                    .executor
                    .execute(state, &call.name, call.arguments)
                    .await?;
                messages.push(ChatMessage::ToolResult {
                    call_id: call.id,
                    content: output.content(),
                });
            }
        }
    }

    async fn envelope_turn(
        &self,
        state: &mut TurnState,
        messages: Vec<ChatMessage>,
    ) -> Result<String> {
        let request = ModelRequest {
            preamble: guidance::preamble(&state.claim, true),
            messages,
            tools: Vec::new(),
        };
        let raw = match self.call_model(request).await? {
            ModelReply::Message(text) => text,
            ModelReply::ToolCalls { content, .. } => {
                warn!(
                    claim_id = %state.claim.id,
                    "Tool calls returned in envelope mode, ignoring them"
                );
                content.unwrap_or_default()
            }
        };

        let (envelope, well_formed) = Envelope::parse_or_message(&raw);
        if !well_formed {
            return Ok(envelope.message);
        }

        if !envelope.extracted_data.is_empty() {
            let arguments = serde_json::to_value(&envelope.extracted_data)?;
            self.executor
                .execute(state, SAVE_CLAIM_DATA, arguments)
                .await?;
        }
        for decision in &envelope.decisions {
            self.executor
                .execute(
                    state,
                    &decision.tool,
                    decision.arguments_with_confirmation(envelope.user_confirmed),
                )
                .await?;
        }

        if let Some(next) = envelope.next_stage.as_deref() {
            if Stage::parse(next) != Some(state.claim.stage) {
                warn!(
                    claim_id = %state.claim.id,
                    advised = %next,
                    actual = %state.claim.stage,
                    "Envelope next_stage disagrees with the resulting stage"
                );
            }
        }
        Ok(envelope.message)
    }

    async fn publish(&self, event: ClaimEvent) {
        let claim_id = event.claim_id();
        if let Err(e) = self.publisher.publish(event).await {
            warn!(claim_id = %claim_id, error = %e, "Failed to publish claim update");
        }
    }
}

/// Entries the caller holds beyond the stored transcript, re-stamped so that
/// timestamps keep increasing. A caller history that does not extend the stored
/// one is ignored.
fn reconcile_transcript(
    claim_id: Uuid,
    stored: &[TranscriptEntry],
    supplied: &[TranscriptEntry],
    user_message: &str,
) -> Vec<TranscriptEntry> {
    if supplied.len() <= stored.len() {
        let is_prefix = supplied
            .iter()
            .zip(stored)
            .all(|(a, b)| a.same_utterance(b));
        if !is_prefix {
            warn!(
                claim_id = %claim_id,
                "Caller history diverges from the stored transcript, ignoring it"
            );
        }
        return Vec::new();
    }
    if !stored.iter().zip(supplied).all(|(a, b)| a.same_utterance(b)) {
        warn!(
            claim_id = %claim_id,
            "Caller history diverges from the stored transcript, ignoring it"
        );
        return Vec::new();
    }

    let mut extra: Vec<TranscriptEntry> = supplied[stored.len()..].to_vec();
    // Callers sometimes include the message being sent.
    if extra
        .last()
        .is_some_and(|e| e.same_utterance(&TranscriptEntry::user(user_message, e.timestamp)))
    {
        extra.pop();
    }

    let mut last = stored.last().map(|e| e.timestamp);
    for entry in &mut extra {
        if last.is_some_and(|l| entry.timestamp <= l) {
            entry.timestamp = next_timestamp(last);
        }
        last = Some(entry.timestamp);
    }
    if !extra.is_empty() {
        debug!(
            claim_id = %claim_id,
            entries = extra.len(),
            "Adopting caller-held transcript entries"
        );
    }
    extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::Role;
    use crate::directory::{DirectorySeed, InMemoryDirectory};
    use crate::llm::{ScriptedModel, ToolCall};
    use crate::storage::InMemoryClaimStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    fn runner(model: Arc<dyn ChatModel>, config: ConversationConfig) -> ConversationRunner {
        ConversationRunner::new(
            Arc::new(InMemoryClaimStore::new()),
            Arc::new(InMemoryDirectory::new(DirectorySeed::default())),
            model,
            config,
        )
    }

    fn save_call(id: &str) -> ModelReply {
        ModelReply::ToolCalls {
            content: None,
            calls: vec![ToolCall {
                id: id.into(),
                name: "save_claim_data".into(),
                arguments: json!({ "location": "I-95 mile 42" }),
            }],
        }
    }

    #[tokio::test]
    async fn empty_reply_gets_the_fallback_message() {
        let model = Arc::new(ScriptedModel::new([ModelReply::Message("  ".into())]));
        let runner = runner(model, ConversationConfig::default());
        let claim = runner.create_claim(Some("Hi, how can I help?")).await.unwrap();

        let outcome = runner
            .run_turn(TurnRequest::new(claim.id, "hello"))
            .await
            .unwrap();
        assert_eq!(outcome.message, FALLBACK_MESSAGE);
        assert_eq!(outcome.claim.transcript.len(), 3);
        assert_eq!(outcome.claim.transcript[1].role, Role::User);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back_before_the_final_answer() {
        let model = Arc::new(ScriptedModel::new([
            save_call("c1"),
            ModelReply::Message("Got it. What happened?".into()),
        ]));
        let runner = runner(model.clone(), ConversationConfig::default());
        let claim = runner.create_claim(None).await.unwrap();

        let outcome = runner
            .run_turn(TurnRequest::new(claim.id, "I'm at I-95 mile 42"))
            .await
            .unwrap();
        assert_eq!(outcome.claim.fields.location.as_deref(), Some("I-95 mile 42"));
        assert_eq!(outcome.tool_outputs.len(), 1);

        let requests = model.requests().await;
        assert_eq!(requests.len(), 2);
        assert!(matches!(
            requests[1].messages.last(),
            Some(ChatMessage::ToolResult { call_id, .. }) if call_id == "c1"
        ));
        assert!(requests[1].preamble.contains("- Location: I-95 mile 42"));
    }

    #[tokio::test]
    async fn runaway_tool_loop_fails_without_persisting() {
        let model = Arc::new(ScriptedModel::new((0..4).map(|i| save_call(&format!("c{i}")))));
        let config = ConversationConfig {
            max_tool_rounds: 2,
            ..Default::default()
        };
        let runner = runner(model, config);
        let claim = runner.create_claim(None).await.unwrap();

        let err = runner
            .run_turn(TurnRequest::new(claim.id, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::ToolLoopExhausted(2)));
        assert!(err.is_transient());

        let stored = runner.store().load(claim.id).await.unwrap().unwrap();
        assert!(stored.transcript.is_empty());
        assert_eq!(stored.fields.location, None);
    }

    struct SlowModel;

    #[async_trait]
    impl ChatModel for SlowModel {
        async fn complete(&self, _request: ModelRequest) -> Result<ModelReply> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ModelReply::Message("too late".into()))
        }
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let config = ConversationConfig {
            model_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let runner = runner(Arc::new(SlowModel), config);
        let claim = runner.create_claim(None).await.unwrap();
        let err = runner
            .run_turn(TurnRequest::new(claim.id, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::ModelTimeout(_)));
    }

    #[tokio::test]
    async fn cancelled_turn_releases_its_lock_slot() {
        let runner = runner(Arc::new(SlowModel), ConversationConfig::default());
        let claim = runner.create_claim(None).await.unwrap();

        let turn = tokio::time::timeout(
            Duration::from_millis(20),
            runner.run_turn(TurnRequest::new(claim.id, "hello")),
        )
        .await;
        assert!(turn.is_err());
        assert!(runner.locks.is_empty());
    }

    #[tokio::test]
    async fn waiting_turn_keeps_the_slot_alive() {
        let runner = runner(Arc::new(ScriptedModel::default()), ConversationConfig::default());
        let claim_id = Uuid::new_v4();
        let first = ClaimLock::acquire(&runner.locks, claim_id);
        let second = ClaimLock::acquire(&runner.locks, claim_id);
        drop(first);
        assert!(runner.locks.contains_key(&claim_id));
        drop(second);
        assert!(runner.locks.is_empty());
    }

    #[tokio::test]
    async fn unknown_claim_is_reported() {
        let runner = runner(Arc::new(ScriptedModel::default()), ConversationConfig::default());
        let err = runner
            .run_turn(TurnRequest::new(Uuid::new_v4(), "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::ClaimNotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn envelope_mode_runs_decisions_through_the_executor() {
        let reply = r#"```json
{"message": "Thanks! What happened to the car?", "extracted_data": {"location": "I-95 mile 42", "policy_number": "POL-1001"}, "user_confirmed": false, "decisions": [{"tool": "complete_claim", "arguments": {}}], "next_stage": "data_gathering"}
```"#;
        let model = Arc::new(ScriptedModel::new([ModelReply::Message(reply.into())]));
        let config = ConversationConfig {
            strategy: OutputStrategy::JsonEnvelope,
            ..Default::default()
        };
        let runner = runner(model.clone(), config);
        let claim = runner.create_claim(None).await.unwrap();

        let outcome = runner
            .run_turn(TurnRequest::new(claim.id, "POL-1001, on I-95 mile 42"))
            .await
            .unwrap();
        assert_eq!(outcome.message, "Thanks! What happened to the car?");
        assert_eq!(outcome.claim.fields.policy_number.as_deref(), Some("POL-1001"));
        assert_eq!(outcome.stage, Stage::DataGathering);
        assert_eq!(outcome.tool_outputs.len(), 2);
        assert!(!outcome.tool_outputs[1].success);
        assert!(model.requests().await[0].tools.is_empty());
    }

    #[tokio::test]
    async fn malformed_envelope_keeps_state_and_uses_raw_text() {
        let model = Arc::new(ScriptedModel::new([ModelReply::Message(
            "Sorry, where are you right now?".into(),
        )]));
        let config = ConversationConfig {
            strategy: OutputStrategy::JsonEnvelope,
            ..Default::default()
        };
        let runner = runner(model, config);
        let claim = runner.create_claim(None).await.unwrap();
        let outcome = runner
            .run_turn(TurnRequest::new(claim.id, "help"))
            .await
            .unwrap();
        assert_eq!(outcome.message, "Sorry, where are you right now?");
        assert!(outcome.tool_outputs.is_empty());
        assert_eq!(outcome.claim.fields, claim.fields);
    }

    #[test]
    fn caller_history_extending_the_stored_one_is_adopted() {
        let now = Utc::now();
        let stored = vec![TranscriptEntry::assistant("Hi!", now)];
        let mut agent = TranscriptEntry::assistant("Agent Sam here", now);
        agent.human_authored = true;
        let supplied = vec![
            TranscriptEntry::assistant("Hi!", now),
            agent,
            TranscriptEntry::user("my car died", now),
        ];

        let extra = reconcile_transcript(Uuid::new_v4(), &stored, &supplied, "my car died");
        assert_eq!(extra.len(), 1);
        assert!(extra[0].human_authored);
        assert!(extra[0].timestamp > now);
    }

    #[test]
    fn diverging_caller_history_is_ignored() {
        let now = Utc::now();
        let stored = vec![TranscriptEntry::assistant("Hi!", now)];
        let supplied = vec![
            TranscriptEntry::assistant("Hello there", now),
            TranscriptEntry::user("flat tire", now),
        ];
        assert!(reconcile_transcript(Uuid::new_v4(), &stored, &supplied, "x").is_empty());
        assert!(reconcile_transcript(Uuid::new_v4(), &stored, &[], "x").is_empty());
    }

    #[test]
    fn output_strategy_names() {
        assert_eq!(OutputStrategy::parse("json_envelope"), Some(OutputStrategy::JsonEnvelope));
        assert_eq!(OutputStrategy::parse("Tool-Calling"), Some(OutputStrategy::ToolCalling));
        assert_eq!(OutputStrategy::parse("regex"), None);
    }
}
