//! One inbound chat message in, one reply out.
//!
//! ```text
//! validate ─► rate limit ─► ensure account ─► balance > 0?
//!    ─► window + pending message ─► assemble ─► generate ─► clean
//!    ─► commit (debit + both messages, one transaction)
//! ```
//!
//! Nothing is written before generation succeeds. A failed or timed-out
//! generation leaves the balance and the log exactly as they were.

use std::sync::Arc;
use std::time::Duration;

use alice_agent::{
    ContextAssembler, ContextBudget, GenerationRequest, Generator, Message, Persona,
    ResponseCleaner, SamplingParams, TokenCounter,
};
use alice_store::{ConversationStore, CreditLedger, MessageRole, StoredMessage};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::ChatError;
use crate::rate_limiter::RateLimiter;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Pipeline settings, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub min_interval: Duration,
    /// Longest accepted inbound message, in characters.
    pub max_message_chars: usize,
    pub budget: ContextBudget,
    pub sampling: SamplingParams,
    pub persona: Persona,
    pub cleaner: ResponseCleaner,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(3),
            max_message_chars: 4000,
            budget: ContextBudget::default(),
            sampling: SamplingParams::default(),
            persona: Persona::new("You are Alice, a warm and witty companion.", "friend"),
            cleaner: ResponseCleaner::default(),
        }
    }
}

/// What the transport hands over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub owner_id: i64,
    pub text: String,
    pub display_name: Option<String>,
}

impl InboundMessage {
    pub fn new(owner_id: i64, text: impl Into<String>) -> Self {
        Self {
            owner_id,
            text: text.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// A delivered reply and what it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub owner_id: i64,
    pub text: String,
    /// Balance after the debit.
    pub balance: i64,
    /// Log id of the stored reply.
    pub reply_message_id: i64,
    /// Oldest history messages left out of the prompt.
    pub dropped: usize,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ChatPipeline {
    ledger: CreditLedger,
    conversations: ConversationStore,
    limiter: RateLimiter,
    generator: Arc<dyn Generator>,
    assembler: ContextAssembler,
    config: PipelineConfig,
}

impl ChatPipeline {
    pub fn new(
        ledger: CreditLedger,
        conversations: ConversationStore,
        limiter: RateLimiter,
        generator: Arc<dyn Generator>,
        counter: Arc<dyn TokenCounter>,
        config: PipelineConfig,
    ) -> Self {
        let assembler = ContextAssembler::new(counter, config.budget);
        Self {
            ledger,
            conversations,
            limiter,
            generator,
            assembler,
            config,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one message through the pipeline.
    #[instrument(
        skip(self, inbound),
        fields(owner = inbound.owner_id, request_id = %Uuid::now_v7())
    )]
    pub async fn handle(&self, inbound: &InboundMessage) -> Result<ChatReply, ChatError> {
        let result = self.run(inbound).await;
        match &result {
            Ok(reply) => info!(balance = reply.balance, dropped = reply.dropped, "reply delivered"),
            Err(e @ ChatError::ContextOverflow { .. }) => {
                error!(error = %e, "persona does not fit the context budget; fix the configuration")
            }
            Err(e) if e.is_failure() => warn!(error = %e, code = e.code(), "chat turn failed"),
            Err(e) => debug!(code = e.code(), "chat turn declined"),
        }
        result
    }

    async fn run(&self, inbound: &InboundMessage) -> Result<ChatReply, ChatError> {
        let owner = inbound.owner_id;
        let text = self.validate(&inbound.text)?;

        if !self
            .limiter
            .try_acquire(owner, self.config.min_interval)
            .await
        {
            let retry_after = self
                .limiter
                .remaining(owner, self.config.min_interval)
                .await;
            return Err(ChatError::RateLimited { retry_after });
        }

        let account = self.ledger.initialize_if_absent(owner).await?;
        if account.credit_balance <= 0 {
            return Err(ChatError::InsufficientCredit { owner });
        }

        let mut window: Vec<Message> = self
            .conversations
            .current_window(owner)
            .await?
            .into_iter()
            .map(to_prompt_message)
            .collect();
        window.push(Message::user(text));

        let persona = self.config.persona.render(inbound.display_name.as_deref());
        let context = self
            .assembler
            .assemble(&persona, &account.preferences, &window)?;
        debug!(
            kept = context.kept(),
            dropped = context.dropped,
            tokens = context.tokens_used,
            budget = context.budget,
            "prompt assembled"
        );
        let dropped = context.dropped;

        let request = GenerationRequest::new(context.messages, self.config.sampling.clone());
        let raw = self.generator.generate(&request).await?;
        let reply = self.config.cleaner.clean(&raw);

        let receipt = self
            .conversations
            .commit_exchange(owner, text, &reply)
            .await?;

        Ok(ChatReply {
            owner_id: owner,
            text: reply,
            balance: receipt.balance,
            reply_message_id: receipt.reply_message_id,
            dropped,
        })
    }

    fn validate<'a>(&self, text: &'a str) -> Result<&'a str, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let chars = text.chars().count();
        if chars > self.config.max_message_chars {
            return Err(ChatError::MessageTooLong {
                chars,
                max: self.config.max_message_chars,
            });
        }
        Ok(text)
    }

    /// Start a fresh conversation; history stays stored.
    pub async fn reset(&self, owner: i64) -> Result<i64, ChatError> {
        self.ledger.initialize_if_absent(owner).await?;
        Ok(self.conversations.reset(owner).await?)
    }
}

fn to_prompt_message(stored: StoredMessage) -> Message {
    match stored.role {
        MessageRole::User => Message::user(stored.content),
        MessageRole::Assistant => Message::assistant(stored.content),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alice_agent::{AgentError, CharRatioCounter, Role};
    use alice_store::{Database, MokaCounterStore};
    use async_trait::async_trait;

    use super::*;

    /// Replies from a script, then "reply N".
    #[derive(Default)]
    struct ScriptedGenerator {
        script: Mutex<VecDeque<alice_agent::Result<String>>>,
        calls: AtomicUsize,
        last: Mutex<Option<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        fn push(&self, reply: alice_agent::Result<String>) {
            self.script.lock().unwrap().push_back(reply);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> GenerationRequest {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, request: &GenerationRequest) -> alice_agent::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            *self.last.lock().unwrap() = Some(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("reply {n}")))
        }
    }

    struct Harness {
        pipeline: ChatPipeline,
        generator: Arc<ScriptedGenerator>,
    }

    async fn harness(config: PipelineConfig) -> Harness {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = ChatPipeline::new(
            CreditLedger::new(db.clone(), 10),
            ConversationStore::new(db),
            RateLimiter::new(Arc::new(MokaCounterStore::new(100, Duration::from_secs(60)))),
            generator.clone(),
            Arc::new(CharRatioCounter::default()),
            config,
        );
        Harness {
            pipeline,
            generator,
        }
    }

    fn unthrottled() -> PipelineConfig {
        PipelineConfig {
            min_interval: Duration::ZERO,
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn credit_economy_end_to_end() {
        let h = harness(unthrottled()).await;
        let ledger = h.pipeline.ledger();

        for i in 1..=10 {
            let reply = h.pipeline.handle(&InboundMessage::new(1, format!("msg {i}"))).await.unwrap();
            assert_eq!(reply.balance, 10 - i);
        }
        assert_eq!(ledger.get_balance(1).await.unwrap(), 0);

        let err = h.pipeline.handle(&InboundMessage::new(1, "one more")).await.unwrap_err();
        assert!(matches!(err, ChatError::InsufficientCredit { owner: 1 }));
        assert_eq!(ledger.get_balance(1).await.unwrap(), 0);
        assert_eq!(h.generator.calls(), 10);

        assert_eq!(ledger.credit(1, 10).await.unwrap(), 10);

        let reply = h.pipeline.handle(&InboundMessage::new(1, "back again")).await.unwrap();
        assert_eq!(reply.balance, 9);
        assert_eq!(h.pipeline.conversations().count_all(1).await.unwrap(), 22);
    }

    #[tokio::test]
    async fn failed_generation_costs_nothing() {
        let h = harness(unthrottled()).await;
        h.generator.push(Err(AgentError::RetriesExhausted {
            attempts: 3,
            last: Box::new(AgentError::Unavailable {
                reason: "503".into(),
            }),
        }));

        let err = h.pipeline.handle(&InboundMessage::new(1, "hello?")).await.unwrap_err();
        assert!(matches!(err, ChatError::GenerationUnavailable { .. }));
        assert_eq!(h.pipeline.ledger().get_balance(1).await.unwrap(), 10);
        assert_eq!(h.pipeline.conversations().count_all(1).await.unwrap(), 0);

        let reply = h.pipeline.handle(&InboundMessage::new(1, "hello?")).await.unwrap();
        assert_eq!(reply.balance, 9);
    }

    #[tokio::test]
    async fn rejected_request_is_reported_distinctly() {
        let h = harness(unthrottled()).await;
        h.generator.push(Err(AgentError::InvalidRequest {
            status: 401,
            reason: "bad token".into(),
        }));
        let err = h.pipeline.handle(&InboundMessage::new(1, "hi")).await.unwrap_err();
        assert_eq!(err.code(), "generation_rejected");
        assert_eq!(h.pipeline.ledger().get_balance(1).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn history_and_pending_message_reach_the_generator() {
        let h = harness(unthrottled()).await;
        h.pipeline.handle(&InboundMessage::new(1, "first")).await.unwrap();
        h.pipeline
            .handle(&InboundMessage::new(1, "  second  ").with_display_name("Dana"))
            .await
            .unwrap();

        let request = h.generator.last_request();
        let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(request.messages[1].content, "first");
        assert_eq!(request.messages[2].content, "reply 1");
        assert_eq!(request.messages[3].content, "second");
    }

    #[tokio::test]
    async fn reply_is_cleaned_before_storage() {
        let h = harness(unthrottled()).await;
        h.generator.push(Ok("<|im_start|>assistant\nAssistant: hey!<|im_end|>".into()));
        let reply = h.pipeline.handle(&InboundMessage::new(1, "hi")).await.unwrap();
        assert_eq!(reply.text, "hey!");

        let log = h.pipeline.conversations().full_history(1).await.unwrap();
        assert_eq!(log[1].content, "hey!");
        assert_eq!(reply.reply_message_id, log[1].id);
    }

    #[tokio::test]
    async fn reset_starts_a_fresh_window() {
        let h = harness(unthrottled()).await;
        h.pipeline.handle(&InboundMessage::new(1, "remember me")).await.unwrap();
        h.pipeline.reset(1).await.unwrap();
        h.pipeline.handle(&InboundMessage::new(1, "who am I?")).await.unwrap();

        let request = h.generator.last_request();
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].content, "who am I?");
        assert_eq!(h.pipeline.conversations().count_all(1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_work() {
        let config = PipelineConfig {
            max_message_chars: 10,
            ..unthrottled()
        };
        let h = harness(config).await;

        assert!(matches!(
            h.pipeline.handle(&InboundMessage::new(1, "   ")).await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(matches!(
            h.pipeline.handle(&InboundMessage::new(1, "x".repeat(11))).await,
            Err(ChatError::MessageTooLong { chars: 11, max: 10 })
        ));
        assert_eq!(h.generator.calls(), 0);
        assert!(h.pipeline.ledger().get_balance(1).await.is_err());
    }

    #[tokio::test]
    async fn rapid_messages_are_rate_limited() {
        let h = harness(PipelineConfig::default()).await;
        h.pipeline.handle(&InboundMessage::new(1, "one")).await.unwrap();

        let err = h.pipeline.handle(&InboundMessage::new(1, "two")).await.unwrap_err();
        match err {
            ChatError::RateLimited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(3));
            }
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(h.generator.calls(), 1);
        assert_eq!(h.pipeline.ledger().get_balance(1).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn oversized_persona_is_context_overflow() {
        let config = PipelineConfig {
            budget: ContextBudget::new(100, 50),
            persona: Persona::new("x".repeat(1000), "friend"),
            ..unthrottled()
        };
        let h = harness(config).await;
        let err = h.pipeline.handle(&InboundMessage::new(1, "hi")).await.unwrap_err();
        assert!(matches!(err, ChatError::ContextOverflow { .. }));
        assert!(err.is_failure());
        assert_eq!(h.generator.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_turns_never_overspend() {
        let h = harness(unthrottled()).await;
        h.pipeline.ledger().initialize_if_absent(1).await.unwrap();

        // Drain to 2 credits, then race 6 turns.
        for _ in 0..8 {
            h.pipeline.ledger().debit_one(1).await.unwrap();
        }
        let turns = (0..6).map(|i| {
            let pipeline = h.pipeline.clone();
            tokio::spawn(async move {
                pipeline.handle(&InboundMessage::new(1, format!("race {i}"))).await
            })
        });
        let results: Vec<_> = futures::future::join_all(turns)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 2);
        assert_eq!(h.pipeline.ledger().get_balance(1).await.unwrap(), 0);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(err, ChatError::InsufficientCredit { .. }));
        }
        assert_eq!(h.pipeline.conversations().count_all(1).await.unwrap(), 4);
    }
}
