pub mod analytics;
pub mod claim;
pub mod conversation;
pub mod coverage;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod guidance;
pub mod lifecycle;
pub mod llm;
pub mod postgres;
pub mod prompts;
pub mod publish;
#[cfg(feature = "rig")]
pub mod rig_model;
pub mod storage;
pub mod tools;

// Re-export commonly used types
pub use analytics::{
    AnalyticsAssistant, AnalyticsMessage, ClaimsSummary, RecentClaim, analytics_preamble, summarize,
};
pub use claim::{
    ArrangedService, Claim, ClaimFields, ClaimPatch, CoverageDetails, CoverageStatus,
    DeliveryStatus, DispatchStatus, Notification, NotificationChannel, Role, TranscriptEntry,
};
pub use conversation::{
    ConversationConfig, ConversationRunner, OutputStrategy, TurnOutcome, TurnRequest,
};
pub use directory::{
    CoverageFlags, Customer, CustomerLookup, DirectorySeed, InMemoryDirectory, Policy,
    PolicyDirectory, Provider, ServiceType,
};
pub use error::{ClaimError, Result};
pub use lifecycle::{Lifecycle, Stage, TransitionError};
pub use llm::{ChatMessage, ChatModel, ModelReply, ModelRequest, ScriptedModel, ToolCall, ToolSpec};
pub use postgres::{PostgresClaimStore, PostgresDirectory};
pub use publish::{BroadcastPublisher, ClaimEvent, ClaimPublisher, NoopPublisher};
#[cfg(feature = "rig")]
pub use rig_model::RigChatModel;
pub use storage::{ClaimStore, InMemoryClaimStore, TurnCommit};
pub use tools::{ToolExecutor, ToolOutput, ToolRequest, TurnState};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_single_turn_round_trip() {
        let store = Arc::new(InMemoryClaimStore::new());
        let model = Arc::new(ScriptedModel::new([ModelReply::Message(
            "Where are you right now?".to_string(),
        )]));
        let runner = ConversationRunner::new(
            store.clone(),
            Arc::new(InMemoryDirectory::default()),
            model,
            ConversationConfig::default(),
        );

        let claim = runner.create_claim(Some("Hi, I'm here to help.")).await.unwrap();
        let outcome = runner
            .run_turn(TurnRequest::new(claim.id, "My car broke down"))
            .await
            .unwrap();

        assert_eq!(outcome.message, "Where are you right now?");
        assert_eq!(outcome.stage, Stage::DataGathering);

        let stored = store.load(claim.id).await.unwrap().unwrap();
        assert_eq!(stored.transcript.len(), 3);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_claim_snapshot_uses_wire_names() {
        let claim = Claim::new(uuid::Uuid::new_v4());
        let value = serde_json::to_value(&claim).unwrap();
        assert_eq!(value["status"], json!("data_gathering"));
        assert_eq!(value["is_covered"], json!("unknown"));
        assert_eq!(value["conversation_history"], json!([]));
    }
}
