//! Portfolio figures over every claim, and a model-backed assistant that
//! answers questions about them.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::claim::{Claim, CoverageStatus, Role};
use crate::directory::ServiceType;
use crate::error::{ClaimError, Result};
use crate::lifecycle::Stage;
use crate::llm::{ChatMessage, ChatModel, ModelReply, ModelRequest};
use crate::prompts::{ANALYTICS_FALLBACK, ANALYTICS_PROMPT};
use crate::storage::ClaimStore;

const RECENT_CLAIMS: usize = 5;
const RAW_CLAIMS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentClaim {
    pub id: Uuid,
    pub driver: Option<String>,
    pub status: Stage,
    pub covered: CoverageStatus,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimsSummary {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub covered: usize,
    pub not_covered: usize,
    /// Covered claims over all claims, rounded to a whole percent.
    pub coverage_rate_percent: u32,
    pub status_breakdown: BTreeMap<Stage, usize>,
    /// Claims whose recorded decision covered each service.
    pub services_covered: BTreeMap<&'static str, usize>,
    /// Mean minutes from creation to the last write of completed claims.
    pub average_resolution_minutes: u64,
    pub recent: Vec<RecentClaim>,
}

/// `claims` is expected newest first, as [`ClaimStore::list_claims`] returns them.
pub fn summarize(claims: &[Claim]) -> ClaimsSummary {
    let total = claims.len();
    let completed: Vec<&Claim> = claims
        .iter()
        .filter(|c| c.stage == Stage::Completed)
        .collect();
    let covered = claims
        .iter()
        .filter(|c| c.coverage == CoverageStatus::Covered)
        .count();
    let not_covered = claims
        .iter()
        .filter(|c| c.coverage == CoverageStatus::NotCovered)
        .count();

    let mut status_breakdown = BTreeMap::new();
    for claim in claims {
        *status_breakdown.entry(claim.stage).or_insert(0) += 1;
    }

    let mut services_covered: BTreeMap<&'static str, usize> = [
        ServiceType::TowTruck,
        ServiceType::RepairTruck,
        ServiceType::Taxi,
        ServiceType::RentalCar,
    ]
    .iter()
    .map(|s| (s.as_str(), 0))
    .collect();
    for details in claims.iter().filter_map(|c| c.coverage_details.as_ref()) {
        for service in &details.services_covered {
            *services_covered.entry(service.as_str()).or_insert(0) += 1;
        }
    }

    let coverage_rate_percent = if total == 0 {
        0
    } else {
        (covered as f64 * 100.0 / total as f64).round() as u32
    };

    let average_resolution_minutes = if completed.is_empty() {
        0
    } else {
        let minutes: f64 = completed
            .iter()
            .map(|c| (c.updated_at - c.created_at).num_seconds().max(0) as f64 / 60.0)
            .sum();
        (minutes / completed.len() as f64).round() as u64
    };

    let recent = claims
        .iter()
        .take(RECENT_CLAIMS)
        .map(|c| RecentClaim {
            id: c.id,
            driver: c.fields.driver_name.clone(),
            status: c.stage,
            covered: c.coverage,
            location: c.fields.location.clone(),
            created_at: c.created_at,
        })
        .collect();

    ClaimsSummary {
        total,
        active: total - completed.len(),
        completed: completed.len(),
        covered,
        not_covered,
        coverage_rate_percent,
        status_breakdown,
        services_covered,
        average_resolution_minutes,
        recent,
    }
}

fn coverage_label(coverage: CoverageStatus) -> &'static str {
    match coverage {
        CoverageStatus::Unknown => "coverage pending",
        CoverageStatus::Covered => "covered",
        CoverageStatus::NotCovered => "not covered",
    }
}

/// The assistant's instructions followed by the figures and a sample of the
/// most recent claims, transcripts left out.
pub fn analytics_preamble(summary: &ClaimsSummary, claims: &[Claim]) -> Result<String> {
    let mut text = String::from(ANALYTICS_PROMPT.trim());
    // Writing to a String cannot fail.
    let _ = writeln!(text, "\n\nCURRENT CLAIMS DATA:");
    let _ = writeln!(text, "- Total claims: {}", summary.total);
    let _ = writeln!(text, "- Active claims: {}", summary.active);
    let _ = writeln!(text, "- Completed claims: {}", summary.completed);
    let _ = writeln!(
        text,
        "- Covered: {}, not covered: {}, coverage rate: {}%",
        summary.covered, summary.not_covered, summary.coverage_rate_percent
    );
    let _ = writeln!(
        text,
        "- Average resolution time: {} minutes",
        summary.average_resolution_minutes
    );

    let _ = writeln!(text, "\nSTATUS BREAKDOWN:");
    for (stage, count) in &summary.status_breakdown {
        let _ = writeln!(text, "- {stage}: {count}");
    }

    let _ = writeln!(text, "\nSERVICES COVERED:");
    for (service, count) in &summary.services_covered {
        let _ = writeln!(text, "- {service}: {count}");
    }

    let _ = writeln!(text, "\nRECENT CLAIMS:");
    for claim in &summary.recent {
        let _ = writeln!(
            text,
            "- {} | {} | {} | {} | {}",
            claim.driver.as_deref().unwrap_or("unknown driver"),
            claim.status,
            coverage_label(claim.covered),
            claim.location.as_deref().unwrap_or("unknown location"),
            claim.created_at.to_rfc3339()
        );
    }

    let sample = claims
        .iter()
        .take(RAW_CLAIMS)
        .map(|claim| -> Result<Value> {
            let mut value = serde_json::to_value(claim)?;
            if let Value::Object(map) = &mut value {
                map.remove("conversation_history");
            }
            Ok(value)
        })
        .collect::<Result<Vec<Value>>>()?;
    let _ = write!(
        text,
        "\nCLAIM RECORDS (newest {}):\n{}",
        sample.len(),
        serde_json::to_string(&sample)?
    );
    Ok(text)
}

/// One earlier exchange in an analytics chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsMessage {
    pub role: Role,
    pub content: String,
}

impl From<&AnalyticsMessage> for ChatMessage {
    fn from(message: &AnalyticsMessage) -> Self {
        match message.role {
            Role::User => ChatMessage::user(message.content.clone()),
            Role::Assistant => ChatMessage::assistant(message.content.clone()),
        }
    }
}

/// Answers dashboard questions from the current claim records. Stateless:
/// the caller carries the chat history.
#[derive(Clone)]
pub struct AnalyticsAssistant {
    store: Arc<dyn ClaimStore>,
    model: Arc<dyn ChatModel>,
    timeout: Duration,
}

impl AnalyticsAssistant {
    pub fn new(store: Arc<dyn ClaimStore>, model: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self {
            store,
            model,
            timeout,
        }
    }

    pub async fn summary(&self) -> Result<ClaimsSummary> {
        let claims = self.store.list_claims().await?;
        Ok(summarize(&claims))
    }

    pub async fn ask(&self, question: &str, history: &[AnalyticsMessage]) -> Result<String> {
        let claims = self.store.list_claims().await?;
        let summary = summarize(&claims);
        let mut messages: Vec<ChatMessage> = history.iter().map(ChatMessage::from).collect();
        messages.push(ChatMessage::user(question));

        let request = ModelRequest {
            preamble: analytics_preamble(&summary, &claims)?,
            messages,
            tools: Vec::new(),
        };
        debug!(claims = claims.len(), history = history.len(), "Asking analytics model");
        let reply = tokio::time::timeout(self.timeout, self.model.complete(request))
            .await
            .map_err(|_| ClaimError::ModelTimeout(self.timeout))??;

        let text = match reply {
            ModelReply::Message(text) => text,
            ModelReply::ToolCalls { content, .. } => content.unwrap_or_default(),
        };
        info!(claims = claims.len(), "Analytics question answered");
        if text.trim().is_empty() {
            Ok(ANALYTICS_FALLBACK.to_string())
        } else {
            Ok(text.trim().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{ClaimFields, CoverageDetails};
    use crate::llm::ScriptedModel;
    use crate::storage::InMemoryClaimStore;

    fn claim(stage: Stage, coverage: CoverageStatus, minutes_open: i64) -> Claim {
        let mut claim = Claim::new(Uuid::new_v4());
        claim.created_at = Utc::now() - chrono::Duration::minutes(minutes_open);
        claim.updated_at = Utc::now();
        claim.stage = stage;
        claim.coverage = coverage;
        claim.fields = ClaimFields {
            driver_name: Some("Jane Driver".into()),
            location: Some("I-95 mile 42".into()),
            ..Default::default()
        };
        claim
    }

    #[test]
    fn empty_portfolio_has_zero_rates() {
        let summary = summarize(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.coverage_rate_percent, 0);
        assert_eq!(summary.average_resolution_minutes, 0);
        assert!(summary.recent.is_empty());
        assert_eq!(summary.services_covered["tow_truck"], 0);
    }

    #[test]
    fn figures_follow_the_claim_records() {
        let mut towed = claim(Stage::Completed, CoverageStatus::Covered, 30);
        towed.coverage_details = Some(CoverageDetails {
            services_needed: vec![ServiceType::TowTruck, ServiceType::Taxi],
            services_covered: vec![ServiceType::TowTruck, ServiceType::Taxi],
            services_not_covered: vec![],
            explanation: "Covered".into(),
        });
        let claims = vec![
            claim(Stage::DataGathering, CoverageStatus::Unknown, 5),
            claim(Stage::CoverageCheck, CoverageStatus::NotCovered, 10),
            towed,
            claim(Stage::Completed, CoverageStatus::Covered, 60),
        ];

        let summary = summarize(&claims);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.active, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.covered, 2);
        assert_eq!(summary.not_covered, 1);
        assert_eq!(summary.coverage_rate_percent, 50);
        assert_eq!(summary.average_resolution_minutes, 45);
        assert_eq!(summary.status_breakdown[&Stage::Completed], 2);
        assert!(!summary.status_breakdown.contains_key(&Stage::ArrangingServices));
        assert_eq!(summary.services_covered["tow_truck"], 1);
        assert_eq!(summary.services_covered["repair_truck"], 0);
        assert_eq!(summary.recent.len(), 4);
        assert_eq!(summary.recent[0].status, Stage::DataGathering);

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["status_breakdown"]["completed"], 2);
    }

    #[test]
    fn only_five_claims_are_recent() {
        let claims: Vec<Claim> = (0..7)
            .map(|i| claim(Stage::DataGathering, CoverageStatus::Unknown, i))
            .collect();
        assert_eq!(summarize(&claims).recent.len(), 5);
    }

    #[test]
    fn preamble_carries_figures_without_transcripts() {
        let mut open = claim(Stage::CoverageCheck, CoverageStatus::Covered, 5);
        open.transcript.push(crate::claim::TranscriptEntry::user(
            "my secret message",
            Utc::now(),
        ));
        let claims = vec![open];
        let text = analytics_preamble(&summarize(&claims), &claims).unwrap();
        assert!(text.contains("Total claims: 1"));
        assert!(text.contains("coverage rate: 100%"));
        assert!(text.contains("coverage_check: 1"));
        assert!(text.contains("Jane Driver"));
        assert!(!text.contains("my secret message"));
    }

    #[tokio::test]
    async fn assistant_answers_from_the_store() {
        let store = Arc::new(InMemoryClaimStore::new());
        store
            .create(claim(Stage::Completed, CoverageStatus::Covered, 20))
            .await
            .unwrap();
        let model = Arc::new(ScriptedModel::new([ModelReply::Message(
            " One claim, fully covered. ".into(),
        )]));
        let assistant = AnalyticsAssistant::new(store, model.clone(), Duration::from_secs(5));

        let history = vec![
            AnalyticsMessage {
                role: Role::User,
                content: "Hi".into(),
            },
            AnalyticsMessage {
                role: Role::Assistant,
                content: "Hello, ask me about your claims.".into(),
            },
        ];
        let answer = assistant.ask("How are we doing?", &history).await.unwrap();
        assert_eq!(answer, "One claim, fully covered.");

        let requests = model.requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].tools.is_empty());
        assert!(requests[0].preamble.contains("Total claims: 1"));
        assert_eq!(requests[0].messages.len(), 3);
        assert_eq!(requests[0].messages[2], ChatMessage::user("How are we doing?"));
    }

    #[tokio::test]
    async fn blank_answer_falls_back() {
        let store = Arc::new(InMemoryClaimStore::new());
        let model = Arc::new(ScriptedModel::new([ModelReply::Message("".into())]));
        let assistant = AnalyticsAssistant::new(store, model, Duration::from_secs(5));
        let answer = assistant.ask("Anything?", &[]).await.unwrap();
        assert_eq!(answer, ANALYTICS_FALLBACK);
    }
}
