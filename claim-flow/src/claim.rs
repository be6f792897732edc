use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::directory::ServiceType;
use crate::lifecycle::Stage;

/// Fields collected from the driver. Every field is independently settable and
/// a merge never clears a field that is already populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_model: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_year",
        skip_serializing_if = "Option::is_none"
    )]
    pub vehicle_year: Option<i32>,
}

/// Accepts `2019`, `"2019"` and `null`; anything else reads as absent.
fn lenient_year<'de, D>(deserializer: D) -> std::result::Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn non_empty(value: &Option<String>) -> Option<&String> {
    value.as_ref().filter(|v| !v.trim().is_empty())
}

impl ClaimFields {
    /// Copies every non-empty field of `other` over `self`.
    pub fn merge(&mut self, other: &ClaimFields) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = non_empty(value) {
                *slot = Some(v.trim().to_string());
            }
        }
        take(&mut self.driver_name, &other.driver_name);
        take(&mut self.driver_phone, &other.driver_phone);
        take(&mut self.driver_email, &other.driver_email);
        take(&mut self.policy_number, &other.policy_number);
        take(&mut self.location, &other.location);
        take(&mut self.incident_description, &other.incident_description);
        take(&mut self.vehicle_make, &other.vehicle_make);
        take(&mut self.vehicle_model, &other.vehicle_model);
        if let Some(year) = other.vehicle_year.filter(|y| *y > 0) {
            self.vehicle_year = Some(year);
        }
    }

    /// The same patch with empty strings and non-positive years dropped.
    pub fn without_empty(&self) -> ClaimFields {
        let mut cleaned = ClaimFields::default();
        cleaned.merge(self);
        cleaned
    }

    pub fn is_empty(&self) -> bool {
        self.without_empty() == ClaimFields::default()
    }

    /// Required before coverage can be checked.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if non_empty(&self.policy_number).is_none() {
            missing.push("policy_number");
        }
        if non_empty(&self.location).is_none() {
            missing.push("location");
        }
        if non_empty(&self.incident_description).is_none() {
            missing.push("incident_description");
        }
        missing
    }

    pub fn vehicle_label(&self) -> Option<String> {
        let year = self.vehicle_year.map(|y| y.to_string());
        let parts: Vec<&str> = [
            year.as_deref(),
            self.vehicle_make.as_deref(),
            self.vehicle_model.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    #[default]
    Unknown,
    Covered,
    NotCovered,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageDetails {
    pub services_needed: Vec<ServiceType>,
    pub services_covered: Vec<ServiceType>,
    pub services_not_covered: Vec<ServiceType>,
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Dispatched,
    EnRoute,
    Completed,
    Cancelled,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Dispatched => "dispatched",
            DispatchStatus::EnRoute => "en_route",
            DispatchStatus::Completed => "completed",
            DispatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "dispatched" => Some(DispatchStatus::Dispatched),
            "en_route" => Some(DispatchStatus::EnRoute),
            "completed" => Some(DispatchStatus::Completed),
            "cancelled" => Some(DispatchStatus::Cancelled),
            _ => None,
        }
    }
}

/// A dispatched service. Immutable once created apart from `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrangedService {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub service_type: ServiceType,
    pub provider_id: String,
    pub provider_name: String,
    pub provider_phone: Option<String>,
    #[serde(default)]
    pub provider_address: Option<String>,
    #[serde(default)]
    pub provider_rating: Option<f64>,
    pub estimated_arrival_minutes: Option<i32>,
    pub status: DispatchStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannel {
    Sms,
    Email,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Sms => "sms",
            NotificationChannel::Email => "email",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Outbound message queued for the dispatch collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub claim_id: Uuid,
    #[serde(rename = "type")]
    pub channel: NotificationChannel,
    pub recipient: String,
    pub message: String,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn pending(
        claim_id: Uuid,
        channel: NotificationChannel,
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            claim_id,
            channel,
            recipient: recipient.into(),
            message: message.into(),
            status: DeliveryStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            sent_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Written by a human agent during takeover rather than by the model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub human_authored: bool,
}

impl TranscriptEntry {
    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp,
            human_authored: false,
        }
    }

    pub fn assistant(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp,
            human_authored: false,
        }
    }

    /// Same speaker, same words. Timestamps are ignored since callers often
    /// resend history without them.
    pub fn same_utterance(&self, other: &TranscriptEntry) -> bool {
        self.role == other.role && self.content == other.content
    }
}

/// A timestamp strictly after `last`.
pub fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match last {
        Some(last) if now <= last => last + Duration::milliseconds(1),
        _ => now,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every commit; used for optimistic concurrency.
    pub version: i64,
    #[serde(rename = "status")]
    pub stage: Stage,
    #[serde(flatten)]
    pub fields: ClaimFields,
    #[serde(rename = "is_covered")]
    pub coverage: CoverageStatus,
    #[serde(default)]
    pub coverage_details: Option<CoverageDetails>,
    #[serde(default)]
    pub arranged_services: Vec<ArrangedService>,
    #[serde(default)]
    pub nearest_garage: Option<String>,
    #[serde(default, rename = "conversation_history")]
    pub transcript: Vec<TranscriptEntry>,
}

impl Claim {
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            version: 0,
            stage: Stage::DataGathering,
            fields: ClaimFields::default(),
            coverage: CoverageStatus::Unknown,
            coverage_details: None,
            arranged_services: Vec::new(),
            nearest_garage: None,
            transcript: Vec::new(),
        }
    }

    /// Applies a merge-patch. Applying the same patch twice is the same as
    /// applying it once, and the stage never moves backwards.
    pub fn apply(&mut self, patch: &ClaimPatch) {
        self.fields.merge(&patch.fields);
        if let Some(stage) = patch.stage {
            self.stage = self.stage.max(stage);
        }
        if let Some(coverage) = patch.coverage {
            self.coverage = coverage;
        }
        if let Some(details) = &patch.coverage_details {
            self.coverage_details = details.clone();
        }
        for service in &patch.append_services {
            if !self.arranged_services.iter().any(|s| s.id == service.id) {
                self.arranged_services.push(service.clone());
            }
        }
        if let Some(garage) = &patch.nearest_garage {
            self.nearest_garage = Some(garage.clone());
        }
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.transcript.last().map(|e| e.timestamp)
    }
}

/// Only the provided keys change when a patch is applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimPatch {
    #[serde(default)]
    pub fields: ClaimFields,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub coverage: Option<CoverageStatus>,
    /// `Some(None)` clears the recorded details.
    #[serde(default)]
    pub coverage_details: Option<Option<CoverageDetails>>,
    #[serde(default)]
    pub append_services: Vec<ArrangedService>,
    #[serde(default)]
    pub nearest_garage: Option<String>,
}

impl ClaimPatch {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.stage.is_none()
            && self.coverage.is_none()
            && self.coverage_details.is_none()
            && self.append_services.is_empty()
            && self.nearest_garage.is_none()
    }

    /// Folds `later` on top of `self`, as if both were applied in order.
    pub fn absorb(&mut self, later: ClaimPatch) {
        self.fields.merge(&later.fields);
        if let Some(stage) = later.stage {
            self.stage = Some(self.stage.map_or(stage, |s| s.max(stage)));
        }
        if later.coverage.is_some() {
            self.coverage = later.coverage;
        }
        if later.coverage_details.is_some() {
            self.coverage_details = later.coverage_details;
        }
        for service in later.append_services {
            if !self.append_services.iter().any(|s| s.id == service.id) {
                self.append_services.push(service);
            }
        }
        if later.nearest_garage.is_some() {
            self.nearest_garage = later.nearest_garage;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(policy: &str, location: &str) -> ClaimFields {
        ClaimFields {
            policy_number: Some(policy.to_string()),
            location: Some(location.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn merge_keeps_fields_missing_from_the_patch() {
        let mut claim = Claim::new(Uuid::new_v4());
        claim.apply(&ClaimPatch {
            fields: fields("POL-1001", "I-95 mile 42"),
            ..Default::default()
        });
        claim.apply(&ClaimPatch {
            fields: ClaimFields {
                incident_description: Some("flat tire".into()),
                location: Some("   ".into()),
                ..Default::default()
            },
            ..Default::default()
        });

        assert_eq!(claim.fields.policy_number.as_deref(), Some("POL-1001"));
        assert_eq!(claim.fields.location.as_deref(), Some("I-95 mile 42"));
        assert_eq!(claim.fields.incident_description.as_deref(), Some("flat tire"));
        assert!(claim.fields.missing_required().is_empty());
    }

    #[test]
    fn applying_a_patch_twice_is_idempotent() {
        let service = ArrangedService {
            id: Uuid::new_v4(),
            claim_id: Uuid::new_v4(),
            service_type: ServiceType::TowTruck,
            provider_id: "g1".into(),
            provider_name: "Quick Tow".into(),
            provider_phone: Some("555-1000".into()),
            provider_address: None,
            provider_rating: Some(4.5),
            estimated_arrival_minutes: Some(30),
            status: DispatchStatus::Dispatched,
            created_at: Utc::now(),
        };
        let patch = ClaimPatch {
            fields: fields("POL-1001", "I-95"),
            stage: Some(Stage::ArrangingServices),
            coverage: Some(CoverageStatus::Covered),
            append_services: vec![service],
            nearest_garage: Some("Quick Tow".into()),
            ..Default::default()
        };

        let mut once = Claim::new(Uuid::new_v4());
        once.apply(&patch);
        let mut twice = once.clone();
        twice.apply(&patch);

        assert_eq!(once, twice);
        assert_eq!(twice.arranged_services.len(), 1);
    }

    #[test]
    fn stage_in_a_patch_never_regresses() {
        let mut claim = Claim::new(Uuid::new_v4());
        claim.apply(&ClaimPatch {
            stage: Some(Stage::CoverageCheck),
            ..Default::default()
        });
        claim.apply(&ClaimPatch {
            stage: Some(Stage::DataGathering),
            ..Default::default()
        });
        assert_eq!(claim.stage, Stage::CoverageCheck);
    }

    #[test]
    fn vehicle_year_accepts_strings() {
        let parsed: ClaimFields =
            serde_json::from_str(r#"{"vehicle_year": "2018", "vehicle_make": "Honda"}"#).unwrap();
        assert_eq!(parsed.vehicle_year, Some(2018));
        assert_eq!(parsed.vehicle_label().as_deref(), Some("2018 Honda"));

        let garbage: ClaimFields = serde_json::from_str(r#"{"vehicle_year": "soon"}"#).unwrap();
        assert_eq!(garbage.vehicle_year, None);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let far_future = Utc::now() + Duration::hours(1);
        let next = next_timestamp(Some(far_future));
        assert!(next > far_future);
    }

    #[test]
    fn human_authored_entries_deserialize_as_history() {
        let entry: TranscriptEntry = serde_json::from_str(
            r#"{"role":"assistant","content":"Agent Sam here","human_authored":true}"#,
        )
        .unwrap();
        assert_eq!(entry.role, Role::Assistant);
        assert!(entry.human_authored);
    }
}
