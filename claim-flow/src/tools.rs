//! The fixed registry of operations the model can invoke.
//!
//! Every operation works on a [`TurnState`], the turn-local working copy of the
//! claim. Conversational failures come back as `success: false` outputs for the
//! model to react to; `Err` is reserved for an unreachable directory.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::claim::{
    ArrangedService, Claim, ClaimFields, ClaimPatch, CoverageStatus, DispatchStatus, Notification,
    NotificationChannel,
};
use crate::coverage;
use crate::directory::{
    CoverageFlags, CustomerLookup, Policy, PolicyDirectory, Provider, ServiceType,
};
use crate::error::Result;
use crate::lifecycle::{Lifecycle, Stage};
use crate::llm::ToolSpec;

pub const SAVE_CLAIM_DATA: &str = "save_claim_data";
pub const GET_CUSTOMER_BY_POLICY: &str = "get_customer_by_policy";
pub const FIND_POLICY_BY_PHONE: &str = "find_policy_by_phone";
pub const FIND_POLICY_BY_NAME: &str = "find_policy_by_name";
pub const GET_POLICY_COVERAGE: &str = "get_policy_coverage";
pub const RECORD_COVERAGE_DECISION: &str = "record_coverage_decision";
pub const GET_AVAILABLE_PROVIDERS: &str = "get_available_providers";
pub const ARRANGE_SERVICES: &str = "arrange_services";
pub const COMPLETE_CLAIM: &str = "complete_claim";

pub const TOOL_NAMES: [&str; 9] = [
    SAVE_CLAIM_DATA,
    GET_CUSTOMER_BY_POLICY,
    FIND_POLICY_BY_PHONE,
    FIND_POLICY_BY_NAME,
    GET_POLICY_COVERAGE,
    RECORD_COVERAGE_DECISION,
    GET_AVAILABLE_PROVIDERS,
    ARRANGE_SERVICES,
    COMPLETE_CLAIM,
];

/// Tools whose stage transition needs the driver's confirmation.
pub const CONFIRMING_TOOLS: [&str; 3] =
    [RECORD_COVERAGE_DECISION, ARRANGE_SERVICES, COMPLETE_CLAIM];

mod lenient {
    use serde::{Deserialize, Deserializer, de::Error};

    use crate::directory::ServiceType;

    fn parse<E: Error>(raw: &str) -> std::result::Result<ServiceType, E> {
        ServiceType::parse_lenient(raw)
            .ok_or_else(|| E::custom(format!("unknown service type `{raw}`")))
    }

    pub fn service<'de, D>(deserializer: D) -> std::result::Result<ServiceType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw)
    }

    pub fn services<'de, D>(deserializer: D) -> std::result::Result<Vec<ServiceType>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter().map(|r| parse(r)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoverageDecisionArgs {
    /// The model's own reading; the recorded value is computed from the policy.
    #[serde(default)]
    pub is_covered: Option<bool>,
    #[serde(deserialize_with = "lenient::services")]
    pub services_needed: Vec<ServiceType>,
    #[serde(default)]
    pub services_covered: Vec<String>,
    #[serde(default)]
    pub services_not_covered: Vec<String>,
    #[serde(default)]
    pub coverage_explanation: String,
    #[serde(default)]
    pub user_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceRequest {
    #[serde(deserialize_with = "lenient::service")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArrangeServicesArgs {
    pub services_to_arrange: Vec<ServiceRequest>,
    #[serde(default)]
    pub notification_message: String,
    #[serde(default)]
    pub user_confirmed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompleteClaimArgs {
    #[serde(default)]
    pub user_confirmed: bool,
}

/// One validated tool invocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolRequest {
    SaveClaimData(ClaimFields),
    GetCustomerByPolicy { policy_number: String },
    FindPolicyByPhone { phone_number: String },
    FindPolicyByName { holder_name: String },
    GetPolicyCoverage { policy_number: String },
    RecordCoverageDecision(CoverageDecisionArgs),
    GetAvailableProviders {
        #[serde(deserialize_with = "lenient::service")]
        service_type: ServiceType,
    },
    ArrangeServices(ArrangeServicesArgs),
    CompleteClaim(CompleteClaimArgs),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolParseError {
    UnknownTool(String),
    InvalidArguments { tool: String, reason: String },
}

impl std::fmt::Display for ToolParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolParseError::UnknownTool(name) => write!(f, "Unknown tool: {name}"),
            ToolParseError::InvalidArguments { tool, reason } => {
                write!(f, "Invalid arguments for {tool}: {reason}")
            }
        }
    }
}

impl ToolRequest {
    pub fn parse(name: &str, arguments: Value) -> std::result::Result<Self, ToolParseError> {
        if !TOOL_NAMES.contains(&name) {
            return Err(ToolParseError::UnknownTool(name.to_string()));
        }
        let arguments = match arguments {
            Value::Null => json!({}),
            // Some providers hand arguments over as a JSON-encoded string.
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            other => other,
        };
        serde_json::from_value(json!({ "tool": name, "arguments": arguments })).map_err(|e| {
            ToolParseError::InvalidArguments {
                tool: name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolRequest::SaveClaimData(_) => SAVE_CLAIM_DATA,
            ToolRequest::GetCustomerByPolicy { .. } => GET_CUSTOMER_BY_POLICY,
            ToolRequest::FindPolicyByPhone { .. } => FIND_POLICY_BY_PHONE,
            ToolRequest::FindPolicyByName { .. } => FIND_POLICY_BY_NAME,
            ToolRequest::GetPolicyCoverage { .. } => GET_POLICY_COVERAGE,
            ToolRequest::RecordCoverageDecision(_) => RECORD_COVERAGE_DECISION,
            ToolRequest::GetAvailableProviders { .. } => GET_AVAILABLE_PROVIDERS,
            ToolRequest::ArrangeServices(_) => ARRANGE_SERVICES,
            ToolRequest::CompleteClaim(_) => COMPLETE_CLAIM,
        }
    }
}

/// What a tool hands back to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub tool: String,
    pub success: bool,
    pub body: Value,
}

impl ToolOutput {
    fn ok(tool: &str, body: impl Serialize) -> Result<Self> {
        Ok(Self {
            tool: tool.to_string(),
            success: true,
            body: serde_json::to_value(body)?,
        })
    }

    pub fn failure(tool: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            tool: tool.to_string(),
            success: false,
            body: json!({ "success": false, "error": error }),
        }
    }

    fn failure_with(tool: &str, body: impl Serialize) -> Result<Self> {
        Ok(Self {
            tool: tool.to_string(),
            success: false,
            body: serde_json::to_value(body)?,
        })
    }

    /// Serialized form sent as the tool result message.
    pub fn content(&self) -> String {
        self.body.to_string()
    }
}

#[derive(Debug, Serialize)]
struct Saved<'a> {
    success: bool,
    message: &'static str,
    saved: &'a ClaimFields,
    missing_required: Vec<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    coverage_reset: bool,
}

#[derive(Debug, Serialize)]
struct PolicySummary {
    policy_number: String,
    holder_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_on_file: Option<String>,
    vehicle: String,
    coverage_type: String,
}

impl PolicySummary {
    fn new(policy: &Policy, with_phone: bool) -> Self {
        Self {
            policy_number: policy.policy_number.clone(),
            holder_name: policy.holder_name.clone(),
            phone_on_file: with_phone.then(|| policy.holder_phone.clone()),
            vehicle: policy.vehicle_label(),
            coverage_type: policy.coverage_type.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PolicySearch {
    found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    single_match: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy: Option<PolicySummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    policies: Vec<PolicySummary>,
    message: String,
}

#[derive(Debug, Serialize)]
struct VehicleInfo {
    year: Option<i32>,
    make: Option<String>,
    model: Option<String>,
}

impl From<&Policy> for VehicleInfo {
    fn from(policy: &Policy) -> Self {
        Self {
            year: policy.vehicle_year,
            make: policy.vehicle_make.clone(),
            model: policy.vehicle_model.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CustomerFound {
    found: bool,
    source: &'static str,
    customer: Value,
    policy: Value,
    message: String,
}

#[derive(Debug, Serialize)]
struct PolicyCoverage<'a> {
    found: bool,
    policy_number: &'a str,
    coverage_type: &'a str,
    coverage_details: &'a CoverageFlags,
    policy_holder: &'a str,
    vehicle: VehicleInfo,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct CoverageRecorded<'a> {
    success: bool,
    is_covered: bool,
    services_needed: &'a [ServiceType],
    services_covered: &'a [ServiceType],
    services_not_covered: &'a [ServiceType],
    message: &'a str,
    next_step: &'static str,
}

#[derive(Debug, Serialize)]
struct ProviderSummary<'a> {
    id: &'a str,
    name: &'a str,
    phone: &'a str,
    address: &'a str,
    average_response_time_minutes: Option<i32>,
    rating: Option<f64>,
    services_offered: &'a [String],
}

impl<'a> From<&'a Provider> for ProviderSummary<'a> {
    fn from(p: &'a Provider) -> Self {
        Self {
            id: &p.id,
            name: &p.name,
            phone: &p.phone,
            address: &p.address,
            average_response_time_minutes: p.average_response_time,
            rating: p.rating,
            services_offered: &p.services,
        }
    }
}

#[derive(Debug, Serialize)]
struct ProviderList<'a> {
    found: bool,
    service_type: ServiceType,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    providers: Vec<ProviderSummary<'a>>,
    message: String,
}

#[derive(Debug, Serialize)]
struct ServiceSummary<'a> {
    service_type: &'static str,
    provider_name: &'a str,
    provider_phone: Option<&'a str>,
    provider_address: Option<&'a str>,
    estimated_arrival_minutes: Option<i32>,
    status: &'static str,
}

impl<'a> From<&'a ArrangedService> for ServiceSummary<'a> {
    fn from(s: &'a ArrangedService) -> Self {
        Self {
            service_type: s.service_type.label(),
            provider_name: &s.provider_name,
            provider_phone: s.provider_phone.as_deref(),
            provider_address: s.provider_address.as_deref(),
            estimated_arrival_minutes: s.estimated_arrival_minutes,
            status: s.status.as_str(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Arranged<'a> {
    success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    already_arranged: bool,
    arranged_services: Vec<ServiceSummary<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failed_services: Vec<ServiceType>,
    notifications_created: usize,
    notification_recipients: Vec<String>,
    message: String,
}

#[derive(Debug, Serialize)]
struct ArrangeFailed {
    success: bool,
    error: &'static str,
    failed_services: Vec<ServiceType>,
}

#[derive(Debug, Serialize)]
struct Ack {
    success: bool,
    message: &'static str,
}

/// Turn-local working copy. Tool effects land here and reach the store only
/// when the turn commits.
#[derive(Debug, Clone)]
pub struct TurnState {
    pub claim: Claim,
    pub patch: ClaimPatch,
    pub notifications: Vec<Notification>,
    pub outputs: Vec<ToolOutput>,
}

impl TurnState {
    pub fn new(claim: Claim) -> Self {
        Self {
            claim,
            patch: ClaimPatch::default(),
            notifications: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn apply(&mut self, patch: ClaimPatch) {
        self.claim.apply(&patch);
        self.patch.absorb(patch);
    }
}

#[derive(Clone)]
pub struct ToolExecutor {
    directory: Arc<dyn PolicyDirectory>,
    lifecycle: Arc<Lifecycle>,
}

impl ToolExecutor {
    pub fn new(directory: Arc<dyn PolicyDirectory>, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            directory,
            lifecycle,
        }
    }

    /// Parses and runs one call. Unknown tools and bad arguments fail the call,
    /// not the turn.
    pub async fn execute(
        &self,
        state: &mut TurnState,
        name: &str,
        arguments: Value,
    ) -> Result<ToolOutput> {
        info!(claim_id = %state.claim.id, tool = %name, "Executing tool");
        let output = match ToolRequest::parse(name, arguments) {
            Ok(request) => self.run(state, request).await?,
            Err(e) => {
                warn!(claim_id = %state.claim.id, tool = %name, error = %e, "Rejected tool call");
                ToolOutput::failure(name, e.to_string())
            }
        };
        if !output.success {
            info!(
                claim_id = %state.claim.id,
                tool = %name,
                result = %output.body,
                "Tool reported failure"
            );
        }
        state.outputs.push(output.clone());
        Ok(output)
    }

    pub async fn run(&self, state: &mut TurnState, request: ToolRequest) -> Result<ToolOutput> {
        match request {
            ToolRequest::SaveClaimData(fields) => self.save_claim_data(state, fields),
            ToolRequest::GetCustomerByPolicy { policy_number } => {
                self.get_customer_by_policy(&policy_number).await
            }
            ToolRequest::FindPolicyByPhone { phone_number } => {
                let policies = self.directory.find_policies_by_phone(&phone_number).await?;
                policy_search(FIND_POLICY_BY_PHONE, policies, false, "phone number")
            }
            ToolRequest::FindPolicyByName { holder_name } => {
                let policies = self.directory.find_policies_by_name(&holder_name).await?;
                policy_search(FIND_POLICY_BY_NAME, policies, true, "name")
            }
            ToolRequest::GetPolicyCoverage { policy_number } => {
                self.get_policy_coverage(&policy_number).await
            }
            ToolRequest::RecordCoverageDecision(args) => {
                self.record_coverage_decision(state, args).await
            }
            ToolRequest::GetAvailableProviders { service_type } => {
                self.get_available_providers(service_type).await
            }
            ToolRequest::ArrangeServices(args) => self.arrange_services(state, args).await,
            ToolRequest::CompleteClaim(args) => self.complete_claim(state, args),
        }
    }

    fn save_claim_data(&self, state: &mut TurnState, fields: ClaimFields) -> Result<ToolOutput> {
        let fields = fields.without_empty();
        if fields.is_empty() {
            return Ok(ToolOutput::failure(
                SAVE_CLAIM_DATA,
                "No non-empty fields were provided.",
            ));
        }

        let mut patch = ClaimPatch {
            fields: fields.clone(),
            ..Default::default()
        };
        let policy_changed = matches!(
            (&fields.policy_number, &state.claim.fields.policy_number),
            (Some(new), Some(old)) if new != old
        );
        let mut coverage_reset = false;
        if policy_changed {
            if !state.claim.arranged_services.is_empty() {
                return Ok(ToolOutput::failure(
                    SAVE_CLAIM_DATA,
                    "The policy number cannot change after services have been arranged.",
                ));
            }
            if state.claim.coverage != CoverageStatus::Unknown {
                patch.coverage = Some(CoverageStatus::Unknown);
                patch.coverage_details = Some(None);
                coverage_reset = true;
                info!(
                    claim_id = %state.claim.id,
                    "Policy number corrected, coverage must be re-checked"
                );
            }
        }

        state.apply(patch);
        ToolOutput::ok(
            SAVE_CLAIM_DATA,
            Saved {
                success: true,
                message: "Data saved successfully",
                saved: &fields,
                missing_required: state.claim.fields.missing_required(),
                coverage_reset,
            },
        )
    }

    async fn get_customer_by_policy(&self, policy_number: &str) -> Result<ToolOutput> {
        let Some(policy) = self.directory.find_policy_by_number(policy_number).await? else {
            return Ok(ToolOutput::failure(
                GET_CUSTOMER_BY_POLICY,
                "Policy not found. Please verify the policy number.",
            ));
        };

        let policy_info = json!({
            "policy_number": policy.policy_number,
            "vehicle": policy.vehicle_label(),
            "vehicle_make": policy.vehicle_make,
            "vehicle_model": policy.vehicle_model,
            "vehicle_year": policy.vehicle_year,
        });

        let found = match self.directory.resolve_customer(&policy).await? {
            CustomerLookup::CustomerRecord(customer) => CustomerFound {
                found: true,
                source: "customer_record",
                message: format!(
                    "Found customer: {}. Phone: {}. Email: {}.",
                    customer.full_name, customer.phone, customer.email
                ),
                customer: json!({
                    "full_name": customer.full_name,
                    "phone": customer.phone,
                    "email": customer.email,
                    "address": customer.address,
                    "date_of_birth": customer.date_of_birth,
                    "licence_number": customer.licence_number,
                    "licence_issuer": customer.licence_issuer,
                    "customer_since": customer.customer_since,
                }),
                policy: policy_info,
            },
            CustomerLookup::PolicyHolder(holder) => CustomerFound {
                found: true,
                source: "policy",
                message: format!(
                    "Found policy holder: {}. Phone: {}.",
                    holder.holder_name, holder.holder_phone
                ),
                customer: json!({
                    "full_name": holder.holder_name,
                    "phone": holder.holder_phone,
                    "email": holder.holder_email,
                    "vehicle": holder.vehicle_label(),
                }),
                policy: policy_info,
            },
        };
        ToolOutput::ok(GET_CUSTOMER_BY_POLICY, found)
    }

    async fn get_policy_coverage(&self, policy_number: &str) -> Result<ToolOutput> {
        let Some(policy) = self.directory.find_policy_by_number(policy_number).await? else {
            return Ok(ToolOutput::failure(
                GET_POLICY_COVERAGE,
                "Policy not found in our system. Please verify the policy number.",
            ));
        };
        ToolOutput::ok(
            GET_POLICY_COVERAGE,
            PolicyCoverage {
                found: true,
                policy_number: &policy.policy_number,
                coverage_type: &policy.coverage_type,
                coverage_details: &policy.coverage,
                policy_holder: &policy.holder_name,
                vehicle: VehicleInfo::from(&policy),
                message: "Policy coverage retrieved. Decide which services the incident needs \
                          and record the decision.",
            },
        )
    }

    async fn record_coverage_decision(
        &self,
        state: &mut TurnState,
        args: CoverageDecisionArgs,
    ) -> Result<ToolOutput> {
        let claim_id = state.claim.id;
        if state.claim.stage >= Stage::ArrangingServices {
            return Ok(ToolOutput::failure(
                RECORD_COVERAGE_DECISION,
                "Services are already arranged for this claim; the coverage decision is final.",
            ));
        }
        // A reset decision has to clear the entry guard again.
        let entry = if state.claim.stage == Stage::CoverageCheck
            && state.claim.coverage == CoverageStatus::Unknown
        {
            self.lifecycle
                .recheck(&state.claim, Stage::CoverageCheck, args.user_confirmed)
        } else {
            self.lifecycle
                .check(&state.claim, Stage::CoverageCheck, args.user_confirmed)
        };
        if let Err(e) = entry {
            return Ok(ToolOutput::failure(RECORD_COVERAGE_DECISION, e.to_string()));
        }
        if args.services_needed.is_empty() {
            return Ok(ToolOutput::failure(
                RECORD_COVERAGE_DECISION,
                "services_needed must list at least one service.",
            ));
        }

        let policy_number = state.claim.fields.policy_number.clone().unwrap_or_default();
        let Some(policy) = self.directory.find_policy_by_number(&policy_number).await? else {
            return Ok(ToolOutput::failure(
                RECORD_COVERAGE_DECISION,
                format!(
                    "Policy {policy_number} was not found; confirm the policy number with the driver."
                ),
            ));
        };

        let mut decision = coverage::evaluate(
            &policy.coverage,
            &args.services_needed,
            &args.coverage_explanation,
        );
        if let Some(claimed) = args.is_covered {
            if claimed != decision.is_covered() {
                warn!(
                    claim_id = %claim_id,
                    claimed,
                    computed = decision.is_covered(),
                    "Model coverage call disagrees with policy flags, using computed decision"
                );
                decision.details.explanation = coverage::default_explanation(
                    decision.status,
                    &decision.details.services_covered,
                    &decision.details.services_not_covered,
                );
            }
        }

        info!(
            claim_id = %claim_id,
            policy_number = %policy.policy_number,
            is_covered = decision.is_covered(),
            "Coverage decision recorded"
        );

        state.apply(ClaimPatch {
            stage: Some(Stage::CoverageCheck),
            coverage: Some(decision.status),
            coverage_details: Some(Some(decision.details.clone())),
            ..Default::default()
        });

        ToolOutput::ok(
            RECORD_COVERAGE_DECISION,
            CoverageRecorded {
                success: true,
                is_covered: decision.is_covered(),
                services_needed: &decision.details.services_needed,
                services_covered: &decision.details.services_covered,
                services_not_covered: &decision.details.services_not_covered,
                message: &decision.details.explanation,
                next_step: if decision.is_covered() {
                    "Tell the driver what is covered and ask whether to arrange the services."
                } else {
                    "Explain what is not covered and offer to connect the driver with a human agent."
                },
            },
        )
    }

    async fn get_available_providers(&self, service_type: ServiceType) -> Result<ToolOutput> {
        let providers = self
            .directory
            .list_providers_by_service_type(service_type)
            .await?;
        let message = if providers.is_empty() {
            format!("No providers found for {service_type} service.")
        } else {
            format!("Found {} provider(s) for {service_type} service.", providers.len())
        };
        let body = ProviderList {
            found: !providers.is_empty(),
            service_type,
            providers: providers.iter().map(ProviderSummary::from).collect(),
            message,
        };
        if providers.is_empty() {
            ToolOutput::failure_with(GET_AVAILABLE_PROVIDERS, body)
        } else {
            ToolOutput::ok(GET_AVAILABLE_PROVIDERS, body)
        }
    }

    async fn resolve_provider(&self, request: &ServiceRequest) -> Result<Option<Provider>> {
        if let Some(id) = request.provider_id.as_deref().filter(|id| !id.trim().is_empty()) {
            match self.directory.find_provider(id).await? {
                Some(provider) if provider.offers(request.service_type) => {
                    return Ok(Some(provider));
                }
                _ => warn!(
                    provider_id = %id,
                    service_type = %request.service_type,
                    "Requested provider unavailable, falling back to best ranked"
                ),
            }
        }
        Ok(self
            .directory
            .list_providers_by_service_type(request.service_type)
            .await?
            .into_iter()
            .next())
    }

    async fn arrange_services(
        &self,
        state: &mut TurnState,
        args: ArrangeServicesArgs,
    ) -> Result<ToolOutput> {
        let claim_id = state.claim.id;

        if !state.claim.arranged_services.is_empty() {
            info!(claim_id = %claim_id, "Services already arranged, not dispatching again");
            return ToolOutput::ok(
                ARRANGE_SERVICES,
                Arranged {
                    success: true,
                    already_arranged: true,
                    arranged_services: state
                        .claim
                        .arranged_services
                        .iter()
                        .map(ServiceSummary::from)
                        .collect(),
                    failed_services: Vec::new(),
                    notifications_created: 0,
                    notification_recipients: Vec::new(),
                    message: "Services were already arranged for this claim; nothing new was dispatched."
                        .to_string(),
                },
            );
        }

        if let Err(e) = self
            .lifecycle
            .check(&state.claim, Stage::ArrangingServices, args.user_confirmed)
        {
            return Ok(ToolOutput::failure(ARRANGE_SERVICES, e.to_string()));
        }
        if args.services_to_arrange.is_empty() {
            return Ok(ToolOutput::failure(
                ARRANGE_SERVICES,
                "services_to_arrange must list at least one service.",
            ));
        }

        let mut arranged: Vec<ArrangedService> = Vec::new();
        let mut failed: Vec<ServiceType> = Vec::new();
        for request in &args.services_to_arrange {
            if arranged.iter().any(|s| s.service_type == request.service_type)
                || failed.contains(&request.service_type)
            {
                continue;
            }
            match self.resolve_provider(request).await? {
                Some(provider) => arranged.push(ArrangedService {
                    id: Uuid::new_v4(),
                    claim_id,
                    service_type: request.service_type,
                    provider_id: provider.id,
                    provider_name: provider.name,
                    provider_phone: Some(provider.phone),
                    provider_address: Some(provider.address).filter(|a| !a.is_empty()),
                    provider_rating: provider.rating,
                    estimated_arrival_minutes: provider.average_response_time,
                    status: DispatchStatus::Dispatched,
                    created_at: Utc::now(),
                }),
                None => {
                    warn!(
                        claim_id = %claim_id,
                        service_type = %request.service_type,
                        "No provider found for service type"
                    );
                    failed.push(request.service_type);
                }
            }
        }

        if arranged.is_empty() {
            return ToolOutput::failure_with(
                ARRANGE_SERVICES,
                ArrangeFailed {
                    success: false,
                    error: "Failed to arrange any services. No providers available.",
                    failed_services: failed,
                },
            );
        }

        let primary = arranged
            .iter()
            .find(|s| s.service_type == ServiceType::TowTruck)
            .unwrap_or(&arranged[0])
            .provider_name
            .clone();

        let message = if args.notification_message.trim().is_empty() {
            default_notification(&arranged)
        } else {
            args.notification_message.trim().to_string()
        };
        let mut notifications = Vec::new();
        if let Some(phone) = state.claim.fields.driver_phone.as_deref() {
            notifications.push(Notification::pending(
                claim_id,
                NotificationChannel::Sms,
                phone,
                message.clone(),
            ));
        }
        if let Some(email) = state.claim.fields.driver_email.as_deref() {
            notifications.push(Notification::pending(
                claim_id,
                NotificationChannel::Email,
                email,
                message.clone(),
            ));
        }
        let recipients: Vec<String> = notifications
            .iter()
            .map(|n| format!("{} to {}", n.channel.as_str(), n.recipient))
            .collect();

        info!(
            claim_id = %claim_id,
            arranged = arranged.len(),
            failed = failed.len(),
            notifications = notifications.len(),
            "Services arranged"
        );

        state.apply(ClaimPatch {
            stage: Some(Stage::ArrangingServices),
            // Arranging implies coverage; the guard above already required it.
            coverage: Some(CoverageStatus::Covered),
            append_services: arranged,
            nearest_garage: Some(primary),
            ..Default::default()
        });
        let notifications_created = notifications.len();
        state.notifications.extend(notifications);

        let arranged_count = state.claim.arranged_services.len();
        ToolOutput::ok(
            ARRANGE_SERVICES,
            Arranged {
                success: true,
                already_arranged: false,
                arranged_services: state
                    .claim
                    .arranged_services
                    .iter()
                    .map(ServiceSummary::from)
                    .collect(),
                failed_services: failed,
                notifications_created,
                notification_recipients: recipients,
                message: format!(
                    "Successfully arranged {arranged_count} service(s). \
                     {notifications_created} notification(s) queued for delivery."
                ),
            },
        )
    }

    fn complete_claim(&self, state: &mut TurnState, args: CompleteClaimArgs) -> Result<ToolOutput> {
        if state.claim.stage == Stage::Completed {
            return ToolOutput::ok(
                COMPLETE_CLAIM,
                Ack {
                    success: true,
                    message: "Claim was already completed",
                },
            );
        }
        if let Err(e) = self
            .lifecycle
            .check(&state.claim, Stage::Completed, args.user_confirmed)
        {
            return Ok(ToolOutput::failure(COMPLETE_CLAIM, e.to_string()));
        }
        state.apply(ClaimPatch {
            stage: Some(Stage::Completed),
            ..Default::default()
        });
        info!(claim_id = %state.claim.id, "Claim completed");
        ToolOutput::ok(
            COMPLETE_CLAIM,
            Ack {
                success: true,
                message: "Claim marked as completed",
            },
        )
    }
}

fn policy_search(
    tool: &str,
    policies: Vec<Policy>,
    with_phone: bool,
    searched_by: &str,
) -> Result<ToolOutput> {
    match policies.as_slice() {
        [] => ToolOutput::failure_with(
            tool,
            PolicySearch {
                found: false,
                single_match: None,
                policy: None,
                policies: Vec::new(),
                message: format!(
                    "No policies found with that {searched_by}. Ask the driver to double-check it \
                     or try another way of finding the policy."
                ),
            },
        ),
        [policy] => ToolOutput::ok(
            tool,
            PolicySearch {
                found: true,
                single_match: Some(true),
                message: format!(
                    "Found policy {} for {}. Vehicle: {}.",
                    policy.policy_number,
                    policy.holder_name,
                    policy.vehicle_label()
                ),
                policy: Some(PolicySummary::new(policy, with_phone)),
                policies: Vec::new(),
            },
        ),
        many => ToolOutput::ok(
            tool,
            PolicySearch {
                found: true,
                single_match: Some(false),
                policy: None,
                policies: many.iter().map(|p| PolicySummary::new(p, false)).collect(),
                message: format!(
                    "Found {} policies matching that {searched_by}. Ask the driver which one is \
                     theirs before saving anything.",
                    many.len()
                ),
            },
        ),
    }
}

fn default_notification(arranged: &[ArrangedService]) -> String {
    let lines: Vec<String> = arranged
        .iter()
        .map(|s| {
            let eta = s
                .estimated_arrival_minutes
                .map(|m| format!(", arriving in about {m} minutes"))
                .unwrap_or_default();
            format!("{}: {}{}", s.service_type.label(), s.provider_name, eta)
        })
        .collect();
    format!("Your roadside assistance is on the way. {}", lines.join("; "))
}

/// JSON schemas advertised to the model.
pub fn tool_specs() -> Vec<ToolSpec> {
    let service_enum = json!(["tow_truck", "repair_truck", "taxi", "rental_car"]);
    let confirmed = |what: &str| {
        json!({
            "type": "boolean",
            "description": format!(
                "True only when the driver has explicitly agreed {what} in the conversation."
            )
        })
    };
    vec![
        ToolSpec {
            name: SAVE_CLAIM_DATA.into(),
            description: "Save information collected from the driver to the claim. Call it \
                          whenever new details are given; only include fields you know."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "driver_name": { "type": "string", "description": "Driver's full name" },
                    "driver_phone": { "type": "string", "description": "Driver's phone number" },
                    "driver_email": { "type": "string", "description": "Driver's email address" },
                    "policy_number": { "type": "string", "description": "Insurance policy number" },
                    "location": { "type": "string", "description": "Where the incident happened" },
                    "incident_description": { "type": "string", "description": "What happened" },
                    "vehicle_make": { "type": "string", "description": "Vehicle manufacturer" },
                    "vehicle_model": { "type": "string", "description": "Vehicle model" },
                    "vehicle_year": { "type": "number", "description": "Vehicle year" }
                }
            }),
        },
        ToolSpec {
            name: GET_CUSTOMER_BY_POLICY.into(),
            description: "Look up the customer behind a policy number to auto-fill name, phone, \
                          email and vehicle. Call it as soon as you have a policy number."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "policy_number": { "type": "string", "description": "The insurance policy number" }
                },
                "required": ["policy_number"]
            }),
        },
        ToolSpec {
            name: FIND_POLICY_BY_PHONE.into(),
            description: "Search policies by the holder's phone number when the driver does not \
                          know their policy number."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "phone_number": { "type": "string", "description": "Phone number registered on the policy" }
                },
                "required": ["phone_number"]
            }),
        },
        ToolSpec {
            name: FIND_POLICY_BY_NAME.into(),
            description: "Search policies by the holder's full name when the driver does not know \
                          their policy number. Several matches mean you must ask which one."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "holder_name": { "type": "string", "description": "Full name of the policy holder" }
                },
                "required": ["holder_name"]
            }),
        },
        ToolSpec {
            name: GET_POLICY_COVERAGE.into(),
            description: "Retrieve the coverage flags of a policy (roadside assistance, towing and \
                          its distance limit, transport, rental car)."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "policy_number": { "type": "string", "description": "The policy number to check" }
                },
                "required": ["policy_number"]
            }),
        },
        ToolSpec {
            name: RECORD_COVERAGE_DECISION.into(),
            description: "Record which services the incident needs and whether the policy covers \
                          them. Moves the claim to the coverage check stage."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "is_covered": { "type": "boolean", "description": "Whether the needed services are covered" },
                    "services_needed": {
                        "type": "array",
                        "items": { "type": "string", "enum": service_enum },
                        "description": "Services the incident requires"
                    },
                    "services_covered": { "type": "array", "items": { "type": "string" } },
                    "services_not_covered": { "type": "array", "items": { "type": "string" } },
                    "coverage_explanation": { "type": "string", "description": "Short explanation for the driver" },
                    "user_confirmed": confirmed("that the summarized claim details are correct")
                },
                "required": ["services_needed", "coverage_explanation", "user_confirmed"]
            }),
        },
        ToolSpec {
            name: GET_AVAILABLE_PROVIDERS.into(),
            description: "List providers for a service type, best rated first.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "service_type": { "type": "string", "enum": service_enum }
                },
                "required": ["service_type"]
            }),
        },
        ToolSpec {
            name: ARRANGE_SERVICES.into(),
            description: "Dispatch the needed services and queue SMS/email notifications for the \
                          driver. Only after coverage is confirmed and the driver agreed."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "services_to_arrange": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "service_type": { "type": "string", "enum": service_enum },
                                "provider_id": {
                                    "type": "string",
                                    "description": "Chosen provider id; omit to use the best ranked"
                                }
                            },
                            "required": ["service_type"]
                        }
                    },
                    "notification_message": {
                        "type": "string",
                        "description": "Friendly summary sent to the driver by SMS/email"
                    },
                    "user_confirmed": confirmed("to have these services arranged")
                },
                "required": ["services_to_arrange", "notification_message", "user_confirmed"]
            }),
        },
        ToolSpec {
            name: COMPLETE_CLAIM.into(),
            description: "Mark the claim as completed once services are arranged and the driver \
                          needs nothing else."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "user_confirmed": confirmed("that nothing else is needed")
                },
                "required": ["user_confirmed"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectorySeed, InMemoryDirectory};

    fn policy(number: &str, holder: &str, roadside: bool) -> Policy {
        Policy {
            id: format!("id-{number}"),
            policy_number: number.into(),
            holder_name: holder.into(),
            holder_phone: "555-0101".into(),
            holder_email: Some("jane@example.com".into()),
            coverage_type: "comprehensive".into(),
            coverage: CoverageFlags {
                roadside_assistance: roadside,
                towing_coverage: true,
                max_towing_distance: Some(50),
                ..Default::default()
            },
            vehicle_make: Some("Toyota".into()),
            vehicle_model: Some("Camry".into()),
            vehicle_year: Some(2019),
        }
    }

    fn provider(id: &str, services: &[&str], rating: f64) -> Provider {
        Provider {
            id: id.into(),
            name: format!("Garage {id}"),
            phone: format!("555-{id}"),
            address: "1 Main St".into(),
            services: services.iter().map(|s| s.to_string()).collect(),
            average_response_time: Some(25),
            rating: Some(rating),
        }
    }

    fn executor() -> ToolExecutor {
        let directory = InMemoryDirectory::new(DirectorySeed {
            policies: vec![
                policy("POL-1001", "Jane Driver", true),
                policy("POL-2002", "Nick Nocover", false),
            ],
            customers: vec![],
            providers: vec![
                provider("g1", &["tow"], 4.2),
                provider("g2", &["tow", "repair"], 4.8),
            ],
        });
        ToolExecutor::new(Arc::new(directory), Arc::new(Lifecycle::standard()))
    }

    fn gathered(policy_number: &str) -> TurnState {
        let mut claim = Claim::new(Uuid::new_v4());
        claim.fields = ClaimFields {
            driver_phone: Some("555-0101".into()),
            driver_email: Some("jane@example.com".into()),
            policy_number: Some(policy_number.into()),
            location: Some("I-95 mile 42".into()),
            incident_description: Some("flat tire, can't drive".into()),
            ..Default::default()
        };
        TurnState::new(claim)
    }

    #[test]
    fn parse_rejects_unknown_tools_and_bad_arguments() {
        assert_eq!(
            ToolRequest::parse("get_customer_details", json!({})),
            Err(ToolParseError::UnknownTool("get_customer_details".into()))
        );
        assert!(matches!(
            ToolRequest::parse(GET_AVAILABLE_PROVIDERS, json!({ "service_type": "helicopter" })),
            Err(ToolParseError::InvalidArguments { .. })
        ));
        assert_eq!(
            ToolRequest::parse(COMPLETE_CLAIM, Value::Null),
            Ok(ToolRequest::CompleteClaim(CompleteClaimArgs::default()))
        );
        assert_eq!(
            ToolRequest::parse(
                GET_AVAILABLE_PROVIDERS,
                Value::String(r#"{"service_type":"towing"}"#.into())
            ),
            Ok(ToolRequest::GetAvailableProviders {
                service_type: ServiceType::TowTruck
            })
        );
    }

    #[tokio::test]
    async fn save_claim_data_only_patches_non_empty_fields() {
        let executor = executor();
        let mut state = TurnState::new(Claim::new(Uuid::new_v4()));
        let output = executor
            .execute(
                &mut state,
                SAVE_CLAIM_DATA,
                json!({ "location": "I-95 mile 42", "driver_name": "" }),
            )
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.body["saved"], json!({ "location": "I-95 mile 42" }));
        assert_eq!(
            output.body["missing_required"],
            json!(["policy_number", "incident_description"])
        );
        assert_eq!(state.claim.fields.driver_name, None);

        let empty = executor
            .execute(&mut state, SAVE_CLAIM_DATA, json!({ "driver_name": " " }))
            .await
            .unwrap();
        assert!(!empty.success);
        assert_eq!(state.outputs.len(), 2);
    }

    #[tokio::test]
    async fn ambiguous_name_search_lists_candidates_and_saves_nothing() {
        let executor = executor();
        let mut state = TurnState::new(Claim::new(Uuid::new_v4()));
        let output = executor
            .execute(&mut state, FIND_POLICY_BY_NAME, json!({ "holder_name": "n" }))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.body["single_match"], json!(false));
        assert_eq!(output.body["policies"].as_array().unwrap().len(), 2);
        assert!(state.patch.is_empty());
    }

    #[tokio::test]
    async fn coverage_decision_requires_confirmation() {
        let executor = executor();
        let mut state = gathered("POL-1001");
        let args = json!({
            "services_needed": ["tow_truck"],
            "coverage_explanation": "Towing is covered",
            "user_confirmed": false
        });
        let output = executor
            .execute(&mut state, RECORD_COVERAGE_DECISION, args)
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(state.claim.stage, Stage::DataGathering);
    }

    #[tokio::test]
    async fn computed_coverage_overrides_the_model_claim() {
        let executor = executor();
        let mut state = gathered("POL-2002");
        let output = executor
            .execute(
                &mut state,
                RECORD_COVERAGE_DECISION,
                json!({
                    "is_covered": true,
                    "services_needed": ["towing"],
                    "coverage_explanation": "You're covered!",
                    "user_confirmed": true
                }),
            )
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.body["is_covered"], json!(false));
        assert_eq!(state.claim.stage, Stage::CoverageCheck);
        assert_eq!(state.claim.coverage, CoverageStatus::NotCovered);
        assert_eq!(
            state.claim.coverage_details.as_ref().unwrap().explanation,
            "Your policy does not cover: Tow Truck."
        );

        let refused = executor
            .execute(
                &mut state,
                ARRANGE_SERVICES,
                json!({
                    "services_to_arrange": [{ "service_type": "tow_truck" }],
                    "notification_message": "On the way",
                    "user_confirmed": true
                }),
            )
            .await
            .unwrap();
        assert!(!refused.success);
        assert!(state.notifications.is_empty());
        assert!(state.claim.arranged_services.is_empty());
    }

    async fn covered_state(executor: &ToolExecutor) -> TurnState {
        let mut state = gathered("POL-1001");
        executor
            .execute(
                &mut state,
                RECORD_COVERAGE_DECISION,
                json!({
                    "services_needed": ["tow_truck"],
                    "coverage_explanation": "Towing is covered",
                    "user_confirmed": true
                }),
            )
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn arrange_services_picks_the_best_provider_and_queues_notifications() {
        let executor = executor();
        let mut state = covered_state(&executor).await;
        let output = executor
            .execute(
                &mut state,
                ARRANGE_SERVICES,
                json!({
                    "services_to_arrange": [
                        { "service_type": "tow_truck" },
                        { "service_type": "taxi" }
                    ],
                    "notification_message": "Help is on the way",
                    "user_confirmed": true
                }),
            )
            .await
            .unwrap();

        assert!(output.success);
        assert_eq!(output.body["failed_services"], json!(["taxi"]));
        assert_eq!(output.body["notifications_created"], json!(2));
        assert_eq!(state.claim.stage, Stage::ArrangingServices);
        assert_eq!(state.claim.arranged_services.len(), 1);
        assert_eq!(state.claim.arranged_services[0].provider_id, "g2");
        assert_eq!(state.claim.nearest_garage.as_deref(), Some("Garage g2"));
        let channels: Vec<_> = state.notifications.iter().map(|n| n.channel).collect();
        assert_eq!(channels, vec![NotificationChannel::Sms, NotificationChannel::Email]);

        let again = executor
            .execute(
                &mut state,
                ARRANGE_SERVICES,
                json!({
                    "services_to_arrange": [{ "service_type": "tow_truck" }],
                    "notification_message": "Help is on the way",
                    "user_confirmed": true
                }),
            )
            .await
            .unwrap();
        assert!(again.success);
        assert_eq!(again.body["already_arranged"], json!(true));
        assert_eq!(state.claim.arranged_services.len(), 1);
        assert_eq!(state.notifications.len(), 2);
        assert_eq!(state.patch.append_services.len(), 1);
    }

    #[tokio::test]
    async fn arranging_nothing_leaves_the_claim_alone() {
        let executor = executor();
        let mut state = covered_state(&executor).await;
        let before = state.claim.clone();
        let output = executor
            .execute(
                &mut state,
                ARRANGE_SERVICES,
                json!({
                    "services_to_arrange": [{ "service_type": "rental_car" }],
                    "notification_message": "x",
                    "user_confirmed": true
                }),
            )
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.body["failed_services"], json!(["rental_car"]));
        assert_eq!(state.claim, before);
        assert!(state.notifications.is_empty());
    }

    #[tokio::test]
    async fn policy_correction_resets_an_unarranged_coverage_decision() {
        let executor = executor();
        let mut state = covered_state(&executor).await;
        assert_eq!(state.claim.coverage, CoverageStatus::Covered);

        let output = executor
            .execute(&mut state, SAVE_CLAIM_DATA, json!({ "policy_number": "POL-2002" }))
            .await
            .unwrap();
        assert_eq!(output.body["coverage_reset"], json!(true));
        assert_eq!(state.claim.coverage, CoverageStatus::Unknown);
        assert_eq!(state.claim.stage, Stage::CoverageCheck);
    }

    #[tokio::test]
    async fn reset_coverage_needs_a_fresh_confirmation() {
        let executor = executor();
        let mut state = covered_state(&executor).await;
        executor
            .execute(&mut state, SAVE_CLAIM_DATA, json!({ "policy_number": "POL-2002" }))
            .await
            .unwrap();

        let decision = json!({
            "services_needed": ["tow_truck"],
            "coverage_explanation": "",
            "user_confirmed": false
        });
        let unconfirmed = executor
            .execute(&mut state, RECORD_COVERAGE_DECISION, decision.clone())
            .await
            .unwrap();
        assert!(!unconfirmed.success);
        let error = unconfirmed.body["error"].as_str().unwrap();
        assert!(error.contains("confirmed"));
        assert_eq!(state.claim.coverage, CoverageStatus::Unknown);

        let mut confirmed = decision;
        confirmed["user_confirmed"] = json!(true);
        let output = executor
            .execute(&mut state, RECORD_COVERAGE_DECISION, confirmed)
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(state.claim.coverage, CoverageStatus::NotCovered);
        assert_eq!(state.claim.stage, Stage::CoverageCheck);
    }

    #[tokio::test]
    async fn complete_claim_needs_arranged_services() {
        let executor = executor();
        let mut state = covered_state(&executor).await;
        let early = executor
            .execute(&mut state, COMPLETE_CLAIM, json!({ "user_confirmed": true }))
            .await
            .unwrap();
        assert!(!early.success);
        assert_eq!(state.claim.stage, Stage::CoverageCheck);
    }

    #[tokio::test]
    async fn providers_are_listed_best_first() {
        let executor = executor();
        let mut state = gathered("POL-1001");

        let tows = executor
            .execute(&mut state, GET_AVAILABLE_PROVIDERS, json!({ "service_type": "towing" }))
            .await
            .unwrap();
        assert!(tows.success);
        let ids: Vec<&str> = tows.body["providers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["g2", "g1"]);

        let taxis = executor
            .execute(&mut state, GET_AVAILABLE_PROVIDERS, json!({ "service_type": "taxi" }))
            .await
            .unwrap();
        assert!(!taxis.success);
        assert_eq!(taxis.body["found"], json!(false));
        assert!(state.patch.is_empty());
    }

    #[test]
    fn every_registered_tool_has_a_spec() {
        let names: Vec<String> = tool_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, TOOL_NAMES.map(String::from).to_vec());
    }
}
