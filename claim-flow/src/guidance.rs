//! Per-turn instructions derived from where the claim stands.

use std::fmt::Write;

use crate::claim::{Claim, CoverageStatus};
use crate::lifecycle::Stage;
use crate::prompts::{ENVELOPE_INSTRUCTIONS, SYSTEM_PROMPT};

fn describe_field(field: &str) -> &'static str {
    match field {
        "policy_number" => "the policy number",
        "location" => "where the driver is",
        "incident_description" => "what happened",
        _ => "the remaining details",
    }
}

pub fn stage_guidance(claim: &Claim) -> String {
    match claim.stage {
        Stage::DataGathering => {
            let missing = claim.fields.missing_required();
            match missing.first() {
                Some(next) => {
                    let listed: Vec<&str> = missing.iter().map(|f| describe_field(f)).collect();
                    let mut text = format!(
                        "Stage: data gathering. Still missing: {}. Ask only for {} next.",
                        listed.join(", "),
                        describe_field(next)
                    );
                    if *next == "policy_number" {
                        text.push_str(
                            " If the driver does not know it, offer to find it by phone number or full name.",
                        );
                    }
                    text
                }
                None => "Stage: data gathering. All required details are collected. Summarize them \
                         and ask the driver to confirm. Record the coverage decision only after \
                         they confirm."
                    .to_string(),
            }
        }
        Stage::CoverageCheck => match claim.coverage {
            CoverageStatus::Unknown => "Stage: coverage check. The details are confirmed. Read the \
                                        policy coverage, record the decision and tell the driver \
                                        the result."
                .to_string(),
            CoverageStatus::Covered => format!(
                "Stage: coverage check. Coverage is confirmed ({}). Ask whether to arrange the \
                 services and arrange them only once the driver agrees.",
                explanation(claim)
            ),
            CoverageStatus::NotCovered => format!(
                "Stage: coverage check. The claim is not covered: {}. Explain this kindly and \
                 offer to connect the driver with a human agent. Do not arrange services.",
                explanation(claim)
            ),
        },
        Stage::ArrangingServices => {
            let services: Vec<String> = claim
                .arranged_services
                .iter()
                .map(|s| match s.estimated_arrival_minutes {
                    Some(minutes) => format!(
                        "{} from {} (about {minutes} min)",
                        s.service_type.label(),
                        s.provider_name
                    ),
                    None => format!("{} from {}", s.service_type.label(), s.provider_name),
                })
                .collect();
            format!(
                "Stage: arranging services. Arranged: {}. Make sure the driver knows who is coming, \
                 ask whether they need anything else and complete the claim once they say they \
                 are all set.",
                services.join("; ")
            )
        }
        Stage::Completed => "Stage: completed. Nothing else needs to be arranged. Answer any last \
                             question briefly."
            .to_string(),
    }
}

fn explanation(claim: &Claim) -> &str {
    claim
        .coverage_details
        .as_ref()
        .map(|d| d.explanation.as_str())
        .unwrap_or("no explanation recorded")
}

pub fn claim_state_block(claim: &Claim) -> String {
    let fields = &claim.fields;
    let or_missing =
        |value: &Option<String>| value.clone().unwrap_or_else(|| "not provided".into());
    let coverage = match claim.coverage {
        CoverageStatus::Unknown => "not checked yet",
        CoverageStatus::Covered => "covered",
        CoverageStatus::NotCovered => "not covered",
    };

    let mut block = String::from("CURRENT CLAIM STATE:\n");
    // Writing to a String cannot fail.
    let _ = writeln!(block, "- Status: {}", claim.stage);
    let _ = writeln!(block, "- Driver name: {}", or_missing(&fields.driver_name));
    let _ = writeln!(block, "- Driver phone: {}", or_missing(&fields.driver_phone));
    let _ = writeln!(block, "- Driver email: {}", or_missing(&fields.driver_email));
    let _ = writeln!(block, "- Policy number: {}", or_missing(&fields.policy_number));
    let _ = writeln!(block, "- Location: {}", or_missing(&fields.location));
    let _ = writeln!(block, "- Incident: {}", or_missing(&fields.incident_description));
    let _ = writeln!(
        block,
        "- Vehicle: {}",
        fields.vehicle_label().unwrap_or_else(|| "not provided".into())
    );
    let _ = writeln!(block, "- Coverage: {coverage}");
    if let Some(details) = &claim.coverage_details {
        let _ = writeln!(block, "- Coverage explanation: {}", details.explanation);
    }
    let _ = writeln!(block, "- Services arranged: {}", claim.arranged_services.len());
    block
}

/// Full system text for one model call.
pub fn preamble(claim: &Claim, envelope: bool) -> String {
    let mut text = String::from(SYSTEM_PROMPT.trim());
    text.push_str("\n\n");
    text.push_str(&claim_state_block(claim));
    text.push('\n');
    text.push_str(&stage_guidance(claim));
    if envelope {
        text.push_str("\n\n");
        text.push_str(ENVELOPE_INSTRUCTIONS.trim());
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{ClaimFields, CoverageDetails};
    use uuid::Uuid;

    #[test]
    fn gathering_asks_for_one_thing_at_a_time() {
        let mut claim = Claim::new(Uuid::new_v4());
        claim.fields = ClaimFields {
            location: Some("I-95 mile 42".into()),
            ..Default::default()
        };
        let guidance = stage_guidance(&claim);
        assert!(guidance.contains("Ask only for the policy number next"));
        assert!(guidance.contains("phone number or full name"));
    }

    #[test]
    fn not_covered_guidance_carries_the_explanation() {
        let mut claim = Claim::new(Uuid::new_v4());
        claim.stage = Stage::CoverageCheck;
        claim.coverage = CoverageStatus::NotCovered;
        claim.coverage_details = Some(CoverageDetails {
            explanation: "No roadside assistance on this policy.".into(),
            ..Default::default()
        });
        let guidance = stage_guidance(&claim);
        assert!(guidance.contains("No roadside assistance on this policy."));
        assert!(guidance.contains("Do not arrange services"));
    }

    #[test]
    fn state_block_lists_missing_fields() {
        let mut claim = Claim::new(Uuid::new_v4());
        claim.fields.policy_number = Some("POL-1001".into());
        let block = claim_state_block(&claim);
        assert!(block.contains("- Policy number: POL-1001"));
        assert!(block.contains("- Location: not provided"));
        assert!(block.contains("- Coverage: not checked yet"));

        let with_envelope = preamble(&claim, true);
        assert!(with_envelope.contains("\"decisions\""));
        assert!(!preamble(&claim, false).contains("\"decisions\""));
    }
}
