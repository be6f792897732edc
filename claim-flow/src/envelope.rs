//! Whole-message JSON replies, for models driven without native tool calling.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::claim::ClaimFields;
use crate::tools::CONFIRMING_TOOLS;

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^```[a-zA-Z]*\s*(.*?)\s*```$").expect("valid fence pattern")
});

static OUTERMOST_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid object pattern"));

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Decision {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

impl Decision {
    /// Arguments with the envelope-level confirmation filled in for tools that
    /// take one and did not set it themselves.
    pub fn arguments_with_confirmation(&self, user_confirmed: bool) -> Value {
        let mut arguments = match &self.arguments {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        if CONFIRMING_TOOLS.contains(&self.tool.as_str()) {
            if let Value::Object(map) = &mut arguments {
                map.entry("user_confirmed")
                    .or_insert(Value::Bool(user_confirmed));
            }
        }
        arguments
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub extracted_data: ClaimFields,
    #[serde(default)]
    pub user_confirmed: bool,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub next_stage: Option<String>,
}

impl Envelope {
    /// Strict-ish parse: fences and surrounding prose are tolerated, anything
    /// without a readable object is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let unfenced = FENCED
            .captures(trimmed)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or(trimmed);

        if let Ok(envelope) = serde_json::from_str::<Envelope>(unfenced) {
            return Some(envelope);
        }
        OUTERMOST_OBJECT
            .find(unfenced)
            .and_then(|m| serde_json::from_str::<Envelope>(m.as_str()).ok())
    }

    /// Never fails: unreadable output becomes the message itself.
    pub fn parse_or_message(raw: &str) -> (Self, bool) {
        match Self::parse(raw) {
            Some(envelope) => (envelope, true),
            None => {
                warn!(
                    raw_len = raw.len(),
                    "Model reply is not a JSON envelope, using raw text as the message"
                );
                (
                    Envelope {
                        message: raw.trim().to_string(),
                        ..Default::default()
                    },
                    false,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_envelope_is_read() {
        let raw = "```json\n{\"message\": \"Is that right?\", \"extracted_data\": {\"location\": \"I-95\"}}\n```";
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.message, "Is that right?");
        assert_eq!(envelope.extracted_data.location.as_deref(), Some("I-95"));
        assert!(!envelope.user_confirmed);
    }

    #[test]
    fn prose_around_the_object_is_ignored() {
        let raw = "Sure! Here you go: {\"message\": \"Done\", \"user_confirmed\": true, \"next_stage\": \"coverage_check\"} Hope that helps.";
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.message, "Done");
        assert!(envelope.user_confirmed);
        assert_eq!(envelope.next_stage.as_deref(), Some("coverage_check"));
    }

    #[test]
    fn unreadable_output_falls_back_to_the_raw_text() {
        let (envelope, well_formed) =
            Envelope::parse_or_message("  I could not format that {oops ");
        assert!(!well_formed);
        assert_eq!(envelope.message, "I could not format that {oops");
        assert!(envelope.decisions.is_empty());
        assert!(envelope.extracted_data.is_empty());
    }

    #[test]
    fn confirmation_is_injected_only_where_accepted() {
        let arrange = Decision {
            tool: "arrange_services".into(),
            arguments: json!({ "services_to_arrange": [] }),
        };
        assert_eq!(
            arrange.arguments_with_confirmation(true)["user_confirmed"],
            json!(true)
        );

        let explicit = Decision {
            tool: "complete_claim".into(),
            arguments: json!({ "user_confirmed": false }),
        };
        assert_eq!(
            explicit.arguments_with_confirmation(true)["user_confirmed"],
            json!(false)
        );

        let lookup = Decision {
            tool: "get_policy_coverage".into(),
            arguments: json!({ "policy_number": "POL-1001" }),
        };
        assert!(lookup.arguments_with_confirmation(true).get("user_confirmed").is_none());
    }
}
