//! The claim stage graph.
//!
//! Stages only move forward. Each edge carries a guard evaluated against the
//! claim as it stands before the side effect that moves it along.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claim::{Claim, CoverageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DataGathering,
    CoverageCheck,
    ArrangingServices,
    Completed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DataGathering => "data_gathering",
            Stage::CoverageCheck => "coverage_check",
            Stage::ArrangingServices => "arranging_services",
            Stage::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "data_gathering" => Some(Stage::DataGathering),
            "coverage_check" => Some(Stage::CoverageCheck),
            "arranging_services" => Some(Stage::ArrangingServices),
            "completed" => Some(Stage::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("the claim cannot move back from {from} to {to}")]
    Regression { from: Stage, to: Stage },

    #[error("there is no transition from {from} to {to}")]
    NoTransition { from: Stage, to: Stage },

    #[error("required information is still missing: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("the driver has not confirmed yet; ask them before continuing")]
    NotConfirmed,

    #[error("no coverage decision has been recorded for this claim")]
    CoverageUnknown,

    #[error("the policy does not cover the services this incident needs")]
    NotCovered,

    #[error("no services have been arranged for this claim")]
    NothingArranged,
}

/// What a guard can see.
#[derive(Debug, Clone, Copy)]
pub struct GuardInput<'a> {
    pub claim: &'a Claim,
    /// The model's determination that the driver agreed to move on.
    pub user_confirmed: bool,
}

pub type Guard =
    Arc<dyn Fn(&GuardInput<'_>) -> std::result::Result<(), TransitionError> + Send + Sync>;

#[derive(Clone)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
    guard: Guard,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    transitions: Vec<Transition>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transition<F>(mut self, from: Stage, to: Stage, guard: F) -> Self
    where
        F: Fn(&GuardInput<'_>) -> std::result::Result<(), TransitionError> + Send + Sync + 'static,
    {
        self.transitions.push(Transition {
            from,
            to,
            guard: Arc::new(guard),
        });
        self
    }

    /// `data_gathering → coverage_check → arranging_services → completed`.
    pub fn standard() -> Self {
        Self::new()
            .add_transition(Stage::DataGathering, Stage::CoverageCheck, |input| {
                let missing = input.claim.fields.missing_required();
                if !missing.is_empty() {
                    return Err(TransitionError::MissingFields(missing));
                }
                confirmed(input)
            })
            .add_transition(Stage::CoverageCheck, Stage::ArrangingServices, |input| {
                match input.claim.coverage {
                    CoverageStatus::Unknown => return Err(TransitionError::CoverageUnknown),
                    CoverageStatus::NotCovered => return Err(TransitionError::NotCovered),
                    CoverageStatus::Covered => {}
                }
                confirmed(input)
            })
            .add_transition(Stage::ArrangingServices, Stage::Completed, |input| {
                if input.claim.arranged_services.is_empty() {
                    return Err(TransitionError::NothingArranged);
                }
                confirmed(input)
            })
    }

    /// Checks that the claim may move to `to`. Staying put always passes.
    pub fn check(
        &self,
        claim: &Claim,
        to: Stage,
        user_confirmed: bool,
    ) -> std::result::Result<(), TransitionError> {
        let from = claim.stage;
        if to == from {
            return Ok(());
        }
        if to < from {
            return Err(TransitionError::Regression { from, to });
        }
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .ok_or(TransitionError::NoTransition { from, to })?;
        (transition.guard)(&GuardInput {
            claim,
            user_confirmed,
        })
    }

    /// Runs the guard of the edge that enters `stage` again, for a claim that
    /// already sits there but whose entry conditions were reset.
    pub fn recheck(
        &self,
        claim: &Claim,
        stage: Stage,
        user_confirmed: bool,
    ) -> std::result::Result<(), TransitionError> {
        match self.transitions.iter().find(|t| t.to == stage) {
            Some(transition) => (transition.guard)(&GuardInput {
                claim,
                user_confirmed,
            }),
            None => Ok(()),
        }
    }

    pub fn next_stage(&self, from: Stage) -> Option<Stage> {
        self.transitions
            .iter()
            .find(|t| t.from == from)
            .map(|t| t.to)
    }
}

fn confirmed(input: &GuardInput<'_>) -> std::result::Result<(), TransitionError> {
    if input.user_confirmed {
        Ok(())
    } else {
        Err(TransitionError::NotConfirmed)
    }
}
