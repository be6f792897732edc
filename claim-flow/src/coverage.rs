//! Coverage determination. A pure function of the policy flags and the
//! services an incident needs.

use crate::claim::{CoverageDetails, CoverageStatus};
use crate::directory::{CoverageFlags, ServiceType};

pub fn covers(flags: &CoverageFlags, service: ServiceType) -> bool {
    match service {
        ServiceType::RepairTruck => flags.roadside_assistance,
        ServiceType::TowTruck => flags.roadside_assistance && flags.towing_coverage,
        ServiceType::Taxi => flags.roadside_assistance && flags.transport_coverage,
        ServiceType::RentalCar => flags.rental_car_coverage,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageDecision {
    pub status: CoverageStatus,
    pub details: CoverageDetails,
}

impl CoverageDecision {
    pub fn is_covered(&self) -> bool {
        self.status == CoverageStatus::Covered
    }
}

/// Covered iff at least one service is needed and every needed service is
/// covered. Duplicates in `needed` are collapsed, order is kept.
pub fn evaluate(
    flags: &CoverageFlags,
    needed: &[ServiceType],
    explanation: &str,
) -> CoverageDecision {
    let mut services_needed: Vec<ServiceType> = Vec::new();
    for service in needed {
        if !services_needed.contains(service) {
            services_needed.push(*service);
        }
    }

    let (services_covered, services_not_covered): (Vec<_>, Vec<_>) = services_needed
        .iter()
        .copied()
        .partition(|s| covers(flags, *s));

    let status = if !services_needed.is_empty() && services_not_covered.is_empty() {
        CoverageStatus::Covered
    } else {
        CoverageStatus::NotCovered
    };

    let explanation = if explanation.trim().is_empty() {
        default_explanation(status, &services_covered, &services_not_covered)
    } else {
        explanation.trim().to_string()
    };

    CoverageDecision {
        status,
        details: CoverageDetails {
            services_needed,
            services_covered,
            services_not_covered,
            explanation,
        },
    }
}

pub fn default_explanation(
    status: CoverageStatus,
    covered: &[ServiceType],
    not_covered: &[ServiceType],
) -> String {
    let labels = |services: &[ServiceType]| {
        services
            .iter()
            .map(|s| s.label())
            .collect::<Vec<_>>()
            .join(", ")
    };
    match status {
        CoverageStatus::Covered => format!("Your policy covers: {}.", labels(covered)),
        _ if not_covered.is_empty() => {
            "No covered service was identified for this incident.".to_string()
        }
        _ => format!("Your policy does not cover: {}.", labels(not_covered)),
    }
}
