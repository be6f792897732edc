//! Read-only lookups of insurance policies, customers and service providers.
//!
//! Lookup misses are `Ok(None)` / `Ok(vec![])`, never errors: callers branch on
//! them and report "not found" to the conversation. `Err` means the directory
//! itself could not be reached.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ClaimError, Result};

/// Kinds of roadside service that can be arranged for a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    TowTruck,
    RepairTruck,
    Taxi,
    RentalCar,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::TowTruck => "tow_truck",
            ServiceType::RepairTruck => "repair_truck",
            ServiceType::Taxi => "taxi",
            ServiceType::RentalCar => "rental_car",
        }
    }

    /// Tag used in a provider's `services` list.
    pub fn provider_tag(&self) -> &'static str {
        match self {
            ServiceType::TowTruck => "tow",
            ServiceType::RepairTruck => "repair",
            ServiceType::Taxi => "taxi",
            ServiceType::RentalCar => "rental_car",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceType::TowTruck => "Tow Truck",
            ServiceType::RepairTruck => "Mobile Repair",
            ServiceType::Taxi => "Transportation (Taxi)",
            ServiceType::RentalCar => "Rental Car",
        }
    }

    /// Accepts the canonical names plus the looser vocabulary models tend to use
    /// ("towing", "roadside_assistance", "rental", ...).
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "tow_truck" | "tow" | "towing" => Some(ServiceType::TowTruck),
            "repair_truck" | "repair" | "roadside_assistance" | "roadside" | "mobile_repair" => {
                Some(ServiceType::RepairTruck)
            }
            "taxi" | "transport" | "transportation" => Some(ServiceType::Taxi),
            "rental_car" | "rental" | "car_rental" => Some(ServiceType::RentalCar),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageFlags {
    #[serde(default)]
    pub roadside_assistance: bool,
    #[serde(default)]
    pub towing_coverage: bool,
    #[serde(default)]
    pub max_towing_distance: Option<i32>,
    #[serde(default)]
    pub transport_coverage: bool,
    #[serde(default)]
    pub rental_car_coverage: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub policy_number: String,
    pub holder_name: String,
    pub holder_phone: String,
    #[serde(default)]
    pub holder_email: Option<String>,
    #[serde(default)]
    pub coverage_type: String,
    #[serde(default)]
    pub coverage: CoverageFlags,
    #[serde(default)]
    pub vehicle_make: Option<String>,
    #[serde(default)]
    pub vehicle_model: Option<String>,
    #[serde(default)]
    pub vehicle_year: Option<i32>,
}

impl Policy {
    /// "2019 Toyota Camry", skipping unknown parts.
    pub fn vehicle_label(&self) -> String {
        let year = self.vehicle_year.map(|y| y.to_string());
        [
            year.as_deref(),
            self.vehicle_make.as_deref(),
            self.vehicle_model.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub full_name: String,
    pub phone: String,
    pub email: String,
    #[serde(default)]
    pub address: serde_json::Value,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub licence_number: Option<String>,
    #[serde(default)]
    pub licence_issuer: Option<String>,
    #[serde(default)]
    pub customer_since: Option<String>,
    #[serde(default)]
    pub policy_ids: Vec<String>,
}

/// Who to auto-fill the claim from once a policy is known.
#[derive(Debug, Clone, PartialEq)]
pub enum CustomerLookup {
    CustomerRecord(Customer),
    /// No customer row references the policy; the holder fields stand in.
    PolicyHolder(Policy),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub services: Vec<String>,
    /// Minutes.
    #[serde(default)]
    pub average_response_time: Option<i32>,
    #[serde(default)]
    pub rating: Option<f64>,
}

impl Provider {
    pub fn offers(&self, service: ServiceType) -> bool {
        self.services.iter().any(|s| s == service.provider_tag())
    }
}

/// Best provider first: highest rating, then lowest average response time.
/// Missing ratings rank last, missing response times rank after known ones.
pub fn rank_providers(providers: &mut [Provider]) {
    providers.sort_by(|a, b| {
        let rating = b
            .rating
            .unwrap_or(f64::MIN)
            .partial_cmp(&a.rating.unwrap_or(f64::MIN))
            .unwrap_or(Ordering::Equal);
        rating.then_with(|| {
            a.average_response_time
                .unwrap_or(i32::MAX)
                .cmp(&b.average_response_time.unwrap_or(i32::MAX))
        })
    });
}

#[async_trait]
pub trait PolicyDirectory: Send + Sync {
    async fn find_policy_by_number(&self, policy_number: &str) -> Result<Option<Policy>>;

    /// Exact match on the holder phone.
    async fn find_policies_by_phone(&self, phone: &str) -> Result<Vec<Policy>>;

    /// Case-insensitive substring match on the holder name.
    async fn find_policies_by_name(&self, name: &str) -> Result<Vec<Policy>>;

    async fn find_customer_by_policy(&self, policy_id: &str) -> Result<Option<Customer>>;

    /// Providers offering `service`, ranked with [`rank_providers`].
    async fn list_providers_by_service_type(&self, service: ServiceType) -> Result<Vec<Provider>>;

    async fn find_provider(&self, provider_id: &str) -> Result<Option<Provider>>;

    async fn resolve_customer(&self, policy: &Policy) -> Result<CustomerLookup> {
        Ok(match self.find_customer_by_policy(&policy.id).await? {
            Some(customer) => CustomerLookup::CustomerRecord(customer),
            None => CustomerLookup::PolicyHolder(policy.clone()),
        })
    }
}

/// Seed document for [`InMemoryDirectory`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub customers: Vec<Customer>,
    #[serde(default)]
    pub providers: Vec<Provider>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    seed: Arc<DirectorySeed>,
}

impl InMemoryDirectory {
    pub fn new(seed: DirectorySeed) -> Self {
        Self {
            seed: Arc::new(seed),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let seed: DirectorySeed = serde_yaml::from_str(yaml)
            .map_err(|e| ClaimError::Config(format!("invalid directory seed: {e}")))?;
        Ok(Self::new(seed))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClaimError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }
}

#[async_trait]
impl PolicyDirectory for InMemoryDirectory {
    async fn find_policy_by_number(&self, policy_number: &str) -> Result<Option<Policy>> {
        let wanted = policy_number.trim();
        Ok(self
            .seed
            .policies
            .iter()
            .find(|p| p.policy_number == wanted)
            .cloned())
    }

    async fn find_policies_by_phone(&self, phone: &str) -> Result<Vec<Policy>> {
        let wanted = phone.trim();
        Ok(self
            .seed
            .policies
            .iter()
            .filter(|p| p.holder_phone == wanted)
            .cloned()
            .collect())
    }

    async fn find_policies_by_name(&self, name: &str) -> Result<Vec<Policy>> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .seed
            .policies
            .iter()
            .filter(|p| p.holder_name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn find_customer_by_policy(&self, policy_id: &str) -> Result<Option<Customer>> {
        Ok(self
            .seed
            .customers
            .iter()
            .find(|c| c.policy_ids.iter().any(|id| id == policy_id))
            .cloned())
    }

    async fn list_providers_by_service_type(&self, service: ServiceType) -> Result<Vec<Provider>> {
        let mut providers: Vec<Provider> = self
            .seed
            .providers
            .iter()
            .filter(|p| p.offers(service))
            .cloned()
            .collect();
        rank_providers(&mut providers);
        Ok(providers)
    }

    async fn find_provider(&self, provider_id: &str) -> Result<Option<Provider>> {
        Ok(self
            .seed
            .providers
            .iter()
            .find(|p| p.id == provider_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"
policies:
  - id: p1
    policy_number: POL-1001
    holder_name: Jane Driver
    holder_phone: "555-0101"
    holder_email: jane@example.com
    coverage_type: comprehensive
    coverage:
      roadside_assistance: true
      towing_coverage: true
      max_towing_distance: 50
    vehicle_make: Toyota
    vehicle_model: Camry
    vehicle_year: 2019
  - id: p2
    policy_number: POL-1002
    holder_name: Janet Driverson
    holder_phone: "555-0101"
customers: []
providers:
  - { id: g1, name: Quick Tow, phone: "555-1000", services: [tow], average_response_time: 30, rating: 4.5 }
  - { id: g2, name: Fast Tow, phone: "555-2000", services: [tow, repair], average_response_time: 20, rating: 4.5 }
  - { id: g3, name: Slow Tow, phone: "555-3000", services: [tow], average_response_time: 10, rating: 3.9 }
"#;

    #[tokio::test]
    async fn providers_are_ranked_by_rating_then_response_time() {
        let directory = InMemoryDirectory::from_yaml_str(SEED).unwrap();
        let tows = directory
            .list_providers_by_service_type(ServiceType::TowTruck)
            .await
            .unwrap();
        let names: Vec<_> = tows.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Fast Tow", "Quick Tow", "Slow Tow"]);

        let taxis = directory
            .list_providers_by_service_type(ServiceType::Taxi)
            .await
            .unwrap();
        assert!(taxis.is_empty());
    }

    #[tokio::test]
    async fn name_search_is_case_insensitive_substring() {
        let directory = InMemoryDirectory::from_yaml_str(SEED).unwrap();
        assert_eq!(directory.find_policies_by_name("jane").await.unwrap().len(), 2);
        assert_eq!(directory.find_policies_by_name("DRIVERSON").await.unwrap().len(), 1);
        assert!(directory.find_policies_by_name("  ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn customer_lookup_falls_back_to_policy_holder() {
        let directory = InMemoryDirectory::from_yaml_str(SEED).unwrap();
        let policy = directory
            .find_policy_by_number("POL-1001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(policy.vehicle_label(), "2019 Toyota Camry");
        match directory.resolve_customer(&policy).await.unwrap() {
            CustomerLookup::PolicyHolder(p) => assert_eq!(p.holder_name, "Jane Driver"),
            other => panic!("unexpected lookup {other:?}"),
        }
        assert!(directory.find_policy_by_number("POL-9").await.unwrap().is_none());
    }

    #[test]
    fn lenient_service_names() {
        assert_eq!(ServiceType::parse_lenient("Towing"), Some(ServiceType::TowTruck));
        assert_eq!(
            ServiceType::parse_lenient("roadside assistance"),
            Some(ServiceType::RepairTruck)
        );
        assert_eq!(ServiceType::parse_lenient("rental-car"), Some(ServiceType::RentalCar));
        assert_eq!(ServiceType::parse_lenient("helicopter"), None);
    }
}
