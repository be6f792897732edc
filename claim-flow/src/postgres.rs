//! PostgreSQL implementations of [`ClaimStore`] and [`PolicyDirectory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::claim::{
    ArrangedService, Claim, ClaimFields, ClaimPatch, CoverageDetails, CoverageStatus,
    DeliveryStatus, DispatchStatus, Notification, NotificationChannel, TranscriptEntry,
};
use crate::directory::{
    CoverageFlags, Customer, Policy, PolicyDirectory, Provider, ServiceType, rank_providers,
};
use crate::error::{ClaimError, Result};
use crate::lifecycle::Stage;
use crate::storage::{ClaimStore, TurnCommit};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS claims (
        id UUID PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        version BIGINT NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'data_gathering',
        driver_name TEXT,
        driver_phone TEXT,
        driver_email TEXT,
        policy_number TEXT,
        location TEXT,
        incident_description TEXT,
        vehicle_make TEXT,
        vehicle_model TEXT,
        vehicle_year INT,
        is_covered BOOLEAN,
        coverage_details JSONB,
        arranged_services JSONB NOT NULL DEFAULT '[]',
        nearest_garage TEXT,
        conversation_history JSONB NOT NULL DEFAULT '[]'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS services (
        id UUID PRIMARY KEY,
        claim_id UUID NOT NULL REFERENCES claims(id),
        service_type TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        provider_name TEXT NOT NULL,
        provider_phone TEXT,
        provider_address TEXT,
        provider_rating DOUBLE PRECISION,
        estimated_arrival INT,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        claim_id UUID NOT NULL REFERENCES claims(id),
        type TEXT NOT NULL,
        recipient TEXT NOT NULL,
        message TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        sent_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS services_claim_id_idx ON services (claim_id)",
    "CREATE INDEX IF NOT EXISTS notifications_claim_id_idx ON notifications (claim_id)",
];

const CLAIM_COLUMNS: &str = "id, created_at, updated_at, version, status, driver_name, \
    driver_phone, driver_email, policy_number, location, incident_description, vehicle_make, \
    vehicle_model, vehicle_year, is_covered, coverage_details, arranged_services, nearest_garage, \
    conversation_history";

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

fn coverage_to_column(coverage: CoverageStatus) -> Option<bool> {
    match coverage {
        CoverageStatus::Unknown => None,
        CoverageStatus::Covered => Some(true),
        CoverageStatus::NotCovered => Some(false),
    }
}

fn claim_from_row(row: &PgRow) -> Result<Claim> {
    let status: String = row.try_get("status")?;
    let stage = Stage::parse(&status)
        .ok_or_else(|| ClaimError::Storage(format!("unknown claim status `{status}`")))?;
    let coverage = match row.try_get::<Option<bool>, _>("is_covered")? {
        None => CoverageStatus::Unknown,
        Some(true) => CoverageStatus::Covered,
        Some(false) => CoverageStatus::NotCovered,
    };
    let coverage_details: Option<Json<CoverageDetails>> = row.try_get("coverage_details")?;
    let Json(arranged_services): Json<Vec<ArrangedService>> = row.try_get("arranged_services")?;
    let Json(transcript): Json<Vec<TranscriptEntry>> = row.try_get("conversation_history")?;

    Ok(Claim {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
        stage,
        fields: ClaimFields {
            driver_name: row.try_get("driver_name")?,
            driver_phone: row.try_get("driver_phone")?,
            driver_email: row.try_get("driver_email")?,
            policy_number: row.try_get("policy_number")?,
            location: row.try_get("location")?,
            incident_description: row.try_get("incident_description")?,
            vehicle_make: row.try_get("vehicle_make")?,
            vehicle_model: row.try_get("vehicle_model")?,
            vehicle_year: row.try_get("vehicle_year")?,
        },
        coverage,
        coverage_details: coverage_details.map(|Json(d)| d),
        arranged_services,
        nearest_garage: row.try_get("nearest_garage")?,
        transcript,
    })
}

fn service_from_row(row: &PgRow) -> Result<ArrangedService> {
    let service_type: String = row.try_get("service_type")?;
    let status: String = row.try_get("status")?;
    Ok(ArrangedService {
        id: row.try_get("id")?,
        claim_id: row.try_get("claim_id")?,
        service_type: ServiceType::parse_lenient(&service_type)
            .ok_or_else(|| ClaimError::Storage(format!("unknown service type `{service_type}`")))?,
        provider_id: row.try_get("provider_id")?,
        provider_name: row.try_get("provider_name")?,
        provider_phone: row.try_get("provider_phone")?,
        provider_address: row.try_get("provider_address")?,
        provider_rating: row.try_get("provider_rating")?,
        estimated_arrival_minutes: row.try_get("estimated_arrival")?,
        status: DispatchStatus::parse(&status)
            .ok_or_else(|| ClaimError::Storage(format!("unknown service status `{status}`")))?,
        created_at: row.try_get("created_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification> {
    let channel: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    Ok(Notification {
        id: row.try_get("id")?,
        claim_id: row.try_get("claim_id")?,
        channel: match channel.as_str() {
            "sms" => NotificationChannel::Sms,
            "email" => NotificationChannel::Email,
            other => {
                return Err(ClaimError::Storage(format!(
                    "unknown notification type `{other}`"
                )));
            }
        },
        recipient: row.try_get("recipient")?,
        message: row.try_get("message")?,
        status: match status.as_str() {
            "pending" => DeliveryStatus::Pending,
            "sent" => DeliveryStatus::Sent,
            "failed" => DeliveryStatus::Failed,
            other => {
                return Err(ClaimError::Storage(format!(
                    "unknown notification status `{other}`"
                )));
            }
        },
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get::<Option<DateTime<Utc>>, _>("sent_at")?,
    })
}

#[derive(Clone)]
pub struct PostgresClaimStore {
    pool: PgPool,
}

impl PostgresClaimStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Claim tables ready");
        Ok(())
    }

    async fn lock_claim(conn: &mut PgConnection, id: Uuid) -> Result<Claim> {
        let row = sqlx::query(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(ClaimError::ClaimNotFound(id))?;
        claim_from_row(&row)
    }

    async fn write_claim(conn: &mut PgConnection, claim: &Claim) -> Result<()> {
        let f = &claim.fields;
        sqlx::query(
            r#"
            UPDATE claims SET
                updated_at = $2,
                version = $3,
                status = $4,
                driver_name = $5,
                driver_phone = $6,
                driver_email = $7,
                policy_number = $8,
                location = $9,
                incident_description = $10,
                vehicle_make = $11,
                vehicle_model = $12,
                vehicle_year = $13,
                is_covered = $14,
                coverage_details = $15,
                arranged_services = $16,
                nearest_garage = $17,
                conversation_history = $18
            WHERE id = $1
            "#,
        )
        .bind(claim.id)
        .bind(claim.updated_at)
        .bind(claim.version)
        .bind(claim.stage.as_str())
        .bind(&f.driver_name)
        .bind(&f.driver_phone)
        .bind(&f.driver_email)
        .bind(&f.policy_number)
        .bind(&f.location)
        .bind(&f.incident_description)
        .bind(&f.vehicle_make)
        .bind(&f.vehicle_model)
        .bind(f.vehicle_year)
        .bind(coverage_to_column(claim.coverage))
        .bind(claim.coverage_details.as_ref().map(Json))
        .bind(Json(&claim.arranged_services))
        .bind(&claim.nearest_garage)
        .bind(Json(&claim.transcript))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn insert_services(conn: &mut PgConnection, services: &[ArrangedService]) -> Result<()> {
        for service in services {
            sqlx::query(
                r#"
                INSERT INTO services (id, claim_id, service_type, provider_id, provider_name,
                    provider_phone, provider_address, provider_rating, estimated_arrival, status,
                    created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(service.id)
            .bind(service.claim_id)
            .bind(service.service_type.as_str())
            .bind(&service.provider_id)
            .bind(&service.provider_name)
            .bind(&service.provider_phone)
            .bind(&service.provider_address)
            .bind(service.provider_rating)
            .bind(service.estimated_arrival_minutes)
            .bind(service.status.as_str())
            .bind(service.created_at)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn insert_notifications(
        conn: &mut PgConnection,
        notifications: &[Notification],
    ) -> Result<()> {
        for notification in notifications {
            sqlx::query(
                r#"
                INSERT INTO notifications (id, claim_id, type, recipient, message, status,
                    error_message, created_at, sent_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(notification.id)
            .bind(notification.claim_id)
            .bind(notification.channel.as_str())
            .bind(&notification.recipient)
            .bind(&notification.message)
            .bind(notification.status.as_str())
            .bind(&notification.error_message)
            .bind(notification.created_at)
            .bind(notification.sent_at)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

fn touch(claim: &mut Claim) {
    claim.version += 1;
    claim.updated_at = Utc::now();
}

#[async_trait]
impl ClaimStore for PostgresClaimStore {
    async fn create(&self, claim: Claim) -> Result<Claim> {
        sqlx::query(
            r#"
            INSERT INTO claims (id, created_at, updated_at, version, status, conversation_history)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(claim.id)
        .bind(claim.created_at)
        .bind(claim.updated_at)
        .bind(claim.version)
        .bind(claim.stage.as_str())
        .bind(Json(&claim.transcript))
        .execute(&self.pool)
        .await?;
        if claim.fields != ClaimFields::default() || claim.coverage != CoverageStatus::Unknown {
            let mut conn = self.pool.acquire().await?;
            Self::write_claim(&mut conn, &claim).await?;
        }
        Ok(claim)
    }

    async fn load(&self, id: Uuid) -> Result<Option<Claim>> {
        let row = sqlx::query(&format!("SELECT {CLAIM_COLUMNS} FROM claims WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(claim_from_row).transpose()
    }

    async fn list_claims(&self) -> Result<Vec<Claim>> {
        let rows = sqlx::query(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims ORDER BY created_at DESC, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(claim_from_row).collect()
    }

    async fn update(&self, id: Uuid, patch: &ClaimPatch) -> Result<Claim> {
        let mut tx = self.pool.begin().await?;
        let mut claim = Self::lock_claim(&mut tx, id).await?;
        claim.apply(patch);
        touch(&mut claim);
        Self::write_claim(&mut tx, &claim).await?;
        Self::insert_services(&mut tx, &patch.append_services).await?;
        tx.commit().await?;
        Ok(claim)
    }

    async fn append_transcript(&self, id: Uuid, entries: &[TranscriptEntry]) -> Result<Claim> {
        let mut tx = self.pool.begin().await?;
        let mut claim = Self::lock_claim(&mut tx, id).await?;
        claim.transcript.extend_from_slice(entries);
        touch(&mut claim);
        Self::write_claim(&mut tx, &claim).await?;
        tx.commit().await?;
        Ok(claim)
    }

    async fn commit_turn(&self, commit: &TurnCommit) -> Result<Claim> {
        let mut tx = self.pool.begin().await?;
        let mut claim = Self::lock_claim(&mut tx, commit.claim_id).await?;
        if claim.version != commit.expected_version {
            // Dropping the transaction rolls it back.
            return Err(ClaimError::VersionConflict {
                claim_id: commit.claim_id,
                expected: commit.expected_version,
                found: claim.version,
            });
        }

        claim.apply(&commit.patch);
        claim.transcript.extend_from_slice(&commit.transcript);
        touch(&mut claim);

        Self::write_claim(&mut tx, &claim).await?;
        Self::insert_services(&mut tx, &commit.patch.append_services).await?;
        Self::insert_notifications(&mut tx, &commit.notifications).await?;
        tx.commit().await?;
        Ok(claim)
    }

    async fn list_services(&self, claim_id: Uuid) -> Result<Vec<ArrangedService>> {
        let rows = sqlx::query("SELECT * FROM services WHERE claim_id = $1 ORDER BY created_at")
            .bind(claim_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(service_from_row).collect()
    }

    async fn list_notifications(&self, claim_id: Uuid) -> Result<Vec<Notification>> {
        let rows =
            sqlx::query("SELECT * FROM notifications WHERE claim_id = $1 ORDER BY created_at")
                .bind(claim_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(notification_from_row).collect()
    }
}

/// Reads the `insurance_policies`, `customers` and `garages` reference tables.
#[derive(Clone)]
pub struct PostgresDirectory {
    pool: PgPool,
}

const POLICY_COLUMNS: &str = "id::text AS id, policy_number, holder_name, holder_phone, \
    holder_email, coverage_type, roadside_assistance, towing_coverage, max_towing_distance, \
    transport_coverage, rental_car_coverage, vehicle_make, vehicle_model, vehicle_year";

const PROVIDER_COLUMNS: &str = "id::text AS id, name, phone, address, services, \
    average_response_time::int4 AS average_response_time, rating::float8 AS rating";

fn directory_error(e: sqlx::Error) -> ClaimError {
    ClaimError::Directory(e.to_string())
}

fn policy_from_row(row: &PgRow) -> std::result::Result<Policy, sqlx::Error> {
    let flag = |name: &str| -> std::result::Result<bool, sqlx::Error> {
        Ok(row.try_get::<Option<bool>, _>(name)?.unwrap_or(false))
    };
    Ok(Policy {
        id: row.try_get("id")?,
        policy_number: row.try_get("policy_number")?,
        holder_name: row.try_get("holder_name")?,
        holder_phone: row.try_get("holder_phone")?,
        holder_email: row.try_get("holder_email")?,
        coverage_type: row.try_get("coverage_type")?,
        coverage: CoverageFlags {
            roadside_assistance: flag("roadside_assistance")?,
            towing_coverage: flag("towing_coverage")?,
            max_towing_distance: row.try_get("max_towing_distance")?,
            transport_coverage: flag("transport_coverage")?,
            rental_car_coverage: flag("rental_car_coverage")?,
        },
        vehicle_make: row.try_get("vehicle_make")?,
        vehicle_model: row.try_get("vehicle_model")?,
        vehicle_year: row.try_get("vehicle_year")?,
    })
}

fn provider_from_row(row: &PgRow) -> std::result::Result<Provider, sqlx::Error> {
    Ok(Provider {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        address: row.try_get("address")?,
        services: row
            .try_get::<Option<Vec<String>>, _>("services")?
            .unwrap_or_default(),
        average_response_time: row.try_get("average_response_time")?,
        rating: row.try_get("rating")?,
    })
}

impl PostgresDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn policies_where(&self, clause: &str, value: &str) -> Result<Vec<Policy>> {
        let rows = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM insurance_policies WHERE {clause} ORDER BY policy_number"
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await
        .map_err(directory_error)?;
        rows.iter()
            .map(policy_from_row)
            .collect::<std::result::Result<_, _>>()
            .map_err(directory_error)
    }
}

#[async_trait]
impl PolicyDirectory for PostgresDirectory {
    async fn find_policy_by_number(&self, policy_number: &str) -> Result<Option<Policy>> {
        Ok(self
            .policies_where("policy_number = $1", policy_number.trim())
            .await?
            .into_iter()
            .next())
    }

    async fn find_policies_by_phone(&self, phone: &str) -> Result<Vec<Policy>> {
        self.policies_where("holder_phone = $1", phone.trim()).await
    }

    async fn find_policies_by_name(&self, name: &str) -> Result<Vec<Policy>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Vec::new());
        }
        self.policies_where("position(lower($1) in lower(holder_name)) > 0", name)
            .await
    }

    async fn find_customer_by_policy(&self, policy_id: &str) -> Result<Option<Customer>> {
        let row = sqlx::query(
            r#"
            SELECT id::text AS id, full_name, phone, email, address,
                date_of_birth::text AS date_of_birth, licence_number, licence_issuer,
                customer_since::text AS customer_since, policy_ids
            FROM customers
            WHERE $1 = ANY(policy_ids)
            LIMIT 1
            "#,
        )
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(directory_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let customer = (|| -> std::result::Result<Customer, sqlx::Error> {
            Ok(Customer {
                id: row.try_get("id")?,
                full_name: row.try_get("full_name")?,
                phone: row.try_get("phone")?,
                email: row.try_get("email")?,
                address: row.try_get("address")?,
                date_of_birth: row.try_get("date_of_birth")?,
                licence_number: row.try_get("licence_number")?,
                licence_issuer: row.try_get("licence_issuer")?,
                customer_since: row.try_get("customer_since")?,
                policy_ids: row
                    .try_get::<Option<Vec<String>>, _>("policy_ids")?
                    .unwrap_or_default(),
            })
        })()
        .map_err(directory_error)?;
        Ok(Some(customer))
    }

    async fn list_providers_by_service_type(&self, service: ServiceType) -> Result<Vec<Provider>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM garages WHERE $1 = ANY(services)"
        ))
        .bind(service.provider_tag())
        .fetch_all(&self.pool)
        .await
        .map_err(directory_error)?;
        let mut providers = rows
            .iter()
            .map(provider_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(directory_error)?;
        rank_providers(&mut providers);
        Ok(providers)
    }

    async fn find_provider(&self, provider_id: &str) -> Result<Option<Provider>> {
        let row = sqlx::query(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM garages WHERE id::text = $1"
        ))
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(directory_error)?;
        row.as_ref()
            .map(provider_from_row)
            .transpose()
            .map_err(directory_error)
    }
}
