use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::claim::{ArrangedService, Claim, ClaimPatch, Notification, TranscriptEntry};
use crate::error::{ClaimError, Result};

/// Everything one conversation turn writes, committed together or not at all.
#[derive(Debug, Clone)]
pub struct TurnCommit {
    pub claim_id: Uuid,
    /// Version the turn started from; a mismatch is a concurrent write.
    pub expected_version: i64,
    /// Service rows to insert are `patch.append_services`.
    pub patch: ClaimPatch,
    pub notifications: Vec<Notification>,
    pub transcript: Vec<TranscriptEntry>,
}

/// Durable claim records plus the append-only service and notification rows.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn create(&self, claim: Claim) -> Result<Claim>;
    async fn load(&self, id: Uuid) -> Result<Option<Claim>>;
    /// Every claim, newest first.
    async fn list_claims(&self) -> Result<Vec<Claim>>;
    /// Merge-patch: keys absent from `patch` keep their value.
    async fn update(&self, id: Uuid, patch: &ClaimPatch) -> Result<Claim>;
    async fn append_transcript(&self, id: Uuid, entries: &[TranscriptEntry]) -> Result<Claim>;
    async fn commit_turn(&self, commit: &TurnCommit) -> Result<Claim>;
    async fn list_services(&self, claim_id: Uuid) -> Result<Vec<ArrangedService>>;
    async fn list_notifications(&self, claim_id: Uuid) -> Result<Vec<Notification>>;
}

/// In-memory implementation of ClaimStore
#[derive(Clone, Default)]
pub struct InMemoryClaimStore {
    claims: Arc<DashMap<Uuid, Claim>>,
    services: Arc<DashMap<Uuid, Vec<ArrangedService>>>,
    notifications: Arc<DashMap<Uuid, Vec<Notification>>>,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn touch(claim: &mut Claim) {
    claim.version += 1;
    claim.updated_at = Utc::now();
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn create(&self, claim: Claim) -> Result<Claim> {
        if self.claims.contains_key(&claim.id) {
            return Err(ClaimError::Storage(format!("claim {} already exists", claim.id)));
        }
        self.claims.insert(claim.id, claim.clone());
        Ok(claim)
    }

    async fn load(&self, id: Uuid) -> Result<Option<Claim>> {
        Ok(self.claims.get(&id).map(|entry| entry.clone()))
    }

    async fn list_claims(&self) -> Result<Vec<Claim>> {
        let mut claims: Vec<Claim> = self
            .claims
            .iter()
            .map(|entry| entry.clone())
            .collect();
        claims.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(claims)
    }

    async fn update(&self, id: Uuid, patch: &ClaimPatch) -> Result<Claim> {
        let mut claim = self.claims.get_mut(&id).ok_or(ClaimError::ClaimNotFound(id))?;
        claim.apply(patch);
        touch(&mut claim);
        if !patch.append_services.is_empty() {
            let mut rows = self.services.entry(id).or_default();
            for service in &patch.append_services {
                if !rows.iter().any(|s| s.id == service.id) {
                    rows.push(service.clone());
                }
            }
        }
        Ok(claim.clone())
    }

    async fn append_transcript(&self, id: Uuid, entries: &[TranscriptEntry]) -> Result<Claim> {
        let mut claim = self.claims.get_mut(&id).ok_or(ClaimError::ClaimNotFound(id))?;
        claim.transcript.extend_from_slice(entries);
        touch(&mut claim);
        Ok(claim.clone())
    }

    async fn commit_turn(&self, commit: &TurnCommit) -> Result<Claim> {
        let id = commit.claim_id;
        // The entry guard is held until the end, so the commit is atomic with
        // respect to other writers of this claim.
        let mut claim = self.claims.get_mut(&id).ok_or(ClaimError::ClaimNotFound(id))?;
        if claim.version != commit.expected_version {
            return Err(ClaimError::VersionConflict {
                claim_id: id,
                expected: commit.expected_version,
                found: claim.version,
            });
        }

        claim.apply(&commit.patch);
        claim.transcript.extend_from_slice(&commit.transcript);
        touch(&mut claim);

        if !commit.patch.append_services.is_empty() {
            let mut rows = self.services.entry(id).or_default();
            for service in &commit.patch.append_services {
                if !rows.iter().any(|s| s.id == service.id) {
                    rows.push(service.clone());
                }
            }
        }
        if !commit.notifications.is_empty() {
            self.notifications
                .entry(id)
                .or_default()
                .extend(commit.notifications.iter().cloned());
        }

        Ok(claim.clone())
    }

    async fn list_services(&self, claim_id: Uuid) -> Result<Vec<ArrangedService>> {
        Ok(self
            .services
            .get(&claim_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn list_notifications(&self, claim_id: Uuid) -> Result<Vec<Notification>> {
        Ok(self
            .notifications
            .get(&claim_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }
}
