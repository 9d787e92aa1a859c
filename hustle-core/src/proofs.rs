//! Proof gate - decides when a task may complete
//!
//! Workers submit a proof artifact; quality is derived from the payload
//! shape, never self-reported. A task reaches COMPLETED only through
//! [`ProofGate::complete_task`], which requires an accepted artifact.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{GeoPoint, ProofArtifact, ProofQuality, ProofState, Task, TaskStatus};
use crate::store::EscrowStore;
use crate::CoreResult;

/// Configuration for the proof gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofGateConfig {
    /// Maximum photos per submission
    pub max_photos: usize,
    /// Maximum note length in characters
    pub note_max_chars: usize,
    /// Hours before an unreviewed submission expires
    pub ttl_hours: i64,
}

impl Default for ProofGateConfig {
    fn default() -> Self {
        Self {
            max_photos: 10,
            note_max_chars: 2_000,
            ttl_hours: 72, // 3 days
        }
    }
}

/// Proof submission payload as captured by the app
#[derive(Debug, Clone, Default)]
pub struct ProofPayload {
    pub photo_urls: Vec<String>,
    pub note: Option<String>,
    pub geo: Option<GeoPoint>,
    pub captured_at: Option<DateTime<Utc>>,
}

/// What the submitter gets back
#[derive(Debug, Clone)]
pub struct ProofReceipt {
    pub proof_id: Uuid,
    pub quality: ProofQuality,
}

/// Derive quality from the payload shape: a photo makes it STANDARD,
/// photo plus location plus capture time makes it ENHANCED, anything
/// less is BASIC
pub fn derive_quality(payload: &ProofPayload) -> ProofQuality {
    if payload.photo_urls.is_empty() {
        ProofQuality::Basic
    } else if payload.geo.is_some() && payload.captured_at.is_some() {
        ProofQuality::Enhanced
    } else {
        ProofQuality::Standard
    }
}

/// The rule surface for proof-gated task completion
pub struct ProofGate {
    store: Arc<dyn EscrowStore>,
    config: ProofGateConfig,
}

impl ProofGate {
    pub fn new(store: Arc<dyn EscrowStore>, config: ProofGateConfig) -> Self {
        Self { store, config }
    }

    /// Submit a proof artifact for a task
    pub async fn submit(
        &self,
        task_id: Uuid,
        user_id: Uuid,
        payload: ProofPayload,
    ) -> CoreResult<ProofReceipt> {
        self.validate_payload(&payload)?;

        let mut tx = self.store.begin().await?;
        let task = tx
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::precondition(format!("no task {task_id}")))?;

        if task.assigned_worker_id != Some(user_id) {
            return Err(CoreError::precondition(
                "only the assigned worker can submit proof",
            ));
        }
        if task.status != TaskStatus::Accepted {
            return Err(CoreError::precondition(format!(
                "proof can only be submitted for an accepted task (status is {})",
                task.status
            )));
        }
        if tx.get_proof_for_task(task_id).await?.is_some() {
            return Err(CoreError::precondition("task already has a proof artifact"));
        }

        let quality = derive_quality(&payload);
        let proof = ProofArtifact {
            id: Uuid::new_v4(),
            task_id,
            worker_id: user_id,
            state: ProofState::Submitted,
            quality,
            photo_urls: payload.photo_urls,
            note: payload.note,
            geo: payload.geo,
            captured_at: payload.captured_at,
            rejection_reason: None,
            submitted_at: Utc::now(),
            resolved_at: None,
        };
        tx.insert_proof(&proof).await?;
        tx.transition_task(task_id, TaskStatus::ProofSubmitted).await?;
        tx.commit().await?;

        info!(%task_id, proof_id = %proof.id, quality = quality.as_str(), "proof submitted");
        Ok(ProofReceipt {
            proof_id: proof.id,
            quality,
        })
    }

    /// Accept a submitted proof
    pub async fn accept(&self, proof_id: Uuid) -> CoreResult<ProofArtifact> {
        let mut tx = self.store.begin().await?;
        let proof = tx
            .update_proof_state(proof_id, ProofState::Accepted, None)
            .await?;
        tx.commit().await?;
        info!(%proof_id, task_id = %proof.task_id, "proof accepted");
        Ok(proof)
    }

    /// Reject a submitted proof with a reason
    pub async fn reject(&self, proof_id: Uuid, reason: &str) -> CoreResult<ProofArtifact> {
        let mut tx = self.store.begin().await?;
        let proof = tx
            .update_proof_state(proof_id, ProofState::Rejected, Some(reason))
            .await?;
        tx.commit().await?;
        info!(%proof_id, task_id = %proof.task_id, reason, "proof rejected");
        Ok(proof)
    }

    /// True iff the task has a proof artifact in `accepted`
    pub async fn can_complete(&self, task_id: Uuid) -> CoreResult<bool> {
        let mut tx = self.store.begin().await?;
        let proof = tx.get_proof_for_task(task_id).await?;
        Ok(proof.map(|p| p.state == ProofState::Accepted).unwrap_or(false))
    }

    /// Move a task to COMPLETED; requires an accepted proof artifact
    pub async fn complete_task(&self, task_id: Uuid) -> CoreResult<Task> {
        let mut tx = self.store.begin().await?;
        let accepted = tx
            .get_proof_for_task(task_id)
            .await?
            .map(|p| p.state == ProofState::Accepted)
            .unwrap_or(false);
        if !accepted {
            return Err(CoreError::precondition(
                "task has no accepted proof artifact",
            ));
        }
        let task = tx.transition_task(task_id, TaskStatus::Completed).await?;
        tx.commit().await?;
        info!(%task_id, "task completed");
        Ok(task)
    }

    fn validate_payload(&self, payload: &ProofPayload) -> CoreResult<()> {
        if payload.photo_urls.len() > self.config.max_photos {
            return Err(CoreError::precondition(format!(
                "at most {} photos per submission",
                self.config.max_photos
            )));
        }
        if let Some(note) = &payload.note {
            if note.chars().count() > self.config.note_max_chars {
                return Err(CoreError::precondition(format!(
                    "note exceeds {} characters",
                    self.config.note_max_chars
                )));
            }
        }
        for url in &payload.photo_urls {
            if !url.starts_with("https://") {
                return Err(CoreError::precondition("photo URLs must use HTTPS"));
            }
        }
        Ok(())
    }
}
