//! Handoff protocol: the contract an agent must satisfy before control
//! passes to the next phase.
//!
//! Each target phase statically declares the artifacts it requires. A
//! declaration that covers them yields a signed [`HandoffCertificate`];
//! otherwise a [`HandoffRejection`] naming what is missing. Re-declaring for
//! the same `(workflow, phase)` supersedes the earlier certificate, and only
//! the latest one is honoured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{ArtifactKind, ArtifactMap, OrchestratorError, Phase, Result, Workflow};

/// Artifacts that must exist (produced now or already committed) before
/// `phase` can be entered.
pub fn required_artifacts(phase: Phase) -> &'static [ArtifactKind] {
    match phase {
        Phase::Plan => &[ArtifactKind::Spec],
        Phase::Apply => &[ArtifactKind::Diff],
        Phase::Test => &[ArtifactKind::TestReport],
        Phase::Pr => &[ArtifactKind::Diff, ArtifactKind::PrUrl],
        Phase::Merge => &[ArtifactKind::PrUrl, ArtifactKind::QaReport],
        Phase::Intake | Phase::Done | Phase::Failed => &[],
    }
}

/// Proof that an agent's output satisfies the target phase's contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffCertificate {
    pub workflow_id: String,
    pub from_agent: String,
    pub to_phase: Phase,
    /// Artifacts produced by this handoff (merged into the workflow on commit).
    pub artifacts: ArtifactMap,
    pub required_artifacts_present: bool,
    /// Issue order; a higher sequence supersedes a lower one.
    pub sequence: u64,
    pub issued_at: DateTime<Utc>,
    /// SHA-256 hex over every field above except `issued_at`.
    pub signature: String,
}

impl HandoffCertificate {
    /// NUL-separated fields, artifacts in key order.
    fn compute_signature(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.workflow_id.as_str(),
            self.from_agent.as_str(),
            self.to_phase.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.sequence.to_be_bytes());
        hasher.update([u8::from(self.required_artifacts_present)]);
        for (kind, reference) in &self.artifacts {
            hasher.update(kind.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(reference.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Recompute the signature and check the contract flag.
    pub fn verify(&self) -> Result<()> {
        if !self.required_artifacts_present {
            return Err(OrchestratorError::InvalidCertificate {
                to_phase: self.to_phase,
                reason: "required artifacts not present".to_string(),
            });
        }
        let computed = self.compute_signature();
        if computed != self.signature {
            return Err(OrchestratorError::InvalidCertificate {
                to_phase: self.to_phase,
                reason: format!(
                    "signature mismatch: expected {}, computed {computed}",
                    self.signature
                ),
            });
        }
        Ok(())
    }
}

/// Why a declaration was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRejection {
    pub workflow_id: String,
    pub from_agent: String,
    pub to_phase: Phase,
    pub missing: Vec<ArtifactKind>,
}

impl From<HandoffRejection> for OrchestratorError {
    fn from(r: HandoffRejection) -> Self {
        OrchestratorError::HandoffRejection {
            workflow_id: r.workflow_id,
            from_agent: r.from_agent,
            to_phase: r.to_phase,
            missing: r.missing,
        }
    }
}

/// Issues and tracks handoff certificates.
#[derive(Default)]
pub struct HandoffService {
    sequence: AtomicU64,
    latest: Mutex<HashMap<(String, Phase), HandoffCertificate>>,
}

impl HandoffService {
    pub fn new() -> Self {
        Self::default()
    }

    fn certificates(&self) -> MutexGuard<'_, HashMap<(String, Phase), HandoffCertificate>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate `produced` (together with what `workflow` already holds)
    /// against the requirements of `to_phase`.
    ///
    /// A rejection also withdraws any earlier certificate for the pair, so a
    /// failed retry can never fall back to a stale success.
    pub fn declare_ready(
        &self,
        workflow: &Workflow,
        from_agent: &str,
        to_phase: Phase,
        produced: ArtifactMap,
    ) -> std::result::Result<HandoffCertificate, HandoffRejection> {
        let key = (workflow.id.clone(), to_phase);
        let missing: Vec<ArtifactKind> = required_artifacts(to_phase)
            .iter()
            .copied()
            .filter(|k| !produced.contains_key(k) && !workflow.artifacts.contains_key(k))
            .collect();

        if !missing.is_empty() {
            self.certificates().remove(&key);
            tracing::debug!(
                workflow_id = %workflow.id,
                to_phase = %to_phase,
                missing = ?missing,
                "handoff rejected"
            );
            return Err(HandoffRejection {
                workflow_id: workflow.id.clone(),
                from_agent: from_agent.to_string(),
                to_phase,
                missing,
            });
        }

        let mut cert = HandoffCertificate {
            workflow_id: workflow.id.clone(),
            from_agent: from_agent.to_string(),
            to_phase,
            artifacts: produced,
            required_artifacts_present: true,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            issued_at: Utc::now(),
            signature: String::new(),
        };
        cert.signature = cert.compute_signature();

        self.certificates().insert(key, cert.clone());
        Ok(cert)
    }

    /// The certificate the controller must honour for this pair.
    pub fn latest(&self, workflow_id: &str, to_phase: Phase) -> Option<HandoffCertificate> {
        self.certificates()
            .get(&(workflow_id.to_string(), to_phase))
            .cloned()
    }

    /// `false` once a later declaration (or a rejection) superseded `cert`.
    pub fn is_current(&self, cert: &HandoffCertificate) -> bool {
        self.latest(&cert.workflow_id, cert.to_phase)
            .is_some_and(|latest| latest.sequence == cert.sequence)
    }

    /// Drop every certificate held for `workflow_id`.
    pub fn clear(&self, workflow_id: &str) {
        self.certificates().retain(|(id, _), _| id != workflow_id);
    }
}
