use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::kernel::{IdentityKernel, InvariantRule, KernelError, KernelSpec, PredicateRegistry};

/// Version reserved for the process-wide fallback identity.
pub const FALLBACK_VERSION: u32 = 0;

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Auto,
    Reviewed,
    UserApproved,
    SystemRollback,
}

impl ApprovalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Reviewed => "reviewed",
            Self::UserApproved => "user_approved",
            Self::SystemRollback => "system_rollback",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "reviewed" => Some(Self::Reviewed),
            "user_approved" => Some(Self::UserApproved),
            "system_rollback" => Some(Self::SystemRollback),
            _ => None,
        }
    }
}

/// One immutable revision of an owner's identity.
#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    pub kernel: Arc<IdentityKernel>,
    pub version: u32,
    pub timestamp: OffsetDateTime,
    pub approval_status: ApprovalStatus,
    pub reflection: String,
}

impl IdentitySnapshot {
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.version == FALLBACK_VERSION
    }

    /// Serializable view of this snapshot.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the kernel holds an unnamed predicate.
    pub fn to_record(&self) -> Result<SnapshotRecord, KernelError> {
        Ok(SnapshotRecord {
            version: self.version,
            timestamp: self.timestamp,
            approval_status: self.approval_status,
            reflection: self.reflection.clone(),
            kernel: self.kernel.to_spec()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotRecord {
    pub version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub approval_status: ApprovalStatus,
    pub reflection: String,
    pub kernel: KernelSpec,
}

impl SnapshotRecord {
    /// Rebuild the snapshot, resolving predicate names through `registry`.
    ///
    /// # Errors
    /// Returns a [`KernelError`] when the stored kernel no longer constructs.
    pub fn into_snapshot(self, registry: &PredicateRegistry) -> Result<IdentitySnapshot, KernelError> {
        let kernel = IdentityKernel::from_spec(&self.kernel, registry)?;
        Ok(IdentitySnapshot {
            kernel: Arc::new(kernel),
            version: self.version,
            timestamp: self.timestamp,
            approval_status: self.approval_status,
            reflection: self.reflection,
        })
    }
}

/// The process-wide identity returned when an owner has no history.
///
/// Built on first use and never mutated afterwards.
#[must_use]
pub fn fallback_snapshot() -> &'static IdentitySnapshot {
    static FALLBACK: OnceLock<IdentitySnapshot> = OnceLock::new();
    FALLBACK.get_or_init(|| IdentitySnapshot {
        kernel: Arc::new(IdentityKernel {
            name: "Baseline Assistant".to_string(),
            role: "helpful assistant".to_string(),
            core_values: vec![
                "honesty".to_string(),
                "helpfulness".to_string(),
                "safety".to_string(),
            ],
            communication_style: "neutral".to_string(),
            expertise_domains: vec!["general knowledge".to_string()],
            invariants: vec![InvariantRule::contains_not("entry_0", "illegal")],
        }),
        version: FALLBACK_VERSION,
        timestamp: OffsetDateTime::UNIX_EPOCH,
        approval_status: ApprovalStatus::SystemRollback,
        reflection: "Fallback due to load failure".to_string(),
    })
}
