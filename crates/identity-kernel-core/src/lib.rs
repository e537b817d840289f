//! Identity kernel: invariant validation for generated text, and a bounded,
//! versioned history of identity snapshots per owner.

mod engine;
mod kernel;
mod manager;
mod snapshot;
mod store;

pub use engine::{
    evaluate_rule, validate, RuleOutcome, ValidationReport, Violation, ViolationKind,
    PANIC_ERROR_KIND,
};
pub use kernel::{
    IdentityKernel, InvariantRule, KernelError, KernelSpec, PatternKind, PatternRule,
    PredicateError, PredicateFn, PredicateRegistry, PredicateRule, RuleSpec,
};
pub use manager::{IdentityManager, ManagerConfig, ManagerError, DEFAULT_HISTORY_CAP};
pub use snapshot::{
    fallback_snapshot, ApprovalStatus, IdentitySnapshot, SnapshotRecord, FALLBACK_VERSION,
};
pub use store::{InMemorySnapshotStore, NextSnapshot, SnapshotStore, StoreError};
