//! Call and extension synchronization core.
//!
//! Two sources disagree about PBX state: live webhook pushes and the
//! periodic CDR pull. Both are reduced to canonical events by the
//! [`normalize`] function and then fed through the single
//! [`StateStore::apply_event`] entry point, so the paths cannot diverge in
//! behavior. Ordering between them for the same call id is resolved by the
//! status-rank rule, never by arrival order.

mod normalize;
mod reconcile;
mod store;

pub use normalize::{normalize, MalformedEvent};
pub use reconcile::{
    CdrSource, ReconcileConfig, ReconcileError, ReconcileService, ReconcileStats,
};
pub use store::{AppliedCall, ApplyOutcome, StateStore, StoreError};
