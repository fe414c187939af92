pub mod db_sessions;
pub mod entity;
pub mod errors;
pub mod launch;
pub mod lifecycle;
pub mod process_detection;
pub mod reconcile;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use db_sessions::{SessionMethods, StatusChange};
pub use entity::{
    CloseCheck, CloseWarning, CloseWarningKind, ConflictState, GitSnapshot, Session,
    SessionFilter, SessionStatus,
};
pub use errors::{SessionError, SessionResult};
pub use launch::LaunchOutcome;
pub use process_detection::{LsofProcessDetector, ProcessDetector};
pub use service::{ReconcileReport, SessionManager, DEFAULT_STALE_THRESHOLD_SECS};
