pub mod lock;
pub mod service;
pub mod types;

pub use service::MergeService;
pub use types::{
    MergeOptions, MergeOutcome, MergeState, SyncOptions, SyncOutcome, SyncStrategy,
};
