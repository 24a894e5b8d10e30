//! 承诺：提取、排队、履约

pub mod extract;
pub mod fulfill;
pub mod queue;

pub use extract::{extract_commitments, ExtractionContext};
pub use fulfill::{plan_from_goal, Fulfiller, PlatformFulfiller};
pub use queue::{
    Commitment, CommitmentDraft, CommitmentId, CommitmentKind, CommitmentParams, CommitmentQueue,
    CommitmentStatus, QueueStats, SessionActions,
};
