//! Failover: taking over the ranges of a failed node
//!
//! The master stages ranges on their new owners, every surviving node
//! replays its share of the failed node's commit log into them, then the
//! new owners prepare and commit the ranges. See `coordinator` for the
//! phase sequence.

mod coordinator;
mod errors;
mod master;
mod ownership;
mod phantom;
mod phantom_map;
mod receiver_plan;
mod replay_buffer;

pub use coordinator::FailoverCoordinator;
pub use errors::{FailoverError, FailoverResult};
pub use master::{MasterClient, PhaseReport, ReplayOutcome, ReplayProgress, ReplayReport};
pub use ownership::{
    metadata_row, CoordinationService, MetadataTable, OwnershipWriter, LOCATION_ATTR,
    LOCATION_COLUMN,
};
pub use phantom::{PhantomRange, PhantomState};
pub use phantom_map::{GenerationCheck, PhantomMapState, PhantomRangeMap};
pub use receiver_plan::{ReceiverEntry, ReceiverPlan};
pub use replay_buffer::{
    BufferLimits, DeliveryStats, PhantomUpdate, PhantomUpdateOutcome, PhantomUpdateSender,
    ReplayBuffer,
};
