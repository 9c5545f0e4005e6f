// Two-phase commit support.
//
// Each global transaction is associated with a global transaction
// identifier (GID) supplied by the client. Active global transactions
// live in a fixed-capacity shared registry; reserving a slot happens
// before the PREPARE record is written so duplicate GIDs are refused up
// front. A prepared transaction carries a dummy participant in the
// process array, which is what keeps its XID considered running until
// the coordinator's decision arrives.
//
// All state a prepared transaction needs to survive a crash rides in its
// single PREPARE WAL record; recovery rebuilds the registry from the log.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | Constants, sessions, wire records, checkpoint payload |
// | [`error`] | Two-phase error kinds |
// | [`payload`] | Prepare-state payload assembly and parsing |
// | [`registry`] | Slot registry, dummy-participant bridge, abort hook |
// | [`rmgr`] | Resource-manager callback registry |
// | [`manager`] | Prepare/finish pipelines and checkpoint interface |
// | [`recovery`] | Recovery index, replay, prescan, recovery |
// | [`statistics`] | Outcome counters |

pub mod error;
pub mod manager;
pub mod payload;
pub mod recovery;
pub mod registry;
pub mod rmgr;
pub mod statistics;
pub mod types;

pub use error::{TwoPhaseError, TwoPhaseResult};
pub use manager::TwoPhaseManager;
pub use payload::{ParsedPayload, PayloadBuilder, PayloadHeader, PayloadRecord};
pub use recovery::RecoveryIndex;
pub use registry::{GxactHandle, GxactRegistry};
pub use rmgr::{RmgrCallbacks, RmgrId, RmgrPhase, RmgrRegistry, TWOPHASE_RM_END_ID, TWOPHASE_RM_MAX_ID};
pub use statistics::{TwoPhaseStats, TwoPhaseStatsSummary};
pub use types::{
    crack_distributed_gid, CheckpointPayload, PreparedPointer, PreparedSnapshot, Session,
    SubxidCache, TwoPhaseConfig, XactAbortPreparedRecord, XactCommitPreparedRecord, GID_SIZE,
    MAX_CACHED_SUBXIDS, TWOPHASE_MAGIC,
};
