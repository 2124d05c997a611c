//! Per-team concurrency admission control.
//!
//! ```text
//! check_admission(job)
//!     ├─► slot free  ─► ledger active += job ─► queue.add_job
//!     └─► team full  ─► queue backlog storage + ledger backlog
//!
//! job terminal / lease expired
//!     └─► on_capacity_freed ─► re-hold live jobs ─► promote_next ─► queue.promote_backlog_job
//!
//! reconcile(team?)
//!     └─► ledger vs queue of record, both directions
//! ```

pub mod admission;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod memory_ledger;
pub mod redis_ledger;
pub mod sweeper;

pub use admission::{AdmissionConfig, AdmissionControl, AdmissionOutcome, ReconcileReport};
pub use error::{AdmissionError, AdmissionResult};
pub use ledger::{ConcurrencyLedger, LedgerKey};
pub use limits::ConcurrencyLimits;
pub use memory_ledger::MemoryConcurrencyLedger;
pub use redis_ledger::RedisConcurrencyLedger;
pub use sweeper::BacklogSweeper;
