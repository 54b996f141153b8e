//! Lease-protected persistent state store for long-running units of work.
//!
//! Data-transfer flow records and data-plane instance records are processed
//! exactly-once-at-a-time across a pool of concurrent workers: a worker pulls
//! a batch of eligible, not-currently-leased records (which atomically leases
//! them), processes each record, then saves it back (which releases the
//! worker's own lease together with the state change). Leases expire, so a
//! crashed worker never locks a record out permanently.
//!
//! ```rust,no_run
//! use dataplane_store::{
//!     Criterion, DataAddress, DataFlow, DataFlowState, LeaseConfig, SqliteStateStore,
//!     SqliteStoreOptions, StateEntityStore, now_millis,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStateStore::<DataFlow>::new(
//!     "sqlite:flows.db",
//!     LeaseConfig::new("runtime-1"),
//!     SqliteStoreOptions::default(),
//! )
//! .await?;
//!
//! let flow = DataFlow::new(
//!     "f1",
//!     DataAddress::new("s3"),
//!     DataAddress::new("blob"),
//!     now_millis(),
//! );
//! store.save(&flow).await?;
//!
//! // Worker loop: claim a batch, process, save back.
//! let batch = store
//!     .next_not_leased(10, &[Criterion::eq("state", DataFlowState::NotStarted.code())])
//!     .await?;
//! for mut flow in batch {
//!     flow.transition_to(DataFlowState::Started.code(), now_millis());
//!     store.save(&flow).await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

pub mod entity;
pub mod query;
pub mod store;

pub use entity::{DataAddress, DataFlow, DataFlowState, DataPlaneInstance, StateEntity};
pub use query::{Criterion, CriterionOperator, QuerySpec, SortOrder};
pub use store::{
    InMemoryStateStore, Lease, LeaseConfig, PersistenceError, SqliteStateStore, SqliteStoreOptions,
    StateEntityStore, StoreError, StoreResult,
};

/// Current epoch time in milliseconds. All timestamps in the store
/// (state scheduling, lease expiry, audit fields) use this resolution.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock should be after UNIX epoch")
        .as_millis() as i64
}
