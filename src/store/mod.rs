use crate::entity::StateEntity;
use crate::query::{Criterion, QuerySpec};

/// Transactional façade over a single entity kind.
///
/// Workers poll [`next_not_leased`](StateEntityStore::next_not_leased) on a
/// timer, process each returned record, then call
/// [`save`](StateEntityStore::save); API-facing services use the by-id
/// operations directly. Mutual exclusion between workers is entirely
/// lease-based; there is no in-process coordination.
#[async_trait::async_trait]
pub trait StateEntityStore<E: StateEntity>: Send + Sync {
    /// Plain read. No lease side effect; absence is not an error.
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>>;

    /// Select up to `max` eligible records (lease absent or expired, and
    /// `state_timestamp <= now`) matching `criteria`, acquiring a lease for
    /// this store's configured holder on each, all in one transaction.
    /// Ordered oldest-first by `state_timestamp`; zero eligible records is an
    /// empty vec, not an error.
    async fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> StoreResult<Vec<E>>;

    /// Fetch then lease for `holder` in one transaction. Fails with
    /// [`StoreError::NotFound`] if no record exists and
    /// [`StoreError::AlreadyLeased`] on lease conflict.
    async fn find_by_id_and_lease(&self, id: &str, holder: &str) -> StoreResult<E>;

    /// Upsert. The update path breaks any lease held by this store's
    /// configured holder and refreshes `updated_at`; the insert path starts
    /// unleased. The store does not verify that the caller legitimately
    /// leased the record first; that is the worker's contract.
    async fn save(&self, entity: &E) -> StoreResult<()>;

    /// Remove the record and any lease on it, returning the deleted value.
    async fn delete_by_id(&self, id: &str) -> StoreResult<E>;

    /// Filtered, sorted, paginated read with no lease side effect.
    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<E>>;
}

pub mod error;
pub mod in_memory;
pub mod lease;
pub mod sqlite;

pub use error::{PersistenceError, StoreError, StoreResult};
pub use in_memory::InMemoryStateStore;
pub use lease::{Lease, LeaseConfig};
pub use sqlite::{SqliteStateStore, SqliteStoreOptions};
