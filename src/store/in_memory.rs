use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::lease::{Lease, LeaseConfig};
use super::{PersistenceError, StateEntityStore, StoreError, StoreResult};
use crate::entity::StateEntity;
use crate::now_millis;
use crate::query::{compare, lookup, Criterion, QuerySpec, SortOrder};

struct Inner<E> {
    entities: HashMap<String, E>,
    leases: HashMap<String, Lease>,
}

/// In-memory state store for tests and embedded single-process use.
///
/// Entities and leases live behind one mutex, which gives every operation the
/// same atomicity the SQL backend gets from a transaction.
pub struct InMemoryStateStore<E: StateEntity> {
    inner: Mutex<Inner<E>>,
    lease: LeaseConfig,
}

impl<E: StateEntity> InMemoryStateStore<E> {
    pub fn new(lease: LeaseConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entities: HashMap::new(),
                leases: HashMap::new(),
            }),
            lease,
        }
    }

    /// True iff a non-expired lease exists on `id`.
    pub async fn is_leased(&self, id: &str) -> bool {
        let inner = self.inner.lock().await;
        matches!(inner.leases.get(id), Some(lease) if !lease.is_expired(now_millis()))
    }

    fn acquire(inner: &mut Inner<E>, id: &str, holder: &str, duration: Duration, now_ms: i64) -> bool {
        match inner.leases.get(id) {
            Some(existing) if !existing.is_expired(now_ms) => false,
            _ => {
                inner
                    .leases
                    .insert(id.to_string(), Lease::new(holder, now_ms, duration));
                true
            }
        }
    }

    fn break_lease(inner: &mut Inner<E>, id: &str, holder: &str) {
        // Holder mismatch is a silent no-op; callers only break their own leases
        if matches!(inner.leases.get(id), Some(lease) if lease.leased_by == holder) {
            inner.leases.remove(id);
        }
    }

    fn to_doc(entity: &E) -> StoreResult<Value> {
        serde_json::to_value(entity).map_err(|e| {
            PersistenceError::permanent("query", format!("Failed to serialize {}: {e}", E::KIND)).into()
        })
    }
}

#[async_trait::async_trait]
impl<E: StateEntity> StateEntityStore<E> for InMemoryStateStore<E> {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>> {
        let inner = self.inner.lock().await;
        Ok(inner.entities.get(id).cloned())
    }

    async fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> StoreResult<Vec<E>> {
        let mut inner = self.inner.lock().await;
        let now = now_millis();

        let mut eligible = Vec::new();
        for entity in inner.entities.values() {
            if entity.state_timestamp() > now {
                continue;
            }
            if matches!(inner.leases.get(entity.id()), Some(lease) if !lease.is_expired(now)) {
                continue;
            }
            let doc = Self::to_doc(entity)?;
            if criteria.iter().all(|criterion| criterion.matches(&doc)) {
                eligible.push(entity.clone());
            }
        }
        eligible.sort_by_key(|entity| entity.state_timestamp());
        eligible.truncate(max);

        for entity in &eligible {
            Self::acquire(&mut inner, entity.id(), &self.lease.holder, self.lease.duration, now);
        }
        debug!(
            target: "dataplane_store::in_memory",
            kind = E::KIND,
            holder = %self.lease.holder,
            count = eligible.len(),
            "leased batch of eligible records"
        );
        Ok(eligible)
    }

    async fn find_by_id_and_lease(&self, id: &str, holder: &str) -> StoreResult<E> {
        let mut inner = self.inner.lock().await;
        let Some(entity) = inner.entities.get(id).cloned() else {
            return Err(StoreError::not_found(format!("{} {id} not found", E::KIND)));
        };
        if !Self::acquire(&mut inner, id, holder, self.lease.duration, now_millis()) {
            return Err(StoreError::already_leased(format!("{} {id} is already leased", E::KIND)));
        }
        Ok(entity)
    }

    async fn save(&self, entity: &E) -> StoreResult<()> {
        let mut saved = entity.clone();
        saved.touch(now_millis());

        let mut inner = self.inner.lock().await;
        if inner.entities.contains_key(saved.id()) {
            Self::break_lease(&mut inner, saved.id(), &self.lease.holder);
        }
        inner.entities.insert(saved.id().to_string(), saved);
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> StoreResult<E> {
        let mut inner = self.inner.lock().await;
        let Some(entity) = inner.entities.remove(id) else {
            return Err(StoreError::not_found(format!("{} {id} not found", E::KIND)));
        };
        inner.leases.remove(id);
        Ok(entity)
    }

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<E>> {
        let inner = self.inner.lock().await;

        let mut matched = Vec::new();
        for entity in inner.entities.values() {
            let doc = Self::to_doc(entity)?;
            if spec.filter.iter().all(|criterion| criterion.matches(&doc)) {
                matched.push((doc, entity.clone()));
            }
        }

        let sort_field = spec.sort_field.clone().unwrap_or_else(|| "id".to_string());
        matched.sort_by(|(a, _), (b, _)| {
            let left = lookup(a, &sort_field).unwrap_or(&Value::Null);
            let right = lookup(b, &sort_field).unwrap_or(&Value::Null);
            let ordering = compare(left, right).unwrap_or(std::cmp::Ordering::Equal);
            match spec.sort_order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });

        let entities = matched
            .into_iter()
            .map(|(_, entity)| entity)
            .skip(spec.offset as usize)
            .take(spec.limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .collect();
        Ok(entities)
    }
}
