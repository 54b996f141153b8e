use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};

/// Time-bounded exclusive claim on a record. Expiry is derived, never stored:
/// a lease is stale once `leased_at + lease_duration <= now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub leased_by: String,
    pub leased_at: i64,
    pub lease_duration: i64,
}

impl Lease {
    pub fn new(leased_by: impl Into<String>, leased_at: i64, duration: Duration) -> Self {
        Self {
            leased_by: leased_by.into(),
            leased_at,
            lease_duration: duration.as_millis().min(i64::MAX as u128) as i64,
        }
    }

    pub fn expires_at(&self) -> i64 {
        self.leased_at.saturating_add(self.lease_duration)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at() <= now_ms
    }
}

/// Lease holder identity and duration for one store instance.
///
/// The duration must be short enough to allow fast reclaim after a worker
/// crash and long enough to cover expected processing time; it is always
/// configuration, never hardcoded.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub holder: String,
    pub duration: Duration,
}

impl LeaseConfig {
    pub const DEFAULT_DURATION: Duration = Duration::from_secs(60);

    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            duration: Self::DEFAULT_DURATION,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Lease operations scoped to the caller's transaction, so lease state and
/// record state always commit or roll back together.
pub(crate) struct SqlLeaseContext {
    lease_table: String,
    duration_ms: i64,
}

impl SqlLeaseContext {
    pub(crate) fn new(lease_table: impl Into<String>, duration: Duration) -> Self {
        Self {
            lease_table: lease_table.into(),
            duration_ms: duration.as_millis().min(i64::MAX as u128) as i64,
        }
    }

    /// Acquire a lease for `holder`. Succeeds if no lease row exists or the
    /// existing lease has expired; the guarded upsert makes the steal atomic.
    /// Returns false on conflict without mutating the existing lease.
    pub(crate) async fn acquire(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity_id: &str,
        holder: &str,
        now_ms: i64,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO {table} (entity_id, leased_by, leased_at, lease_duration)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(entity_id) DO UPDATE
            SET leased_by = ?2, leased_at = ?3, lease_duration = ?4
            WHERE leased_at + lease_duration <= ?3
            "#,
            table = self.lease_table
        );
        let result = sqlx::query(&sql)
            .bind(entity_id)
            .bind(holder)
            .bind(now_ms)
            .bind(self.duration_ms)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clear the lease only if `holder` owns it; a mismatch is a silent
    /// no-op, since callers only ever break their own leases.
    pub(crate) async fn break_lease(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity_id: &str,
        holder: &str,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            "DELETE FROM {table} WHERE entity_id = ?1 AND leased_by = ?2",
            table = self.lease_table
        );
        sqlx::query(&sql).bind(entity_id).bind(holder).execute(&mut **tx).await?;
        Ok(())
    }

    /// True iff a lease row exists and has not expired.
    pub(crate) async fn is_leased(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity_id: &str,
        now_ms: i64,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "SELECT leased_at + lease_duration FROM {table} WHERE entity_id = ?1",
            table = self.lease_table
        );
        let expires_at: Option<i64> = sqlx::query_scalar(&sql)
            .bind(entity_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(matches!(expires_at, Some(expiry) if expiry > now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry_boundary() {
        let lease = Lease::new("worker-a", 1000, Duration::from_millis(500));
        assert_eq!(lease.expires_at(), 1500);
        assert!(!lease.is_expired(1499));
        // Expiry is inclusive: a lease expiring exactly now is reclaimable
        assert!(lease.is_expired(1500));
        assert!(lease.is_expired(2000));
    }

    #[test]
    fn test_lease_config_defaults() {
        let config = LeaseConfig::new("runtime-1");
        assert_eq!(config.holder, "runtime-1");
        assert_eq!(config.duration, LeaseConfig::DEFAULT_DURATION);

        let short = LeaseConfig::new("runtime-1").with_duration(Duration::from_millis(250));
        assert_eq!(short.duration, Duration::from_millis(250));
    }
}
