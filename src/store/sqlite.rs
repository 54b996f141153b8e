use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, warn};

use super::lease::{LeaseConfig, SqlLeaseContext};
use super::{PersistenceError, StateEntityStore, StoreError, StoreResult};
use crate::entity::StateEntity;
use crate::now_millis;
use crate::query::{Criterion, CriterionOperator, QuerySpec, SortOrder};

/// Configuration options for [`SqliteStateStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreOptions {
    pub max_connections: u32,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// SQLite-backed state store with full transactional support.
///
/// Lease state and record state are always mutated under one transaction, so
/// there is never a window where a record is visibly unleased mid-update.
/// One store instance manages one entity kind; the table pair is derived
/// from [`StateEntity::KIND`].
pub struct SqliteStateStore<E: StateEntity> {
    pool: SqlitePool,
    lease: LeaseConfig,
    lease_ctx: SqlLeaseContext,
    table: &'static str,
    lease_table: String,
    _entity: PhantomData<fn() -> E>,
}

impl<E: StateEntity> SqliteStateStore<E> {
    /// Create a new SQLite state store.
    ///
    /// `database_url` is an SQLite connection string (e.g. "sqlite:data.db").
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(
        database_url: &str,
        lease: LeaseConfig,
        options: SqliteStoreOptions,
    ) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        // WAL for concurrent readers while a writer commits
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    // Retry on SQLITE_BUSY instead of failing immediately
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        let table = E::KIND;
        let lease_table = format!("{table}_lease");
        Self::create_schema(&pool, table, &lease_table).await?;

        let lease_ctx = SqlLeaseContext::new(lease_table.clone(), lease.duration);
        Ok(Self {
            pool,
            lease,
            lease_ctx,
            table,
            lease_table,
            _entity: PhantomData,
        })
    }

    /// Convenience: create a private in-memory store, mostly for tests.
    /// Each call gets its own named shared-cache database so pooled
    /// connections see the same data without leaking across stores.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory(lease: LeaseConfig) -> Result<Self, sqlx::Error> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        let url = format!("sqlite:file:dataplane_store_{kind}_{n}?mode=memory&cache=shared", kind = E::KIND);
        Self::new(&url, lease, SqliteStoreOptions::default()).await
    }

    async fn create_schema(pool: &SqlitePool, table: &str, lease_table: &str) -> Result<(), sqlx::Error> {
        // Scalar state-machine columns are mirrored from the JSON content
        // document so eligibility and filter predicates run in SQL, while
        // reads round-trip the full entity through serde.
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                state INTEGER NOT NULL,
                state_count INTEGER NOT NULL DEFAULT 0 CHECK(state_count >= 0),
                state_timestamp INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                error_detail TEXT,
                content TEXT NOT NULL
            )
            "#
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {lease_table} (
                entity_id TEXT PRIMARY KEY,
                leased_by TEXT NOT NULL,
                leased_at INTEGER NOT NULL,
                lease_duration INTEGER NOT NULL
            )
            "#
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_eligible ON {table}(state, state_timestamp)"
        ))
        .execute(pool)
        .await?;

        Ok(())
    }

    /// True iff a non-expired lease exists on `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Fatal`] on persistence failure.
    pub async fn is_leased(&self, id: &str) -> StoreResult<bool> {
        let mut tx = self.begin("is_leased").await?;
        let leased = self
            .lease_ctx
            .is_leased(&mut tx, id, now_millis())
            .await
            .map_err(|e| PersistenceError::from_sqlx("is_leased", e))?;
        tx.commit().await.map_err(|e| PersistenceError::from_sqlx("is_leased", e))?;
        Ok(leased)
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn begin(&self, operation: &str) -> StoreResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| PersistenceError::from_sqlx(operation, e).into())
    }

    async fn commit(&self, operation: &str, tx: Transaction<'_, Sqlite>) -> StoreResult<()> {
        tx.commit()
            .await
            .map_err(|e| PersistenceError::from_sqlx(operation, e).into())
    }

    fn encode(operation: &str, entity: &E) -> StoreResult<String> {
        serde_json::to_string(entity).map_err(|e| {
            PersistenceError::permanent(operation, format!("Failed to serialize {}: {e}", E::KIND)).into()
        })
    }

    fn decode(operation: &str, content: &str) -> StoreResult<E> {
        // Deserialization failures are corruption, not contention: hard error.
        serde_json::from_str(content).map_err(|e| {
            PersistenceError::permanent(operation, format!("Failed to deserialize {} row: {e}", E::KIND)).into()
        })
    }

    async fn find_content_in_tx(
        &self,
        operation: &str,
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
    ) -> StoreResult<Option<E>> {
        let sql = format!("SELECT content FROM {} WHERE id = ?1", self.table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| PersistenceError::from_sqlx(operation, e))?;
        match row {
            Some(row) => {
                let content: String = row
                    .try_get("content")
                    .map_err(|e| PersistenceError::from_sqlx(operation, e))?;
                Ok(Some(Self::decode(operation, &content)?))
            }
            None => Ok(None),
        }
    }

    /// Map a canonical state-machine field to its mirrored column. Any other
    /// field path addresses the JSON content document.
    fn column_for(field: &str) -> Option<&'static str> {
        match field {
            "id" => Some("id"),
            "state" => Some("state"),
            "state_count" => Some("state_count"),
            "state_timestamp" => Some("state_timestamp"),
            "created_at" => Some("created_at"),
            "updated_at" => Some("updated_at"),
            "error_detail" => Some("error_detail"),
            _ => None,
        }
    }

    fn field_target(operation: &str, field: &str, qualifier: &str) -> StoreResult<String> {
        if let Some(column) = Self::column_for(field) {
            return Ok(format!("{qualifier}{column}"));
        }
        // Field paths are interpolated into json_extract, so restrict them to
        // a safe character set.
        let valid = !field.is_empty()
            && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(PersistenceError::permanent(
                operation,
                format!("Invalid criterion field path: {field:?}"),
            )
            .into());
        }
        Ok(format!("json_extract({qualifier}content, '$.{field}')"))
    }

    fn render_criteria(
        operation: &str,
        criteria: &[Criterion],
        qualifier: &str,
        sql: &mut String,
        binds: &mut Vec<Value>,
    ) -> StoreResult<()> {
        for criterion in criteria {
            sql.push_str(" AND ");
            let target = Self::field_target(operation, &criterion.field, qualifier)?;
            match criterion.operator {
                CriterionOperator::In => {
                    let Value::Array(candidates) = &criterion.value else {
                        return Err(PersistenceError::permanent(
                            operation,
                            format!("IN criterion on {:?} requires a list value", criterion.field),
                        )
                        .into());
                    };
                    let placeholders = vec!["?"; candidates.len().max(1)].join(", ");
                    sql.push_str(&format!("{target} IN ({placeholders})"));
                    if candidates.is_empty() {
                        // IN () is a syntax error; bind a null that matches nothing
                        binds.push(Value::Null);
                    } else {
                        binds.extend(candidates.iter().cloned());
                    }
                }
                op => {
                    sql.push_str(&format!("{target} {} ?", op.sql()));
                    binds.push(criterion.value.clone());
                }
            }
        }
        Ok(())
    }

    fn bind_values<'q>(
        mut query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        values: Vec<Value>,
    ) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        for value in values {
            query = match value {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(b),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        query.bind(i)
                    } else {
                        query.bind(n.as_f64().unwrap_or_default())
                    }
                }
                Value::String(s) => query.bind(s),
                other => query.bind(other.to_string()),
            };
        }
        query
    }

    async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity: &E,
        content: &str,
    ) -> StoreResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (id, state, state_count, state_timestamp, created_at, updated_at, error_detail, content)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            table = self.table
        );
        sqlx::query(&sql)
            .bind(entity.id())
            .bind(entity.state())
            .bind(entity.state_count() as i64)
            .bind(entity.state_timestamp())
            .bind(entity.created_at())
            .bind(entity.updated_at())
            .bind(entity.error_detail().map(str::to_string))
            .bind(content)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("UNIQUE constraint") || message.contains("PRIMARY KEY") {
                    StoreError::already_exists(format!("{} {} already exists", E::KIND, entity.id()))
                } else {
                    PersistenceError::from_sqlx("save", e).into()
                }
            })?;
        Ok(())
    }

    async fn update_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity: &E,
        content: &str,
    ) -> StoreResult<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET state = ?1, state_count = ?2, state_timestamp = ?3, updated_at = ?4, error_detail = ?5, content = ?6
            WHERE id = ?7
            "#,
            table = self.table
        );
        sqlx::query(&sql)
            .bind(entity.state())
            .bind(entity.state_count() as i64)
            .bind(entity.state_timestamp())
            .bind(entity.updated_at())
            .bind(entity.error_detail().map(str::to_string))
            .bind(content)
            .bind(entity.id())
            .execute(&mut **tx)
            .await
            .map_err(|e| PersistenceError::from_sqlx("save", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<E: StateEntity> StateEntityStore<E> for SqliteStateStore<E> {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>> {
        let sql = format!("SELECT content FROM {} WHERE id = ?1", self.table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistenceError::from_sqlx("find_by_id", e))?;
        match row {
            Some(row) => {
                let content: String = row
                    .try_get("content")
                    .map_err(|e| PersistenceError::from_sqlx("find_by_id", e))?;
                Ok(Some(Self::decode("find_by_id", &content)?))
            }
            None => Ok(None),
        }
    }

    async fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> StoreResult<Vec<E>> {
        let operation = "next_not_leased";
        let mut tx = self.begin(operation).await?;
        let now = now_millis();

        let mut sql = format!(
            r#"
            SELECT e.content AS content FROM {table} e
            LEFT JOIN {lease_table} l ON e.id = l.entity_id
            WHERE (l.entity_id IS NULL OR l.leased_at + l.lease_duration <= ?)
              AND e.state_timestamp <= ?
            "#,
            table = self.table,
            lease_table = self.lease_table
        );
        let mut binds = vec![Value::from(now), Value::from(now)];
        Self::render_criteria(operation, criteria, "e.", &mut sql, &mut binds)?;
        // Oldest-first approximates fair scheduling across workers
        sql.push_str(" ORDER BY e.state_timestamp ASC LIMIT ?");
        binds.push(Value::from(max as i64));

        let rows = Self::bind_values(sqlx::query(&sql), binds)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| PersistenceError::from_sqlx(operation, e))?;

        let mut selected = Vec::with_capacity(rows.len());
        for row in rows {
            let content: String = row
                .try_get("content")
                .map_err(|e| PersistenceError::from_sqlx(operation, e))?;
            let entity = Self::decode(operation, &content)?;
            let acquired = self
                .lease_ctx
                .acquire(&mut tx, entity.id(), &self.lease.holder, now)
                .await
                .map_err(|e| PersistenceError::from_sqlx(operation, e))?;
            if acquired {
                selected.push(entity);
            } else {
                // Selection and acquisition share one transaction, so a
                // conflict here means the lease row changed under us.
                warn!(
                    target: "dataplane_store::sqlite",
                    kind = E::KIND,
                    id = %entity.id(),
                    "skipping record: lease conflict within selection transaction"
                );
            }
        }

        self.commit(operation, tx).await?;
        debug!(
            target: "dataplane_store::sqlite",
            kind = E::KIND,
            holder = %self.lease.holder,
            count = selected.len(),
            "leased batch of eligible records"
        );
        Ok(selected)
    }

    async fn find_by_id_and_lease(&self, id: &str, holder: &str) -> StoreResult<E> {
        let operation = "find_by_id_and_lease";
        let mut tx = self.begin(operation).await?;

        let Some(entity) = self.find_content_in_tx(operation, &mut tx, id).await? else {
            tx.rollback().await.ok();
            return Err(StoreError::not_found(format!("{} {id} not found", E::KIND)));
        };

        let acquired = self
            .lease_ctx
            .acquire(&mut tx, id, holder, now_millis())
            .await
            .map_err(|e| PersistenceError::from_sqlx(operation, e))?;
        if !acquired {
            tx.rollback().await.ok();
            return Err(StoreError::already_leased(format!("{} {id} is already leased", E::KIND)));
        }

        self.commit(operation, tx).await?;
        debug!(target: "dataplane_store::sqlite", kind = E::KIND, id = %id, holder = %holder, "record leased");
        Ok(entity)
    }

    async fn save(&self, entity: &E) -> StoreResult<()> {
        let operation = "save";
        let mut saved = entity.clone();
        saved.touch(now_millis());
        let content = Self::encode(operation, &saved)?;

        let mut tx = self.begin(operation).await?;
        let exists_sql = format!("SELECT 1 FROM {} WHERE id = ?1", self.table);
        let exists = sqlx::query(&exists_sql)
            .bind(saved.id())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| PersistenceError::from_sqlx(operation, e))?
            .is_some();

        if exists {
            // Workers save after processing: release our own claim together
            // with the state change. Leases held by others are untouched.
            self.lease_ctx
                .break_lease(&mut tx, saved.id(), &self.lease.holder)
                .await
                .map_err(|e| PersistenceError::from_sqlx(operation, e))?;
            self.update_in_tx(&mut tx, &saved, &content).await?;
        } else {
            self.insert_in_tx(&mut tx, &saved, &content).await?;
        }

        self.commit(operation, tx).await?;
        debug!(
            target: "dataplane_store::sqlite",
            kind = E::KIND,
            id = %saved.id(),
            state = saved.state(),
            inserted = !exists,
            "record saved"
        );
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> StoreResult<E> {
        let operation = "delete_by_id";
        let mut tx = self.begin(operation).await?;

        let Some(entity) = self.find_content_in_tx(operation, &mut tx, id).await? else {
            tx.rollback().await.ok();
            return Err(StoreError::not_found(format!("{} {id} not found", E::KIND)));
        };

        let lease_sql = format!("DELETE FROM {} WHERE entity_id = ?1", self.lease_table);
        sqlx::query(&lease_sql)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| PersistenceError::from_sqlx(operation, e))?;
        let row_sql = format!("DELETE FROM {} WHERE id = ?1", self.table);
        sqlx::query(&row_sql)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| PersistenceError::from_sqlx(operation, e))?;

        self.commit(operation, tx).await?;
        debug!(target: "dataplane_store::sqlite", kind = E::KIND, id = %id, "record deleted");
        Ok(entity)
    }

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<E>> {
        let operation = "query";
        let mut sql = format!("SELECT content FROM {} WHERE 1=1", self.table);
        let mut binds = Vec::new();
        Self::render_criteria(operation, &spec.filter, "", &mut sql, &mut binds)?;

        // Deterministic ordering for a given snapshot even without a caller sort
        let order_target = match &spec.sort_field {
            Some(field) => Self::field_target(operation, field, "")?,
            None => "id".to_string(),
        };
        let direction = match spec.sort_order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        sql.push_str(&format!(" ORDER BY {order_target} {direction}"));

        if spec.limit.is_some() || spec.offset > 0 {
            // LIMIT -1 means unbounded; SQLite requires LIMIT before OFFSET
            sql.push_str(" LIMIT ? OFFSET ?");
            binds.push(Value::from(spec.limit.map(i64::from).unwrap_or(-1)));
            binds.push(Value::from(spec.offset as i64));
        }

        let rows = Self::bind_values(sqlx::query(&sql), binds)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PersistenceError::from_sqlx(operation, e))?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let content: String = row
                .try_get("content")
                .map_err(|e| PersistenceError::from_sqlx(operation, e))?;
            entities.push(Self::decode(operation, &content)?);
        }
        Ok(entities)
    }
}
