//! Postgres-backed entity store and lease coordinator.
//!
//! Entities live in one table per kind; leases live in a separate table keyed
//! by `(resource_id, resource_kind)`. Any number of connector instances may
//! share the tables; exclusivity comes from a conditional upsert on the lease
//! row, evaluated by the database.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `PersistenceError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | PersistenceError | Scenario |
//! |------------|----------------------|------------------|----------|
//! | Database (invalid text representation) | `22P02` | `InvalidQuery` | Criterion value cannot be cast to the column type |
//! | Database (undefined function/datatype mismatch) | `42883`, `42804` | `InvalidQuery` | Operator not applicable to the compared types |
//! | Database (other) | Any other | `Storage` | Constraint or server failure |
//! | PoolClosed / Io / Tls / other | N/A | `Storage` | Connection failures |
//!
//! ## Sync bridge
//!
//! `EntityStore` and `LeaseCoordinator` are synchronous. The async methods
//! are driven through a [`RuntimeBridge`] holding a tokio runtime handle; from
//! inside a multi-threaded runtime the call is wrapped in `block_in_place`.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{Span, debug, instrument, warn};

use dataspace_core::lease::duration_millis;
use dataspace_core::{
    Clock, Criterion, EntityStore, Lease, LeaseCoordinator, LeaseOutcome, OwnerId,
    PersistenceError, PersistenceResult, QuerySpec, StatefulEntity, StoreError, StoreResult,
};

use super::postgres_query::{push_criteria, push_order};
use super::{decode_document, encode_document};

/// Runs async store operations from synchronous callers.
#[derive(Debug, Clone)]
pub struct RuntimeBridge {
    handle: Handle,
}

impl RuntimeBridge {
    /// Capture the runtime the caller is currently running in.
    pub fn current() -> PersistenceResult<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|e| PersistenceError::storage("runtime_handle", e))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn block_on<F, R, E>(&self, future: F) -> Result<R, E>
    where
        F: Future<Output = Result<R, E>>,
        E: From<PersistenceError>,
    {
        match Handle::try_current().map(|h| h.runtime_flavor()) {
            Err(_) => self.handle.block_on(future),
            Ok(RuntimeFlavor::MultiThread) => {
                tokio::task::block_in_place(|| self.handle.block_on(future))
            }
            Ok(_) => Err(PersistenceError::storage(
                "block_on",
                "synchronous store call from a current-thread runtime; use a multi-threaded runtime or a plain thread",
            )
            .into()),
        }
    }
}

/// Table names used by the Postgres backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresTables {
    entity_table: String,
    lease_table: String,
}

impl PostgresTables {
    pub fn new(entity_table: impl Into<String>, lease_table: impl Into<String>) -> PersistenceResult<Self> {
        let entity_table = entity_table.into();
        let lease_table = lease_table.into();
        validate_identifier(&entity_table)?;
        validate_identifier(&lease_table)?;
        Ok(Self {
            entity_table,
            lease_table,
        })
    }

    /// `<kind>` and `<kind>_lease`, with `-` replaced by `_`.
    pub fn for_kind(resource_kind: &str) -> PersistenceResult<Self> {
        let base = resource_kind.replace('-', "_");
        Self::new(base.clone(), format!("{base}_lease"))
    }

    pub fn entity_table(&self) -> &str {
        &self.entity_table
    }

    pub fn lease_table(&self) -> &str {
        &self.lease_table
    }
}

fn validate_identifier(name: &str) -> PersistenceResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name.len() <= 63 {
        Ok(())
    } else {
        Err(PersistenceError::invalid_query(format!(
            "invalid table name '{name}'"
        )))
    }
}

/// Lease coordinator over a Postgres lease table.
#[derive(Clone)]
pub struct PostgresLeaseCoordinator {
    pool: Arc<PgPool>,
    lease_table: String,
    clock: Arc<dyn Clock>,
    bridge: RuntimeBridge,
}

impl core::fmt::Debug for PostgresLeaseCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresLeaseCoordinator")
            .field("lease_table", &self.lease_table)
            .finish_non_exhaustive()
    }
}

impl PostgresLeaseCoordinator {
    pub fn new(
        pool: PgPool,
        lease_table: impl Into<String>,
        clock: Arc<dyn Clock>,
        bridge: RuntimeBridge,
    ) -> PersistenceResult<Self> {
        Self::with_shared_pool(Arc::new(pool), lease_table.into(), clock, bridge)
    }

    fn with_shared_pool(
        pool: Arc<PgPool>,
        lease_table: String,
        clock: Arc<dyn Clock>,
        bridge: RuntimeBridge,
    ) -> PersistenceResult<Self> {
        validate_identifier(&lease_table)?;
        Ok(Self {
            pool,
            lease_table,
            clock,
            bridge,
        })
    }

    /// Create the lease table if it does not exist.
    pub async fn ensure_schema(&self) -> PersistenceResult<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                resource_id     TEXT   NOT NULL,
                resource_kind   TEXT   NOT NULL,
                leased_by       TEXT   NOT NULL,
                leased_at       BIGINT NOT NULL,
                lease_duration  BIGINT NOT NULL,
                PRIMARY KEY (resource_id, resource_kind)
            )
            "#,
            table = self.lease_table
        );
        sqlx::query(&sql)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_lease_table", e))?;
        Ok(())
    }

    /// Claim or renew a lease with a single conditional upsert.
    ///
    /// The conflict branch only overwrites the row when it is held by the same
    /// owner or already expired; otherwise the current holder is returned.
    #[instrument(
        skip(self, duration),
        fields(lease_table = %self.lease_table, acquired = tracing::field::Empty),
        err
    )]
    pub async fn acquire_lease(
        &self,
        resource_id: &str,
        resource_kind: &str,
        owner: &str,
        duration: Duration,
    ) -> PersistenceResult<LeaseOutcome> {
        let now = self.clock.now_millis();
        let sql = format!(
            r#"
            WITH claim AS (
                INSERT INTO {t} (resource_id, resource_kind, leased_by, leased_at, lease_duration)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (resource_id, resource_kind) DO UPDATE SET
                    leased_by = EXCLUDED.leased_by,
                    leased_at = EXCLUDED.leased_at,
                    lease_duration = EXCLUDED.lease_duration
                WHERE {t}.leased_by = EXCLUDED.leased_by
                   OR {t}.leased_at < EXCLUDED.leased_at - {t}.lease_duration
                RETURNING resource_id, resource_kind, leased_by, leased_at, lease_duration
            )
            SELECT resource_id, resource_kind, leased_by, leased_at, lease_duration, TRUE AS acquired
            FROM claim
            UNION ALL
            SELECT resource_id, resource_kind, leased_by, leased_at, lease_duration, FALSE AS acquired
            FROM {t}
            WHERE resource_id = $1 AND resource_kind = $2
              AND NOT EXISTS (SELECT 1 FROM claim)
            "#,
            t = self.lease_table
        );

        let row = sqlx::query(&sql)
            .bind(resource_id)
            .bind(resource_kind)
            .bind(owner)
            .bind(now)
            .bind(duration_millis(duration))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("acquire_lease", e))?;

        let span = Span::current();
        let Some(row) = row else {
            // The blocking row was committed after this statement's snapshot.
            warn!(resource_id, resource_kind, owner, "lease holder not visible after conflict");
            span.record("acquired", false);
            return Ok(LeaseOutcome::Conflict {
                leased_by: String::new(),
                expires_at: now,
            });
        };

        let acquired: bool = row
            .try_get("acquired")
            .map_err(|e| map_sqlx_error("acquire_lease", e))?;
        let lease: Lease = LeaseRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode_lease", e))?
            .into();
        span.record("acquired", acquired);

        if acquired {
            Ok(LeaseOutcome::Acquired(lease))
        } else {
            debug!(resource_id, resource_kind, owner, leased_by = %lease.leased_by, "lease conflict");
            Ok(LeaseOutcome::Conflict {
                expires_at: lease.expires_at(),
                leased_by: lease.leased_by,
            })
        }
    }

    #[instrument(skip(self), fields(lease_table = %self.lease_table), err)]
    pub async fn release_lease(
        &self,
        resource_id: &str,
        resource_kind: &str,
        owner: &str,
    ) -> PersistenceResult<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE resource_id = $1 AND resource_kind = $2 AND leased_by = $3",
            self.lease_table
        );
        let result = sqlx::query(&sql)
            .bind(resource_id)
            .bind(resource_kind)
            .bind(owner)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_lease", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(lease_table = %self.lease_table), err)]
    pub async fn find_lease(&self, resource_id: &str, resource_kind: &str) -> PersistenceResult<Option<Lease>> {
        let sql = format!(
            r#"
            SELECT resource_id, resource_kind, leased_by, leased_at, lease_duration
            FROM {}
            WHERE resource_id = $1 AND resource_kind = $2
            "#,
            self.lease_table
        );
        let row = sqlx::query(&sql)
            .bind(resource_id)
            .bind(resource_kind)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_lease", e))?;

        row.map(|row| {
            LeaseRow::from_row(&row)
                .map(Lease::from)
                .map_err(|e| map_sqlx_error("decode_lease", e))
        })
        .transpose()
    }
}

impl LeaseCoordinator for PostgresLeaseCoordinator {
    fn acquire(
        &self,
        resource_id: &str,
        resource_kind: &str,
        owner: &str,
        duration: Duration,
    ) -> PersistenceResult<LeaseOutcome> {
        self.bridge
            .block_on(self.acquire_lease(resource_id, resource_kind, owner, duration))
    }

    fn release(&self, resource_id: &str, resource_kind: &str, owner: &str) -> PersistenceResult<bool> {
        self.bridge
            .block_on(self.release_lease(resource_id, resource_kind, owner))
    }

    fn find(&self, resource_id: &str, resource_kind: &str) -> PersistenceResult<Option<Lease>> {
        self.bridge.block_on(self.find_lease(resource_id, resource_kind))
    }
}

/// Postgres [`EntityStore`] bound to one lease owner.
pub struct PostgresEntityStore<T> {
    pool: Arc<PgPool>,
    tables: PostgresTables,
    leases: PostgresLeaseCoordinator,
    owner: OwnerId,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
    bridge: RuntimeBridge,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for PostgresEntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            tables: self.tables.clone(),
            leases: self.leases.clone(),
            owner: self.owner.clone(),
            lease_duration: self.lease_duration,
            clock: self.clock.clone(),
            bridge: self.bridge.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> core::fmt::Debug for PostgresEntityStore<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresEntityStore")
            .field("tables", &self.tables)
            .field("owner", &self.owner)
            .field("lease_duration", &self.lease_duration)
            .finish_non_exhaustive()
    }
}

impl<T: StatefulEntity> PostgresEntityStore<T> {
    pub fn new(
        pool: PgPool,
        tables: PostgresTables,
        owner: impl Into<OwnerId>,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
        bridge: RuntimeBridge,
    ) -> PersistenceResult<Self> {
        let pool = Arc::new(pool);
        let leases = PostgresLeaseCoordinator::with_shared_pool(
            pool.clone(),
            tables.lease_table.clone(),
            clock.clone(),
            bridge.clone(),
        )?;
        Ok(Self {
            pool,
            tables,
            leases,
            owner: owner.into(),
            lease_duration,
            clock,
            bridge,
            _entity: PhantomData,
        })
    }

    /// A handle over the same tables that leases as `owner`.
    pub fn for_owner(&self, owner: impl Into<OwnerId>) -> Self {
        Self {
            owner: owner.into(),
            ..self.clone()
        }
    }

    pub fn lease_coordinator(&self) -> &PostgresLeaseCoordinator {
        &self.leases
    }

    /// Create the entity and lease tables if they do not exist.
    pub async fn ensure_schema(&self) -> PersistenceResult<()> {
        let table = &self.tables.entity_table;
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id               TEXT    PRIMARY KEY,
                state            INTEGER NOT NULL,
                state_count      INTEGER NOT NULL,
                state_timestamp  BIGINT  NOT NULL,
                created_at       BIGINT  NOT NULL,
                updated_at       BIGINT  NOT NULL,
                trace_context    JSONB   NOT NULL DEFAULT '{{}}'::jsonb,
                error_detail     TEXT    NULL,
                document         JSONB   NOT NULL
            )
            "#
        );
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_state_idx ON {table} (state, state_timestamp, id)"
        );
        for (operation, sql) in [("create_entity_table", create), ("create_state_index", index)] {
            sqlx::query(&sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
        }
        self.leases.ensure_schema().await
    }

    #[instrument(
        skip(self, entity),
        fields(
            entity_id = %entity.id(),
            resource_kind = T::RESOURCE_KIND,
            owner = %self.owner
        ),
        err
    )]
    pub async fn save_entity(&self, entity: &T) -> StoreResult<()> {
        let document = encode_document(entity)?;
        let state = entity.entity_state();
        let trace_context = serde_json::to_value(&state.trace_context)
            .map_err(|e| PersistenceError::malformed(&state.id, e))?;
        let now = self.clock.now_millis();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(lease) = lock_lease(&mut tx, &self.tables.lease_table, &state.id, T::RESOURCE_KIND).await? {
            if !lease.is_claimable_by(self.owner.as_str(), now) {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::already_leased(state.id.clone(), lease.leased_by));
            }
        }

        let upsert = format!(
            r#"
            INSERT INTO {} (
                id,
                state,
                state_count,
                state_timestamp,
                created_at,
                updated_at,
                trace_context,
                error_detail,
                document
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                state_count = EXCLUDED.state_count,
                state_timestamp = EXCLUDED.state_timestamp,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                trace_context = EXCLUDED.trace_context,
                error_detail = EXCLUDED.error_detail,
                document = EXCLUDED.document
            "#,
            self.tables.entity_table
        );
        sqlx::query(&upsert)
            .bind(state.id.as_str())
            .bind(state.state)
            .bind(i32::try_from(state.state_count).unwrap_or(i32::MAX))
            .bind(state.state_timestamp)
            .bind(state.created_at)
            .bind(state.updated_at)
            .bind(&trace_context)
            .bind(state.error_detail.clone())
            .bind(&document)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_entity", e))?;

        let release = format!(
            "DELETE FROM {} WHERE resource_id = $1 AND resource_kind = $2 AND leased_by = $3",
            self.tables.lease_table
        );
        sqlx::query(&release)
            .bind(state.id.as_str())
            .bind(T::RESOURCE_KIND)
            .bind(self.owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("release_lease", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(resource_kind = T::RESOURCE_KIND), err)]
    pub async fn find_entity(&self, id: &str) -> PersistenceResult<Option<T>> {
        let sql = format!("SELECT id, document FROM {} WHERE id = $1", self.tables.entity_table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_entity", e))?;
        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(
        skip(self, query),
        fields(
            resource_kind = T::RESOURCE_KIND,
            criteria = query.filter.len(),
            result_count = tracing::field::Empty
        ),
        err
    )]
    pub async fn find_all_entities(&self, query: &QuerySpec) -> PersistenceResult<Vec<T>> {
        query.validate()?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT e.id, e.document FROM {} e WHERE TRUE",
            self.tables.entity_table
        ));
        push_criteria(&mut qb, &query.filter, "e");
        push_order(&mut qb, query.sort_field.as_deref(), query.sort_order, "e");
        qb.push(" LIMIT ")
            .push_bind(to_sql_count(query.limit))
            .push(" OFFSET ")
            .push_bind(to_sql_count(query.offset));

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_all", e))?;

        let entities = rows.iter().map(decode_row).collect::<PersistenceResult<Vec<T>>>()?;
        Span::current().record("result_count", entities.len());
        Ok(entities)
    }

    #[instrument(
        skip(self),
        fields(resource_kind = T::RESOURCE_KIND, owner = %self.owner),
        err
    )]
    pub async fn delete_entity(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let exists = format!("SELECT 1 FROM {} WHERE id = $1 FOR UPDATE", self.tables.entity_table);
        let found = sqlx::query(&exists)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_entity", e))?;
        if found.is_none() {
            // Clear a leftover lease unless another owner still holds it.
            let stale = format!(
                r#"
                DELETE FROM {}
                WHERE resource_id = $1 AND resource_kind = $2
                  AND (leased_by = $3 OR leased_at < $4 - lease_duration)
                "#,
                self.tables.lease_table
            );
            sqlx::query(&stale)
                .bind(id)
                .bind(T::RESOURCE_KIND)
                .bind(self.owner.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_stale_lease", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(());
        }

        if let Some(lease) = lock_lease(&mut tx, &self.tables.lease_table, id, T::RESOURCE_KIND).await? {
            if !lease.is_claimable_by(self.owner.as_str(), now) {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::already_leased(id, lease.leased_by));
            }
        }

        let delete_entity = format!("DELETE FROM {} WHERE id = $1", self.tables.entity_table);
        sqlx::query(&delete_entity)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_entity", e))?;

        let delete_lease = format!(
            "DELETE FROM {} WHERE resource_id = $1 AND resource_kind = $2",
            self.tables.lease_table
        );
        sqlx::query(&delete_lease)
            .bind(id)
            .bind(T::RESOURCE_KIND)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_lease", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, criteria),
        fields(
            resource_kind = T::RESOURCE_KIND,
            owner = %self.owner,
            claimed = tracing::field::Empty
        ),
        err
    )]
    pub async fn next_not_leased_entities(&self, max: usize, criteria: &[Criterion]) -> PersistenceResult<Vec<T>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        criteria.iter().try_for_each(Criterion::validate)?;
        let now = self.clock.now_millis();

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT e.id, e.document FROM {} e LEFT JOIN {} l ON l.resource_id = e.id AND l.resource_kind = ",
            self.tables.entity_table, self.tables.lease_table
        ));
        qb.push_bind(T::RESOURCE_KIND)
            .push(" WHERE (l.resource_id IS NULL OR l.leased_at < ")
            .push_bind(now)
            .push(" - l.lease_duration)");
        push_criteria(&mut qb, criteria, "e");
        qb.push(" ORDER BY e.state_timestamp ASC, e.id ASC LIMIT ")
            .push_bind(to_sql_count(max));

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("select_candidates", e))?;
        let candidates = rows.iter().map(decode_row).collect::<PersistenceResult<Vec<T>>>()?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for entity in candidates {
            match self
                .leases
                .acquire_lease(entity.id(), T::RESOURCE_KIND, self.owner.as_str(), self.lease_duration)
                .await?
            {
                LeaseOutcome::Acquired(_) => claimed.push(entity),
                LeaseOutcome::Conflict { leased_by, .. } => {
                    debug!(entity_id = entity.id(), leased_by = %leased_by, "lost lease race, skipping entity");
                }
            }
        }

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(
        skip(self),
        fields(resource_kind = T::RESOURCE_KIND, owner = %self.owner),
        err
    )]
    pub async fn find_by_id_and_lease_entity(&self, id: &str) -> StoreResult<T> {
        if self.find_entity(id).await?.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }

        match self
            .leases
            .acquire_lease(id, T::RESOURCE_KIND, self.owner.as_str(), self.lease_duration)
            .await?
        {
            LeaseOutcome::Acquired(_) => {}
            LeaseOutcome::Conflict { leased_by, .. } => {
                return Err(StoreError::already_leased(id, leased_by));
            }
        }

        // Re-read under the lease; the entity may have been deleted in between.
        match self.find_entity(id).await? {
            Some(entity) => Ok(entity),
            None => {
                self.leases
                    .release_lease(id, T::RESOURCE_KIND, self.owner.as_str())
                    .await?;
                Err(StoreError::NotFound(id.to_string()))
            }
        }
    }
}

impl<T: StatefulEntity> EntityStore<T> for PostgresEntityStore<T> {
    fn save(&self, entity: &T) -> StoreResult<()> {
        self.bridge.block_on(self.save_entity(entity))
    }

    fn find(&self, id: &str) -> PersistenceResult<Option<T>> {
        self.bridge.block_on(self.find_entity(id))
    }

    fn find_all(&self, query: &QuerySpec) -> PersistenceResult<Vec<T>> {
        self.bridge.block_on(self.find_all_entities(query))
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        self.bridge.block_on(self.delete_entity(id))
    }

    fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> PersistenceResult<Vec<T>> {
        self.bridge.block_on(self.next_not_leased_entities(max, criteria))
    }

    fn find_by_id_and_lease(&self, id: &str) -> StoreResult<T> {
        self.bridge.block_on(self.find_by_id_and_lease_entity(id))
    }
}

/// Read and row-lock the lease for an entity inside a transaction.
async fn lock_lease(
    tx: &mut Transaction<'_, Postgres>,
    lease_table: &str,
    resource_id: &str,
    resource_kind: &str,
) -> PersistenceResult<Option<Lease>> {
    let sql = format!(
        r#"
        SELECT resource_id, resource_kind, leased_by, leased_at, lease_duration
        FROM {lease_table}
        WHERE resource_id = $1 AND resource_kind = $2
        FOR UPDATE
        "#
    );
    let row = sqlx::query(&sql)
        .bind(resource_id)
        .bind(resource_kind)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_lease", e))?;

    row.map(|row| {
        LeaseRow::from_row(&row)
            .map(Lease::from)
            .map_err(|e| map_sqlx_error("decode_lease", e))
    })
    .transpose()
}

fn decode_row<T: StatefulEntity>(row: &sqlx::postgres::PgRow) -> PersistenceResult<T> {
    let id: String = row
        .try_get("id")
        .map_err(|e| map_sqlx_error("decode_entity", e))?;
    let document: serde_json::Value = row
        .try_get("document")
        .map_err(|e| PersistenceError::malformed(&id, e))?;
    decode_document(&id, document)
}

fn to_sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Map SQLx errors to PersistenceError.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> PersistenceError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(code) = db_err.code() {
            match code.as_ref() {
                // Invalid text representation / undefined function / datatype mismatch
                "22P02" | "42883" | "42804" => {
                    return PersistenceError::invalid_query(format!(
                        "database rejected query in {}: {}",
                        operation,
                        db_err.message()
                    ));
                }
                _ => {}
            }
        }
    }
    PersistenceError::storage(operation, err)
}

#[derive(Debug)]
struct LeaseRow {
    resource_id: String,
    resource_kind: String,
    leased_by: String,
    leased_at: i64,
    lease_duration: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LeaseRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(LeaseRow {
            resource_id: row.try_get("resource_id")?,
            resource_kind: row.try_get("resource_kind")?,
            leased_by: row.try_get("leased_by")?,
            leased_at: row.try_get("leased_at")?,
            lease_duration: row.try_get("lease_duration")?,
        })
    }
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Lease {
            resource_id: row.resource_id,
            resource_kind: row.resource_kind,
            leased_by: row.leased_by,
            leased_at: row.leased_at,
            lease_duration: row.lease_duration,
        }
    }
}
