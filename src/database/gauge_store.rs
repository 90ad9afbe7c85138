//! Gauge store: the persistence abstraction over gauge rows
//!
//! Mutating and transaction-scoped reads take `&mut PgConnection` so they
//! compose inside lock-coordinator transactions; every mutation in this
//! subsystem happens on a connection that already holds the relevant row
//! locks. Pool-based lookups exist only for read paths (CLI, facade reads)
//! that never feed a mutation.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{GaugeError, GaugeResult};
use crate::models::gauge::{Gauge, GaugeCategory, GaugeStatus, NewGauge, SharedAttributes};
use crate::pairing::set_code::format_set_code;

/// Column list shared by every query that maps onto [`Gauge::from_row`].
pub(crate) const GAUGE_COLUMNS: &str = "internal_key, serial_number, category, thread_size, \
     thread_class, set_code, member_suffix, companion_key, status, storage_location, \
     created_at, updated_at";

#[derive(Clone)]
pub struct GaugeStore {
    pool: PgPool,
}

impl GaugeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Transaction-scoped reads
    // ------------------------------------------------------------------

    pub async fn find_by_serial(
        &self,
        conn: &mut PgConnection,
        category: GaugeCategory,
        serial: &str,
    ) -> GaugeResult<Option<Gauge>> {
        let row = sqlx::query(&format!(
            "SELECT {GAUGE_COLUMNS} FROM gauge.gauges WHERE category = $1 AND serial_number = $2"
        ))
        .bind(category.as_db_str())
        .bind(serial)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(Gauge::from_row).transpose()
    }

    pub async fn find_by_key(
        &self,
        conn: &mut PgConnection,
        key: Uuid,
    ) -> GaugeResult<Option<Gauge>> {
        let row = sqlx::query(&format!(
            "SELECT {GAUGE_COLUMNS} FROM gauge.gauges WHERE internal_key = $1"
        ))
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(Gauge::from_row).transpose()
    }

    /// Serial lookup across all categories, for callers that supply a bare
    /// identifier without naming the category. May match more than one row.
    pub async fn find_by_serial_any_category(
        &self,
        conn: &mut PgConnection,
        serial: &str,
    ) -> GaugeResult<Vec<Gauge>> {
        let rows = sqlx::query(&format!(
            "SELECT {GAUGE_COLUMNS} FROM gauge.gauges WHERE serial_number = $1 ORDER BY category"
        ))
        .bind(serial)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(Gauge::from_row).collect()
    }

    pub async fn find_by_set_member(
        &self,
        conn: &mut PgConnection,
        set_code: &str,
        suffix: char,
    ) -> GaugeResult<Option<Gauge>> {
        let row = sqlx::query(&format!(
            "SELECT {GAUGE_COLUMNS} FROM gauge.gauges WHERE set_code = $1 AND member_suffix = $2"
        ))
        .bind(set_code)
        .bind(suffix.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(Gauge::from_row).transpose()
    }

    /// All members currently holding a set code, ordered by suffix.
    /// The caller decides what a count other than two means.
    pub async fn members_of_set(
        &self,
        conn: &mut PgConnection,
        set_code: &str,
    ) -> GaugeResult<Vec<Gauge>> {
        let rows = sqlx::query(&format!(
            "SELECT {GAUGE_COLUMNS} FROM gauge.gauges WHERE set_code = $1 ORDER BY member_suffix"
        ))
        .bind(set_code)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(Gauge::from_row).collect()
    }

    /// Locking read over exactly the supplied keys. Only the lock
    /// coordinator calls this; keys must already be sorted ascending.
    pub(crate) async fn fetch_by_keys_for_update(
        &self,
        conn: &mut PgConnection,
        sorted_keys: &[Uuid],
    ) -> GaugeResult<Vec<Gauge>> {
        let rows = sqlx::query(&format!(
            "SELECT {GAUGE_COLUMNS} FROM gauge.gauges \
             WHERE internal_key = ANY($1) ORDER BY internal_key FOR UPDATE"
        ))
        .bind(sorted_keys.to_vec())
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(Gauge::from_row).collect()
    }

    // ------------------------------------------------------------------
    // Mutations (always on a locked transaction connection)
    // ------------------------------------------------------------------

    pub async fn insert_spare(
        &self,
        conn: &mut PgConnection,
        new_gauge: &NewGauge,
    ) -> GaugeResult<Gauge> {
        let row = sqlx::query(&format!(
            "INSERT INTO gauge.gauges \
                 (serial_number, category, thread_size, thread_class, status, storage_location) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {GAUGE_COLUMNS}"
        ))
        .bind(&new_gauge.serial_number)
        .bind(new_gauge.spec.category.as_db_str())
        .bind(&new_gauge.spec.thread_size)
        .bind(&new_gauge.spec.thread_class)
        .bind(GaugeStatus::AvailableForUse.as_db_str())
        .bind(&new_gauge.storage_location)
        .fetch_one(&mut *conn)
        .await?;

        Gauge::from_row(&row)
    }

    /// Write one side of a pairing: set code, suffix, companion pointer, and
    /// the shared attributes both members adopt. The engine always calls
    /// this for both sides inside the same transaction.
    pub async fn apply_pairing(
        &self,
        conn: &mut PgConnection,
        key: Uuid,
        set_code: &str,
        suffix: char,
        companion_key: Uuid,
        attrs: &SharedAttributes,
    ) -> GaugeResult<Gauge> {
        let row = sqlx::query(&format!(
            "UPDATE gauge.gauges \
             SET set_code = $2, member_suffix = $3, companion_key = $4, \
                 storage_location = COALESCE($5, storage_location), updated_at = now() \
             WHERE internal_key = $1 \
             RETURNING {GAUGE_COLUMNS}"
        ))
        .bind(key)
        .bind(set_code)
        .bind(suffix.to_string())
        .bind(companion_key)
        .bind(&attrs.storage_location)
        .fetch_one(&mut *conn)
        .await?;

        Gauge::from_row(&row)
    }

    /// Revert a gauge to spare: clears set code, suffix, and companion
    /// pointer together (the half-pair CHECK constraint would reject
    /// anything less).
    pub async fn clear_pairing(&self, conn: &mut PgConnection, key: Uuid) -> GaugeResult<Gauge> {
        let row = sqlx::query(&format!(
            "UPDATE gauge.gauges \
             SET set_code = NULL, member_suffix = NULL, companion_key = NULL, updated_at = now() \
             WHERE internal_key = $1 \
             RETURNING {GAUGE_COLUMNS}"
        ))
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;

        Gauge::from_row(&row)
    }

    /// Repoint a member's companion reference, used by replace-in-set for
    /// the untouched companion.
    pub async fn set_companion(
        &self,
        conn: &mut PgConnection,
        key: Uuid,
        companion_key: Uuid,
    ) -> GaugeResult<Gauge> {
        let row = sqlx::query(&format!(
            "UPDATE gauge.gauges SET companion_key = $2, updated_at = now() \
             WHERE internal_key = $1 RETURNING {GAUGE_COLUMNS}"
        ))
        .bind(key)
        .bind(companion_key)
        .fetch_one(&mut *conn)
        .await?;

        Gauge::from_row(&row)
    }

    pub async fn set_status(
        &self,
        conn: &mut PgConnection,
        keys: &[Uuid],
        status: GaugeStatus,
    ) -> GaugeResult<()> {
        let updated = sqlx::query(
            "UPDATE gauge.gauges SET status = $2, updated_at = now() WHERE internal_key = ANY($1)",
        )
        .bind(keys.to_vec())
        .bind(status.as_db_str())
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_rows(updated, keys.len())
    }

    pub async fn set_status_and_location(
        &self,
        conn: &mut PgConnection,
        keys: &[Uuid],
        status: GaugeStatus,
        location: &str,
    ) -> GaugeResult<()> {
        let updated = sqlx::query(
            "UPDATE gauge.gauges \
             SET status = $2, storage_location = $3, updated_at = now() \
             WHERE internal_key = ANY($1)",
        )
        .bind(keys.to_vec())
        .bind(status.as_db_str())
        .bind(location)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_rows(updated, keys.len())
    }

    /// Allocate the next globally unique set code from the sequence.
    pub async fn next_set_code(&self, conn: &mut PgConnection) -> GaugeResult<String> {
        let value: i64 = sqlx::query_scalar("SELECT nextval('gauge.set_code_seq')")
            .fetch_one(&mut *conn)
            .await?;
        Ok(format_set_code(value))
    }

    // ------------------------------------------------------------------
    // Pool-based read paths (never feed a mutation)
    // ------------------------------------------------------------------

    pub async fn get_by_key(&self, key: Uuid) -> GaugeResult<Option<Gauge>> {
        let row = sqlx::query(&format!(
            "SELECT {GAUGE_COLUMNS} FROM gauge.gauges WHERE internal_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Gauge::from_row).transpose()
    }

    pub async fn get_set_members(&self, set_code: &str) -> GaugeResult<Vec<Gauge>> {
        let mut conn = self.pool.acquire().await?;
        self.members_of_set(&mut conn, set_code).await
    }
}

fn expect_rows(updated: u64, expected: usize) -> GaugeResult<()> {
    if updated == expected as u64 {
        Ok(())
    } else {
        Err(GaugeError::Validation {
            message: format!("status update touched {updated} rows, expected {expected}"),
        })
    }
}
