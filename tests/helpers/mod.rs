//! Shared fixtures for the database-backed integration tests.
//!
//! These tests need a live Postgres with `migrations/gauge_schema.sql`
//! applied. They look for `TEST_DATABASE_URL`, falling back to
//! `DATABASE_URL`, and pass vacuously when neither is set so the unit
//! suite stays runnable offline. Every test works under its own unique
//! serial prefix and cleans its rows up explicitly.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use gauge_track::{
    AuditEvent, AuditSink, Gauge, GaugeSpec, GaugeTrackService, LockConfig, NewGauge,
    PgCertificateStore,
};

pub const ACTOR: &str = "integration-test";

pub async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()?;
    match PgPool::connect(&url).await {
        Ok(pool) => Some(pool),
        Err(err) => {
            eprintln!("skipping: could not connect to test database: {err}");
            None
        }
    }
}

pub fn test_service(pool: &PgPool) -> GaugeTrackService {
    GaugeTrackService::without_audit(pool.clone(), LockConfig::default())
}

/// Audit sink that keeps delivered events in memory for assertions.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn audited_service(pool: &PgPool, sink: Arc<RecordingAuditSink>) -> GaugeTrackService {
    GaugeTrackService::with_collaborators(
        pool.clone(),
        LockConfig::default(),
        sink,
        Arc::new(PgCertificateStore::new()),
    )
}

/// Unique serial prefix so concurrent test runs never collide on the
/// per-category serial uniqueness constraint.
pub fn unique_prefix() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("T{}", &id[..8].to_uppercase())
}

pub async fn register_thread_spare(
    service: &GaugeTrackService,
    serial: &str,
) -> Result<Gauge> {
    let gauge = service
        .register_spare(
            NewGauge {
                serial_number: serial.to_string(),
                spec: GaugeSpec::thread("1/4-20", "2A"),
                storage_location: Some("A1".to_string()),
            },
            ACTOR,
        )
        .await?;
    Ok(gauge)
}

/// Remove every row created under the given serial prefix.
pub async fn cleanup(pool: &PgPool, prefix: &str) -> Result<()> {
    let pattern = format!("{prefix}%");

    sqlx::query(
        "DELETE FROM gauge.certificates \
         WHERE gauge_key IN \
             (SELECT internal_key FROM gauge.gauges WHERE serial_number LIKE $1)",
    )
    .bind(&pattern)
    .execute(pool)
    .await?;

    // break companion pointers before deleting the rows they target
    sqlx::query(
        "UPDATE gauge.gauges \
         SET set_code = NULL, member_suffix = NULL, companion_key = NULL \
         WHERE serial_number LIKE $1",
    )
    .bind(&pattern)
    .execute(pool)
    .await?;

    sqlx::query("DELETE FROM gauge.gauges WHERE serial_number LIKE $1")
        .bind(&pattern)
        .execute(pool)
        .await?;

    Ok(())
}
