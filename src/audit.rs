//! Audit sink: immutable record of every successful mutation
//!
//! Delivery is a best-effort side channel. The core mutation is successful
//! once its transaction commits; a failing sink is logged and swallowed,
//! never rolled back into the caller's outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

/// One committed mutation, as delivered to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub action: String,
    pub actor: String,
    pub set_code: Option<String>,
    pub gauge_keys: Vec<Uuid>,
    pub detail: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &str, actor: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            action: action.to_string(),
            actor: actor.to_string(),
            set_code: None,
            gauge_keys: Vec::new(),
            detail: serde_json::json!({}),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_set_code(mut self, set_code: &str) -> Self {
        self.set_code = Some(set_code.to_string());
        self
    }

    pub fn with_gauges(mut self, keys: &[Uuid]) -> Self {
        self.gauge_keys = keys.to_vec();
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Receives mutation records after commit. Never vetoes.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Production sink writing to `gauge.audit_log` on its own pool, outside
/// the mutating transaction.
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: AuditEvent) {
        let result = sqlx::query(
            "INSERT INTO gauge.audit_log \
                 (event_id, action, actor, set_code, gauge_keys, detail, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.event_id)
        .bind(&event.action)
        .bind(&event.actor)
        .bind(&event.set_code)
        .bind(&event.gauge_keys)
        .bind(&event.detail)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(
                action = %event.action,
                event_id = %event.event_id,
                error = %err,
                "audit delivery failed; mutation outcome unaffected"
            );
        }
    }
}

/// Sink that drops everything; used in tests and offline tooling.
#[derive(Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: AuditEvent) {}
}
