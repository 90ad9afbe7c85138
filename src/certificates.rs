//! Certificate store collaborator
//!
//! Certificate attachment runs on the caller's transaction connection: the
//! `PENDING_CERTIFICATE -> PENDING_RELEASE` transition is only permitted
//! once the attach has succeeded, and putting both in one transaction means
//! a failed attach rolls the status change back with it.

use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::GaugeResult;

#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Attach a calibration certificate reference to a gauge. Must succeed
    /// before the gauge may advance out of `PENDING_CERTIFICATE`.
    async fn attach(
        &self,
        conn: &mut PgConnection,
        gauge_key: Uuid,
        file_ref: &str,
        actor: &str,
    ) -> GaugeResult<Uuid>;

    async fn has_certificate(
        &self,
        conn: &mut PgConnection,
        gauge_key: Uuid,
    ) -> GaugeResult<bool>;
}

#[derive(Default, Clone)]
pub struct PgCertificateStore;

impl PgCertificateStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CertificateStore for PgCertificateStore {
    async fn attach(
        &self,
        conn: &mut PgConnection,
        gauge_key: Uuid,
        file_ref: &str,
        actor: &str,
    ) -> GaugeResult<Uuid> {
        let certificate_id: Uuid = sqlx::query_scalar(
            "INSERT INTO gauge.certificates (gauge_key, file_ref, uploaded_by) \
             VALUES ($1, $2, $3) \
             RETURNING certificate_id",
        )
        .bind(gauge_key)
        .bind(file_ref)
        .bind(actor)
        .fetch_one(&mut *conn)
        .await?;

        Ok(certificate_id)
    }

    async fn has_certificate(
        &self,
        conn: &mut PgConnection,
        gauge_key: Uuid,
    ) -> GaugeResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM gauge.certificates WHERE gauge_key = $1")
                .bind(gauge_key)
                .fetch_one(&mut *conn)
                .await?;
        Ok(count > 0)
    }
}
