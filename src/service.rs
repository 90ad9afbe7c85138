//! Service facade: the fixed external contract over the core engine
//!
//! This is the seam the HTTP/CLI layer calls. It wires the pool, store,
//! resolver, lock coordinator, pairing engine, calibration workflow, and
//! the audit/certificate collaborators together, and otherwise delegates;
//! no correctness logic lives here.

use std::sync::Arc;

use sqlx::PgPool;

use crate::audit::{AuditSink, NoopAuditSink, PgAuditSink};
use crate::calibration::workflow::{
    CalibrationSendResult, CalibrationWorkflow, CertificateAttached, SetReleased, StatusChange,
};
use crate::certificates::{CertificateStore, PgCertificateStore};
use crate::database::gauge_store::GaugeStore;
use crate::database::identity_resolver::IdentityResolver;
use crate::database::lock_coordinator::{LockConfig, LockCoordinator};
use crate::error::GaugeResult;
use crate::models::gauge::{Gauge, NewGauge};
use crate::pairing::engine::{
    CompanionPairingEngine, CreateSetRequest, ReplaceRequest, SetCreated, SetMembersReplaced,
    SetUnpaired, UnpairRequest,
};

pub struct GaugeTrackService {
    store: GaugeStore,
    engine: CompanionPairingEngine,
    workflow: CalibrationWorkflow,
}

impl GaugeTrackService {
    /// Production wiring: Postgres-backed audit sink and certificate store.
    pub fn new(pool: PgPool, lock_config: LockConfig) -> Self {
        let audit: Arc<dyn AuditSink> = Arc::new(PgAuditSink::new(pool.clone()));
        let certificates: Arc<dyn CertificateStore> = Arc::new(PgCertificateStore::new());
        Self::with_collaborators(pool, lock_config, audit, certificates)
    }

    /// Wiring with a silent audit sink, for tests and offline tooling.
    pub fn without_audit(pool: PgPool, lock_config: LockConfig) -> Self {
        let audit: Arc<dyn AuditSink> = Arc::new(NoopAuditSink);
        let certificates: Arc<dyn CertificateStore> = Arc::new(PgCertificateStore::new());
        Self::with_collaborators(pool, lock_config, audit, certificates)
    }

    pub fn with_collaborators(
        pool: PgPool,
        lock_config: LockConfig,
        audit: Arc<dyn AuditSink>,
        certificates: Arc<dyn CertificateStore>,
    ) -> Self {
        let store = GaugeStore::new(pool.clone());
        let resolver = IdentityResolver::new(store.clone());
        let locks = LockCoordinator::new(pool, lock_config);

        let engine = CompanionPairingEngine::new(
            store.clone(),
            resolver.clone(),
            locks.clone(),
            Arc::clone(&audit),
        );
        let workflow = CalibrationWorkflow::new(
            store.clone(),
            resolver,
            locks,
            certificates,
            audit,
        );

        Self {
            store,
            engine,
            workflow,
        }
    }

    // ---- identity & pairing ------------------------------------------

    pub async fn register_spare(&self, new_gauge: NewGauge, actor: &str) -> GaugeResult<Gauge> {
        self.engine.register_spare(new_gauge, actor).await
    }

    pub async fn create_set(&self, request: CreateSetRequest) -> GaugeResult<SetCreated> {
        self.engine.create_set(request).await
    }

    pub async fn unpair_set(&self, request: UnpairRequest) -> GaugeResult<SetUnpaired> {
        self.engine.unpair_set(request).await
    }

    pub async fn replace_in_set(
        &self,
        request: ReplaceRequest,
    ) -> GaugeResult<SetMembersReplaced> {
        self.engine.replace_in_set(request).await
    }

    pub async fn retire_gauge(&self, serial: &str, actor: &str) -> GaugeResult<Gauge> {
        self.engine.retire(serial, actor).await
    }

    // ---- calibration workflow ----------------------------------------

    pub async fn send_to_calibration(
        &self,
        identifiers: &[String],
        actor: &str,
    ) -> GaugeResult<CalibrationSendResult> {
        self.workflow.send_to_calibration(identifiers, actor).await
    }

    pub async fn mark_returned(&self, identifier: &str, actor: &str) -> GaugeResult<StatusChange> {
        self.workflow.mark_returned(identifier, actor).await
    }

    pub async fn upload_certificate(
        &self,
        identifier: &str,
        certificate_ref: &str,
        actor: &str,
    ) -> GaugeResult<CertificateAttached> {
        self.workflow
            .attach_certificate(identifier, certificate_ref, actor)
            .await
    }

    pub async fn release_set(
        &self,
        set_code: &str,
        destination_location: &str,
        actor: &str,
    ) -> GaugeResult<SetReleased> {
        self.workflow
            .release_set(set_code, destination_location, actor)
            .await
    }

    pub async fn release_gauge(
        &self,
        identifier: &str,
        destination_location: &str,
        actor: &str,
    ) -> GaugeResult<StatusChange> {
        self.workflow
            .release_gauge(identifier, destination_location, actor)
            .await
    }

    // ---- read paths ---------------------------------------------------

    pub async fn get_set_members(&self, set_code: &str) -> GaugeResult<Vec<Gauge>> {
        self.store.get_set_members(set_code).await
    }

    pub async fn get_gauge(&self, key: uuid::Uuid) -> GaugeResult<Option<Gauge>> {
        self.store.get_by_key(key).await
    }
}
