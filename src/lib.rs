//! gauge-track - Gauge Identity & Companion Pairing Engine
//!
//! Tracks physical measurement gauges through pairing (GO/NO-GO companion
//! sets), member replacement, and the calibration lifecycle, against a
//! single PostgreSQL store.
//!
//! The load-bearing design choice: gauge rows are mutated exclusively
//! inside lock-coordinator transactions that acquire `FOR UPDATE` row locks
//! in a global (ascending-key) order under an explicitly set isolation
//! level, and every operation re-reads state under those locks. Concurrent
//! attempts to pair, unpair, or replace the same gauges serialize on the
//! row locks; exactly one wins, the rest observe committed state and fail
//! with a specific semantic error. No gauge is ever observable half-paired
//! or half-released.

// Core error handling
pub mod error;

// Domain models
pub mod models;

// Persistence, identity resolution, and lock coordination
pub mod database;

// Companion pairing engine
pub mod pairing;

// Calibration workflow state machine
pub mod calibration;

// External collaborators
pub mod audit;
pub mod certificates;

// Facade wiring the core for the outer HTTP/CLI layer
pub mod service;

pub use audit::{AuditEvent, AuditSink, NoopAuditSink, PgAuditSink};
pub use calibration::{
    CalibrationSendResult, CalibrationWorkflow, CertificateAttached, SetReleased, StatusChange,
};
pub use certificates::{CertificateStore, PgCertificateStore};
pub use database::{
    DatabaseConfig, DatabaseManager, GaugeStore, IdentityResolver, IsolationLevel, LockConfig,
    LockCoordinator, Resolution,
};
pub use error::{GaugeError, GaugeResult};
pub use models::{
    Gauge, GaugeCategory, GaugeSpec, GaugeStatus, Identifier, MemberRole, NewGauge,
    SharedAttributes,
};
pub use pairing::{
    CompanionPairingEngine, CreateSetRequest, ReplaceRequest, SetCreated, SetMembersReplaced,
    SetUnpaired, UnpairRequest,
};
pub use service::GaugeTrackService;
