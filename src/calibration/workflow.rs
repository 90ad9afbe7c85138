//! Calibration workflow state machine
//!
//! `AVAILABLE_FOR_USE -> CALIBRATION_DUE -> OUT_FOR_CALIBRATION ->
//! PENDING_CERTIFICATE -> PENDING_RELEASE -> AVAILABLE_FOR_USE`
//!
//! Sending operates per gauge: a single member of a set may go to the
//! vendor alone (the source system couples checkout but not calibration
//! sends; see DESIGN.md). Release is the one transition that moves both
//! members of a set together, reusing the lock coordinator's two-gauge
//! discipline because the members share a destination storage location.
//! Invalid transition attempts roll back and leave every row unchanged.

use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use tracing::{error, info};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::certificates::CertificateStore;
use crate::database::gauge_store::GaugeStore;
use crate::database::identity_resolver::{IdentityResolver, Resolution};
use crate::database::lock_coordinator::LockCoordinator;
use crate::error::{GaugeError, GaugeResult};
use crate::models::gauge::{Gauge, GaugeStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub identifier: String,
    pub from: GaugeStatus,
    pub to: GaugeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSendResult {
    pub updated: Vec<StatusChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAttached {
    pub identifier: String,
    pub certificate_id: Uuid,
    /// `PendingCertificate` while the companion's certificate is still
    /// outstanding; `PendingRelease` once every member of the set holds one
    /// (for a spare the rule degenerates to the one gauge).
    pub status: GaugeStatus,
    pub set_ready_for_release: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetReleased {
    pub set_code: String,
    pub storage_location: String,
    pub members: Vec<Gauge>,
}

pub struct CalibrationWorkflow {
    store: GaugeStore,
    resolver: IdentityResolver,
    locks: LockCoordinator,
    certificates: Arc<dyn CertificateStore>,
    audit: Arc<dyn AuditSink>,
}

impl CalibrationWorkflow {
    pub fn new(
        store: GaugeStore,
        resolver: IdentityResolver,
        locks: LockCoordinator,
        certificates: Arc<dyn CertificateStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            resolver,
            locks,
            certificates,
            audit,
        }
    }

    // ------------------------------------------------------------------
    // Send to calibration
    // ------------------------------------------------------------------

    pub async fn send_to_calibration(
        &self,
        identifiers: &[String],
        actor: &str,
    ) -> GaugeResult<CalibrationSendResult> {
        if identifiers.is_empty() {
            return Err(GaugeError::Validation {
                message: "at least one gauge identifier is required".to_string(),
            });
        }

        let result = self
            .locks
            .run_with_retry("send-to-calibration", || self.try_send(identifiers))
            .await?;

        info!(count = result.updated.len(), "sent gauges to calibration");

        self.audit
            .record(
                AuditEvent::new("gauge.calibration.send", actor).with_detail(serde_json::json!({
                    "identifiers": identifiers,
                })),
            )
            .await;

        Ok(result)
    }

    async fn try_send(&self, identifiers: &[String]) -> GaugeResult<CalibrationSendResult> {
        let mut tx = self.locks.begin().await?;

        let mut keys = Vec::with_capacity(identifiers.len());
        for raw in identifiers {
            let gauge = self.resolve_text(&mut tx, raw).await?;
            if keys.contains(&gauge.internal_key) {
                return Err(GaugeError::Validation {
                    message: format!("identifier '{raw}' names a gauge already in this request"),
                });
            }
            keys.push(gauge.internal_key);
        }

        let locked = self.locks.lock_gauges(&mut tx, &keys).await?;
        for gauge in &locked {
            if !gauge.status.can_send_to_calibration() {
                return Err(GaugeError::InvalidStateTransition {
                    identifier: gauge.full_identifier(),
                    from: gauge.status,
                    attempted: GaugeStatus::OutForCalibration,
                });
            }
        }

        self.store
            .set_status(&mut tx, &keys, GaugeStatus::OutForCalibration)
            .await?;
        tx.commit().await?;

        Ok(CalibrationSendResult {
            updated: locked
                .iter()
                .map(|g| StatusChange {
                    identifier: g.full_identifier(),
                    from: g.status,
                    to: GaugeStatus::OutForCalibration,
                })
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // Vendor return
    // ------------------------------------------------------------------

    /// External event: the gauge came back from the calibration vendor.
    pub async fn mark_returned(&self, identifier: &str, actor: &str) -> GaugeResult<StatusChange> {
        let change = self
            .locks
            .run_with_retry("mark-returned", || {
                self.try_single_transition(
                    identifier,
                    GaugeStatus::OutForCalibration,
                    GaugeStatus::PendingCertificate,
                )
            })
            .await?;

        info!(identifier = %change.identifier, "gauge returned from calibration vendor");

        self.audit
            .record(
                AuditEvent::new("gauge.calibration.return", actor).with_detail(
                    serde_json::json!({ "identifier": change.identifier }),
                ),
            )
            .await;

        Ok(change)
    }

    async fn try_single_transition(
        &self,
        identifier: &str,
        required_from: GaugeStatus,
        to: GaugeStatus,
    ) -> GaugeResult<StatusChange> {
        let mut tx = self.locks.begin().await?;

        let gauge = self.resolve_text(&mut tx, identifier).await?;
        let locked = self
            .locks
            .lock_gauges(&mut tx, &[gauge.internal_key])
            .await?;
        let snapshot = &locked[0];

        if snapshot.status != required_from {
            return Err(GaugeError::InvalidStateTransition {
                identifier: snapshot.full_identifier(),
                from: snapshot.status,
                attempted: to,
            });
        }

        self.store
            .set_status(&mut tx, &[snapshot.internal_key], to)
            .await?;
        tx.commit().await?;

        Ok(StatusChange {
            identifier: snapshot.full_identifier(),
            from: snapshot.status,
            to,
        })
    }

    // ------------------------------------------------------------------
    // Certificate attachment
    // ------------------------------------------------------------------

    /// Attach a certificate. The gauge advances to `PENDING_RELEASE` only
    /// once its companion (if any) also holds one; the arrival of the
    /// second certificate moves both members in the same transaction.
    pub async fn attach_certificate(
        &self,
        identifier: &str,
        file_ref: &str,
        actor: &str,
    ) -> GaugeResult<CertificateAttached> {
        let attached = self
            .locks
            .run_with_retry("attach-certificate", || {
                self.try_attach(identifier, file_ref, actor)
            })
            .await?;

        info!(
            identifier = %attached.identifier,
            set_ready = attached.set_ready_for_release,
            "certificate attached"
        );

        self.audit
            .record(
                AuditEvent::new("gauge.calibration.certificate", actor).with_detail(
                    serde_json::json!({
                        "identifier": attached.identifier,
                        "certificate_id": attached.certificate_id,
                    }),
                ),
            )
            .await;

        Ok(attached)
    }

    async fn try_attach(
        &self,
        identifier: &str,
        file_ref: &str,
        actor: &str,
    ) -> GaugeResult<CertificateAttached> {
        let mut tx = self.locks.begin().await?;

        let gauge = self.resolve_text(&mut tx, identifier).await?;
        // Lock the companion too: the second certificate moves both rows.
        let mut keys = vec![gauge.internal_key];
        if let Some(companion_key) = gauge.companion_key {
            keys.push(companion_key);
        }
        let locked = self.locks.lock_gauges(&mut tx, &keys).await?;
        let snapshot = locked
            .iter()
            .find(|g| g.internal_key == gauge.internal_key)
            .cloned()
            .ok_or_else(|| GaugeError::NotFound {
                identifier: identifier.to_string(),
            })?;
        let companion = snapshot
            .companion_key
            .and_then(|k| locked.iter().find(|g| g.internal_key == k).cloned());

        if snapshot.status != GaugeStatus::PendingCertificate {
            return Err(GaugeError::InvalidStateTransition {
                identifier: snapshot.full_identifier(),
                from: snapshot.status,
                attempted: GaugeStatus::PendingRelease,
            });
        }

        // The attach must succeed inside this transaction before any
        // status movement; a failed attach rolls everything back.
        let certificate_id = self
            .certificates
            .attach(&mut tx, snapshot.internal_key, file_ref, actor)
            .await?;

        let (status, set_ready_for_release) = match &companion {
            None => {
                self.store
                    .set_status(&mut tx, &[snapshot.internal_key], GaugeStatus::PendingRelease)
                    .await?;
                (GaugeStatus::PendingRelease, true)
            }
            Some(companion) => {
                let companion_certified = companion.status == GaugeStatus::PendingCertificate
                    && self
                        .certificates
                        .has_certificate(&mut tx, companion.internal_key)
                        .await?;
                if companion_certified {
                    self.store
                        .set_status(
                            &mut tx,
                            &[snapshot.internal_key, companion.internal_key],
                            GaugeStatus::PendingRelease,
                        )
                        .await?;
                    (GaugeStatus::PendingRelease, true)
                } else {
                    (GaugeStatus::PendingCertificate, false)
                }
            }
        };

        tx.commit().await?;

        Ok(CertificateAttached {
            identifier: snapshot.full_identifier(),
            certificate_id,
            status,
            set_ready_for_release,
        })
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Release a whole set back to service: both members locked, both
    /// required to be `PENDING_RELEASE`, both moved to `AVAILABLE_FOR_USE`
    /// at the shared destination location in one commit.
    pub async fn release_set(
        &self,
        set_code: &str,
        destination_location: &str,
        actor: &str,
    ) -> GaugeResult<SetReleased> {
        let released = self
            .locks
            .run_with_retry("release-set", || {
                self.try_release(set_code, destination_location)
            })
            .await?;

        info!(
            set_code = %released.set_code,
            location = %released.storage_location,
            "released set back to service"
        );

        self.audit
            .record(
                AuditEvent::new("gauge.calibration.release", actor)
                    .with_set_code(&released.set_code)
                    .with_gauges(
                        &released
                            .members
                            .iter()
                            .map(|g| g.internal_key)
                            .collect::<Vec<_>>(),
                    )
                    .with_detail(serde_json::json!({
                        "storage_location": released.storage_location,
                    })),
            )
            .await;

        Ok(released)
    }

    async fn try_release(&self, set_code: &str, destination: &str) -> GaugeResult<SetReleased> {
        // Learn the key set from a pool read; everything is revalidated
        // against the locked snapshots inside the transaction.
        let members = self.store.get_set_members(set_code).await?;
        let keys = match members.len() {
            0 => {
                return Err(GaugeError::SetNotFound {
                    set_code: set_code.to_string(),
                })
            }
            2 => members.iter().map(|g| g.internal_key).collect::<Vec<_>>(),
            n => return Err(set_corruption(set_code, n)),
        };

        let store = self.store.clone();
        let set_code_owned = set_code.to_string();
        let destination_owned = destination.to_string();

        self.locks
            .with_locked_gauges(keys.clone(), move |tx, locked| {
                async move {
                    for gauge in &locked {
                        if gauge.set_code.as_deref() != Some(set_code_owned.as_str()) {
                            return Err(GaugeError::SetNotFound {
                                set_code: set_code_owned.clone(),
                            });
                        }
                        if gauge.status != GaugeStatus::PendingRelease {
                            return Err(GaugeError::InvalidStateTransition {
                                identifier: gauge.full_identifier(),
                                from: gauge.status,
                                attempted: GaugeStatus::AvailableForUse,
                            });
                        }
                    }

                    store
                        .set_status_and_location(
                            &mut *tx,
                            &keys,
                            GaugeStatus::AvailableForUse,
                            &destination_owned,
                        )
                        .await?;

                    let members = store.members_of_set(&mut *tx, &set_code_owned).await?;
                    Ok(SetReleased {
                        set_code: set_code_owned,
                        storage_location: destination_owned,
                        members,
                    })
                }
                .boxed()
            })
            .await
    }

    /// Degenerate single-gauge release for spares that went through
    /// calibration unpaired.
    pub async fn release_gauge(
        &self,
        identifier: &str,
        destination_location: &str,
        actor: &str,
    ) -> GaugeResult<StatusChange> {
        let change = self
            .locks
            .run_with_retry("release-gauge", || {
                self.try_release_gauge(identifier, destination_location)
            })
            .await?;

        info!(identifier = %change.identifier, "released spare gauge back to service");

        self.audit
            .record(
                AuditEvent::new("gauge.calibration.release", actor).with_detail(
                    serde_json::json!({
                        "identifier": change.identifier,
                        "storage_location": destination_location,
                    }),
                ),
            )
            .await;

        Ok(change)
    }

    async fn try_release_gauge(
        &self,
        identifier: &str,
        destination: &str,
    ) -> GaugeResult<StatusChange> {
        let mut tx = self.locks.begin().await?;

        let gauge = self.resolve_text(&mut tx, identifier).await?;
        let locked = self
            .locks
            .lock_gauges(&mut tx, &[gauge.internal_key])
            .await?;
        let snapshot = &locked[0];

        if !snapshot.is_spare() {
            return Err(GaugeError::Validation {
                message: format!(
                    "gauge '{}' belongs to set '{}'; release the set instead",
                    snapshot.serial_number,
                    snapshot.set_code.as_deref().unwrap_or("?")
                ),
            });
        }
        if snapshot.status != GaugeStatus::PendingRelease {
            return Err(GaugeError::InvalidStateTransition {
                identifier: snapshot.full_identifier(),
                from: snapshot.status,
                attempted: GaugeStatus::AvailableForUse,
            });
        }

        self.store
            .set_status_and_location(
                &mut tx,
                &[snapshot.internal_key],
                GaugeStatus::AvailableForUse,
                destination,
            )
            .await?;
        tx.commit().await?;

        Ok(StatusChange {
            identifier: snapshot.full_identifier(),
            from: snapshot.status,
            to: GaugeStatus::AvailableForUse,
        })
    }

    // ------------------------------------------------------------------
    // Shared
    // ------------------------------------------------------------------

    async fn resolve_text(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        raw: &str,
    ) -> GaugeResult<Gauge> {
        match self.resolver.resolve_text(&mut *tx, raw).await? {
            Resolution::Found(gauge) => Ok(gauge),
            Resolution::NotFound => Err(GaugeError::NotFound {
                identifier: raw.to_string(),
            }),
            Resolution::Ambiguous { matches } => Err(GaugeError::Ambiguous {
                identifier: raw.to_string(),
                matches,
            }),
        }
    }
}

fn set_corruption(set_code: &str, member_count: usize) -> GaugeError {
    error!(set_code, member_count, "set corruption detected, surfacing without repair");
    GaugeError::SetCorrupted {
        set_code: set_code.to_string(),
        member_count,
    }
}
