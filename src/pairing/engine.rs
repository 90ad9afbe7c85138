//! Companion pairing engine: create-set, unpair, replace-in-set
//!
//! Each operation is one transaction executed through the lock coordinator:
//! resolve inside the transaction, acquire ordered row locks, validate
//! against the locked snapshots (never against pre-lock reads), write every
//! affected side together, commit. A losing concurrent request blocks on
//! the row locks, then re-reads the winner's committed state and fails fast
//! with the matching semantic error. Serialization conflicts are retried by
//! the coordinator's bounded backoff wrapper.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use tracing::{error, info};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::database::gauge_store::GaugeStore;
use crate::database::identity_resolver::{IdentityResolver, Resolution};
use crate::database::lock_coordinator::LockCoordinator;
use crate::error::{GaugeError, GaugeResult};
use crate::models::gauge::{
    Gauge, GaugeCategory, GaugeStatus, Identifier, NewGauge, SharedAttributes,
};
use crate::pairing::set_code::MEMBER_SUFFIXES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSetRequest {
    pub category: GaugeCategory,
    pub serial_a: String,
    pub serial_b: String,
    pub attributes: SharedAttributes,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCreated {
    pub set_code: String,
    pub member_a: Gauge,
    pub member_b: Gauge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpairRequest {
    pub set_code: String,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetUnpaired {
    pub set_code: String,
    pub freed_serials: [String; 2],
    pub freed_keys: [Uuid; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceRequest {
    pub set_code: String,
    pub outgoing_serial: String,
    pub incoming_serial: String,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetMembersReplaced {
    pub set_code: String,
    pub incoming: Gauge,
    pub remaining: Gauge,
    pub freed_serial: String,
}

pub struct CompanionPairingEngine {
    store: GaugeStore,
    resolver: IdentityResolver,
    locks: LockCoordinator,
    audit: Arc<dyn AuditSink>,
}

impl CompanionPairingEngine {
    pub fn new(
        store: GaugeStore,
        resolver: IdentityResolver,
        locks: LockCoordinator,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            resolver,
            locks,
            audit,
        }
    }

    // ------------------------------------------------------------------
    // Create set
    // ------------------------------------------------------------------

    pub async fn create_set(&self, request: CreateSetRequest) -> GaugeResult<SetCreated> {
        if request.serial_a.trim().is_empty() || request.serial_b.trim().is_empty() {
            return Err(GaugeError::Validation {
                message: "both serial numbers are required".to_string(),
            });
        }
        if request.serial_a == request.serial_b {
            return Err(GaugeError::Validation {
                message: format!("cannot pair gauge '{}' with itself", request.serial_a),
            });
        }

        let created = self
            .locks
            .run_with_retry("create-set", || self.try_create_set(&request))
            .await?;

        info!(
            set_code = %created.set_code,
            go = %created.member_a.serial_number,
            no_go = %created.member_b.serial_number,
            "created companion set"
        );

        self.audit
            .record(
                AuditEvent::new("gauge.set.create", &request.actor)
                    .with_set_code(&created.set_code)
                    .with_gauges(&[
                        created.member_a.internal_key,
                        created.member_b.internal_key,
                    ])
                    .with_detail(serde_json::json!({
                        "serial_a": created.member_a.serial_number,
                        "serial_b": created.member_b.serial_number,
                        "storage_location": request.attributes.storage_location,
                    })),
            )
            .await;

        Ok(created)
    }

    async fn try_create_set(&self, request: &CreateSetRequest) -> GaugeResult<SetCreated> {
        let mut tx = self.locks.begin().await?;

        let gauge_a = self
            .resolve_serial(&mut tx, request.category, &request.serial_a)
            .await?;
        let gauge_b = self
            .resolve_serial(&mut tx, request.category, &request.serial_b)
            .await?;

        let locked = self
            .locks
            .lock_gauges(&mut tx, &[gauge_a.internal_key, gauge_b.internal_key])
            .await?;
        let locked_a = snapshot_of(&locked, gauge_a.internal_key)?;
        let locked_b = snapshot_of(&locked, gauge_b.internal_key)?;

        ensure_spare_for_pairing(locked_a)?;
        ensure_spare_for_pairing(locked_b)?;

        if let Some(reason) = locked_a.spec.compatibility_error(&locked_b.spec) {
            return Err(GaugeError::IncompatiblePair {
                serial_a: locked_a.serial_number.clone(),
                serial_b: locked_b.serial_number.clone(),
                reason,
            });
        }

        let set_code = self.store.next_set_code(&mut tx).await?;
        let [go_suffix, no_go_suffix] = MEMBER_SUFFIXES;

        let member_a = self
            .store
            .apply_pairing(
                &mut tx,
                locked_a.internal_key,
                &set_code,
                go_suffix,
                locked_b.internal_key,
                &request.attributes,
            )
            .await?;
        let member_b = self
            .store
            .apply_pairing(
                &mut tx,
                locked_b.internal_key,
                &set_code,
                no_go_suffix,
                locked_a.internal_key,
                &request.attributes,
            )
            .await?;

        tx.commit().await?;

        Ok(SetCreated {
            set_code,
            member_a,
            member_b,
        })
    }

    // ------------------------------------------------------------------
    // Unpair set
    // ------------------------------------------------------------------

    pub async fn unpair_set(&self, request: UnpairRequest) -> GaugeResult<SetUnpaired> {
        let unpaired = self
            .locks
            .run_with_retry("unpair-set", || self.try_unpair(&request))
            .await?;

        info!(
            set_code = %unpaired.set_code,
            freed = ?unpaired.freed_serials,
            "unpaired companion set"
        );

        self.audit
            .record(
                AuditEvent::new("gauge.set.unpair", &request.actor)
                    .with_set_code(&unpaired.set_code)
                    .with_gauges(&unpaired.freed_keys)
                    .with_detail(serde_json::json!({
                        "freed_serials": unpaired.freed_serials,
                    })),
            )
            .await;

        Ok(unpaired)
    }

    async fn try_unpair(&self, request: &UnpairRequest) -> GaugeResult<SetUnpaired> {
        let mut tx = self.locks.begin().await?;

        let members = self
            .store
            .members_of_set(&mut tx, &request.set_code)
            .await?;
        let keys = member_keys_checked(&request.set_code, &members)?;

        let locked = self.locks.lock_gauges(&mut tx, &keys).await?;
        // The locked snapshots are authoritative; a concurrent unpair that
        // won the race leaves these rows without the set code.
        for member in &locked {
            if member.set_code.as_deref() != Some(request.set_code.as_str()) {
                return Err(GaugeError::SetNotFound {
                    set_code: request.set_code.clone(),
                });
            }
        }

        let mut by_suffix = locked.clone();
        by_suffix.sort_by_key(|g| g.member_suffix);
        let freed_serials = [
            by_suffix[0].serial_number.clone(),
            by_suffix[1].serial_number.clone(),
        ];
        let freed_keys = [by_suffix[0].internal_key, by_suffix[1].internal_key];

        for member in &locked {
            self.store.clear_pairing(&mut tx, member.internal_key).await?;
        }

        tx.commit().await?;

        Ok(SetUnpaired {
            set_code: request.set_code.clone(),
            freed_serials,
            freed_keys,
        })
    }

    // ------------------------------------------------------------------
    // Replace in set
    // ------------------------------------------------------------------

    pub async fn replace_in_set(&self, request: ReplaceRequest) -> GaugeResult<SetMembersReplaced> {
        if request.outgoing_serial == request.incoming_serial {
            return Err(GaugeError::Validation {
                message: format!(
                    "cannot replace gauge '{}' with itself",
                    request.outgoing_serial
                ),
            });
        }

        let replaced = self
            .locks
            .run_with_retry("replace-in-set", || self.try_replace(&request))
            .await?;

        info!(
            set_code = %replaced.set_code,
            incoming = %replaced.incoming.serial_number,
            freed = %replaced.freed_serial,
            "replaced set member"
        );

        self.audit
            .record(
                AuditEvent::new("gauge.set.replace", &request.actor)
                    .with_set_code(&replaced.set_code)
                    .with_gauges(&[
                        replaced.incoming.internal_key,
                        replaced.remaining.internal_key,
                    ])
                    .with_detail(serde_json::json!({
                        "outgoing_serial": replaced.freed_serial,
                        "incoming_serial": replaced.incoming.serial_number,
                    })),
            )
            .await;

        Ok(replaced)
    }

    async fn try_replace(&self, request: &ReplaceRequest) -> GaugeResult<SetMembersReplaced> {
        let mut tx = self.locks.begin().await?;

        let outgoing = self
            .resolve_identifier(&mut tx, &Identifier::Serial(request.outgoing_serial.clone()))
            .await?;
        if outgoing.set_code.as_deref() != Some(request.set_code.as_str()) {
            return Err(GaugeError::NotInSet {
                serial: outgoing.serial_number.clone(),
                set_code: request.set_code.clone(),
            });
        }
        let companion_key = outgoing.companion_key.ok_or_else(|| {
            corruption(&request.set_code, 1)
        })?;

        let incoming = self
            .resolve_identifier(&mut tx, &Identifier::Serial(request.incoming_serial.clone()))
            .await?;
        if !incoming.is_spare() {
            return Err(GaugeError::NotASpare {
                serial: incoming.serial_number.clone(),
            });
        }

        // Three-row lock set: outgoing, incoming, and the untouched
        // companion; the coordinator orders them globally.
        let locked = self
            .locks
            .lock_gauges(
                &mut tx,
                &[outgoing.internal_key, incoming.internal_key, companion_key],
            )
            .await?;
        let outgoing_l = snapshot_of(&locked, outgoing.internal_key)?;
        let incoming_l = snapshot_of(&locked, incoming.internal_key)?;
        let companion_l = snapshot_of(&locked, companion_key)?;

        // Revalidate from locked snapshots.
        if outgoing_l.set_code.as_deref() != Some(request.set_code.as_str()) {
            return Err(GaugeError::NotInSet {
                serial: outgoing_l.serial_number.clone(),
                set_code: request.set_code.clone(),
            });
        }
        if !incoming_l.is_spare() {
            return Err(GaugeError::NotASpare {
                serial: incoming_l.serial_number.clone(),
            });
        }
        ensure_spare_for_pairing(incoming_l)?;
        if companion_l.companion_key != Some(outgoing_l.internal_key) {
            return Err(corruption(&request.set_code, 2));
        }

        // Compatibility is judged against the remaining companion, not the
        // outgoing member.
        if let Some(reason) = incoming_l.spec.compatibility_error(&companion_l.spec) {
            return Err(GaugeError::IncompatiblePair {
                serial_a: incoming_l.serial_number.clone(),
                serial_b: companion_l.serial_number.clone(),
                reason,
            });
        }

        let suffix = outgoing_l
            .member_suffix
            .ok_or_else(|| corruption(&request.set_code, 2))?;
        let attrs = SharedAttributes {
            storage_location: companion_l.storage_location.clone(),
        };

        // Write order matters for the uniqueness constraints: free the
        // outgoing slot first, then seat the incoming gauge, then repoint
        // the companion.
        let freed = self
            .store
            .clear_pairing(&mut tx, outgoing_l.internal_key)
            .await?;
        let incoming_updated = self
            .store
            .apply_pairing(
                &mut tx,
                incoming_l.internal_key,
                &request.set_code,
                suffix,
                companion_l.internal_key,
                &attrs,
            )
            .await?;
        let remaining = self
            .store
            .set_companion(&mut tx, companion_l.internal_key, incoming_l.internal_key)
            .await?;

        tx.commit().await?;

        Ok(SetMembersReplaced {
            set_code: request.set_code.clone(),
            incoming: incoming_updated,
            remaining,
            freed_serial: freed.serial_number,
        })
    }

    // ------------------------------------------------------------------
    // Spare lifecycle
    // ------------------------------------------------------------------

    /// Register a new spare gauge. Spares enter the system unpaired, in
    /// `AVAILABLE_FOR_USE`, addressable by serial number.
    pub async fn register_spare(&self, new_gauge: NewGauge, actor: &str) -> GaugeResult<Gauge> {
        if new_gauge.serial_number.trim().is_empty() {
            return Err(GaugeError::Validation {
                message: "serial number is required".to_string(),
            });
        }
        if new_gauge.spec.category.requires_dual_identifiers()
            && (new_gauge.spec.thread_size.is_none() || new_gauge.spec.thread_class.is_none())
        {
            return Err(GaugeError::Validation {
                message: format!(
                    "thread gauge '{}' requires thread size and class",
                    new_gauge.serial_number
                ),
            });
        }

        let mut tx = self.locks.begin().await?;
        let gauge = match self.store.insert_spare(&mut tx, &new_gauge).await {
            Ok(gauge) => gauge,
            Err(GaugeError::Database(err)) if is_unique_violation(&err) => {
                return Err(GaugeError::Validation {
                    message: format!(
                        "serial '{}' is already registered in category {}",
                        new_gauge.serial_number,
                        new_gauge.spec.category.as_db_str()
                    ),
                });
            }
            Err(err) => return Err(err),
        };
        tx.commit().await?;

        info!(serial = %gauge.serial_number, key = %gauge.internal_key, "registered spare gauge");

        self.audit
            .record(
                AuditEvent::new("gauge.spare.register", actor)
                    .with_gauges(&[gauge.internal_key])
                    .with_detail(serde_json::json!({
                        "serial": gauge.serial_number,
                        "category": gauge.spec.category.as_db_str(),
                    })),
            )
            .await;

        Ok(gauge)
    }

    /// Retire a spare. Retirement is a status value, never a row removal,
    /// and a paired gauge must be unpaired (or replaced out) first.
    pub async fn retire(&self, serial: &str, actor: &str) -> GaugeResult<Gauge> {
        let retired = self
            .locks
            .run_with_retry("retire-gauge", || self.try_retire(serial))
            .await?;

        info!(serial = %retired.serial_number, "retired gauge");

        self.audit
            .record(
                AuditEvent::new("gauge.retire", actor)
                    .with_gauges(&[retired.internal_key])
                    .with_detail(serde_json::json!({ "serial": retired.serial_number })),
            )
            .await;

        Ok(retired)
    }

    async fn try_retire(&self, serial: &str) -> GaugeResult<Gauge> {
        let mut tx = self.locks.begin().await?;

        let gauge = self
            .resolve_identifier(&mut tx, &Identifier::Serial(serial.to_string()))
            .await?;
        let locked = self
            .locks
            .lock_gauges(&mut tx, &[gauge.internal_key])
            .await?;
        let snapshot = locked
            .into_iter()
            .next()
            .ok_or_else(|| GaugeError::NotFound {
                identifier: serial.to_string(),
            })?;

        if !snapshot.is_spare() {
            return Err(GaugeError::Validation {
                message: format!(
                    "gauge '{}' belongs to set '{}'; unpair before retiring",
                    snapshot.serial_number,
                    snapshot.set_code.as_deref().unwrap_or("?")
                ),
            });
        }
        if snapshot.status == GaugeStatus::Retired {
            return Err(GaugeError::Validation {
                message: format!("gauge '{}' is already retired", snapshot.serial_number),
            });
        }

        self.store
            .set_status(&mut tx, &[snapshot.internal_key], GaugeStatus::Retired)
            .await?;
        let updated = self
            .store
            .find_by_key(&mut tx, snapshot.internal_key)
            .await?
            .ok_or_else(|| GaugeError::NotFound {
                identifier: serial.to_string(),
            })?;
        tx.commit().await?;

        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    async fn resolve_serial(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        category: GaugeCategory,
        serial: &str,
    ) -> GaugeResult<Gauge> {
        match self
            .resolver
            .resolve_serial_in_category(&mut *tx, category, serial)
            .await?
        {
            Resolution::Found(gauge) => Ok(gauge),
            Resolution::NotFound => Err(GaugeError::NotFound {
                identifier: serial.to_string(),
            }),
            Resolution::Ambiguous { matches } => Err(GaugeError::Ambiguous {
                identifier: serial.to_string(),
                matches,
            }),
        }
    }

    async fn resolve_identifier(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        identifier: &Identifier,
    ) -> GaugeResult<Gauge> {
        match self.resolver.resolve(&mut *tx, identifier).await? {
            Resolution::Found(gauge) => Ok(gauge),
            Resolution::NotFound => Err(GaugeError::NotFound {
                identifier: identifier.raw().to_string(),
            }),
            Resolution::Ambiguous { matches } => Err(GaugeError::Ambiguous {
                identifier: identifier.raw().to_string(),
                matches,
            }),
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn corruption(set_code: &str, member_count: usize) -> GaugeError {
    error!(set_code, member_count, "set corruption detected, surfacing without repair");
    GaugeError::SetCorrupted {
        set_code: set_code.to_string(),
        member_count,
    }
}

/// Count check for set membership: zero members means the set never
/// existed (or was unpaired), anything other than two is corruption.
fn member_keys_checked(set_code: &str, members: &[Gauge]) -> GaugeResult<Vec<Uuid>> {
    match members.len() {
        0 => Err(GaugeError::SetNotFound {
            set_code: set_code.to_string(),
        }),
        2 => Ok(members.iter().map(|g| g.internal_key).collect()),
        n => Err(corruption(set_code, n)),
    }
}

fn snapshot_of(locked: &[Gauge], key: Uuid) -> GaugeResult<&Gauge> {
    locked
        .iter()
        .find(|g| g.internal_key == key)
        .ok_or_else(|| GaugeError::NotFound {
            identifier: key.to_string(),
        })
}

fn ensure_spare_for_pairing(gauge: &Gauge) -> GaugeResult<()> {
    if let Some(set_code) = &gauge.set_code {
        return Err(GaugeError::AlreadyPaired {
            serial: gauge.serial_number.clone(),
            set_code: set_code.clone(),
        });
    }
    if gauge.status == GaugeStatus::Retired {
        return Err(GaugeError::Validation {
            message: format!("gauge '{}' is retired", gauge.serial_number),
        });
    }
    Ok(())
}
