//! Identity resolution for caller-supplied gauge identifiers
//!
//! Operators address a spare by manufacturer serial number and a paired
//! gauge by set member code (`SP0007A`). Resolution runs on the caller's
//! transaction connection; resolving on a separate connection and
//! re-reading later would reopen the race window the lock coordinator
//! exists to close.

use sqlx::PgConnection;
use tracing::debug;

use crate::database::gauge_store::GaugeStore;
use crate::error::GaugeResult;
use crate::models::gauge::{Gauge, GaugeCategory, Identifier};
use crate::pairing::set_code::split_set_member;

/// Typed resolution outcome. "Does not exist" and "matches several rows"
/// are ordinary outcomes here, not errors; callers turn them into the
/// error that fits their operation.
#[derive(Debug)]
pub enum Resolution {
    Found(Gauge),
    NotFound,
    Ambiguous { matches: usize },
}

impl Resolution {
    pub fn into_option(self) -> Option<Gauge> {
        match self {
            Resolution::Found(gauge) => Some(gauge),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: GaugeStore,
}

impl IdentityResolver {
    pub fn new(store: GaugeStore) -> Self {
        Self { store }
    }

    /// Resolve an explicit, already-tagged identifier.
    pub async fn resolve(
        &self,
        conn: &mut PgConnection,
        identifier: &Identifier,
    ) -> GaugeResult<Resolution> {
        match identifier {
            Identifier::Serial(serial) => {
                let matches = self
                    .store
                    .find_by_serial_any_category(conn, serial)
                    .await?;
                if matches.len() > 1 {
                    return Ok(Resolution::Ambiguous {
                        matches: matches.len(),
                    });
                }
                Ok(match matches.into_iter().next() {
                    Some(gauge) => Resolution::Found(gauge),
                    None => Resolution::NotFound,
                })
            }
            Identifier::SetMember(raw) => match split_set_member(raw) {
                Some((set_code, suffix)) => {
                    match self.store.find_by_set_member(conn, &set_code, suffix).await? {
                        Some(gauge) => Ok(Resolution::Found(gauge)),
                        None => Ok(Resolution::NotFound),
                    }
                }
                None => Ok(Resolution::NotFound),
            },
        }
    }

    /// Resolve within a known category; used by pairing operations where
    /// the request names the compatibility class.
    pub async fn resolve_serial_in_category(
        &self,
        conn: &mut PgConnection,
        category: GaugeCategory,
        serial: &str,
    ) -> GaugeResult<Resolution> {
        match self.store.find_by_serial(conn, category, serial).await? {
            Some(gauge) => Ok(Resolution::Found(gauge)),
            None => Ok(Resolution::NotFound),
        }
    }

    /// Resolve an untagged string the way the source system's operators
    /// type them: serial number first for categories that keep the
    /// manufacturer serial as an identifier, then set member code.
    /// Categories without dual identifiers are addressed by set member
    /// code only.
    pub async fn resolve_text(
        &self,
        conn: &mut PgConnection,
        raw: &str,
    ) -> GaugeResult<Resolution> {
        let serials =
            serial_candidates(self.store.find_by_serial_any_category(conn, raw).await?);
        if serials.len() > 1 {
            return Ok(Resolution::Ambiguous {
                matches: serials.len(),
            });
        }
        if let Some(gauge) = serials.into_iter().next() {
            debug!(identifier = raw, key = %gauge.internal_key, "resolved by serial");
            return Ok(Resolution::Found(gauge));
        }

        if let Some((set_code, suffix)) = split_set_member(raw) {
            if let Some(gauge) = self.store.find_by_set_member(conn, &set_code, suffix).await? {
                debug!(identifier = raw, key = %gauge.internal_key, "resolved by set member");
                return Ok(Resolution::Found(gauge));
            }
        }

        Ok(Resolution::NotFound)
    }
}

/// Serial lookup only applies to categories that keep the manufacturer
/// serial meaningful as an identifier; other categories resolve by set
/// member code alone.
fn serial_candidates(matches: Vec<Gauge>) -> Vec<Gauge> {
    matches
        .into_iter()
        .filter(|g| g.spec.category.requires_dual_identifiers())
        .collect()
}
