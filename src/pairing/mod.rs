//! Companion pairing: set codes and the state-transition engine

pub mod engine;
pub mod set_code;

pub use engine::{
    CompanionPairingEngine, CreateSetRequest, ReplaceRequest, SetCreated, SetMembersReplaced,
    SetUnpaired, UnpairRequest,
};
