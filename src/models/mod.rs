//! Domain models for gauges, sets, and the calibration lifecycle

pub mod gauge;

pub use gauge::{
    Gauge, GaugeCategory, GaugeSpec, GaugeStatus, Identifier, MemberRole, NewGauge,
    SharedAttributes,
};
