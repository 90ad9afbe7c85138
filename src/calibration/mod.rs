//! Calibration workflow: the five-state lifecycle around external calibration

pub mod workflow;

pub use workflow::{
    CalibrationSendResult, CalibrationWorkflow, CertificateAttached, SetReleased, StatusChange,
};
