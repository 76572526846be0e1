//! Work unit data model: documents, phases and identifiers.

pub mod unit;
pub mod unit_id;

pub use unit::{
    ParseEnumError, Phase, PhaseSpec, PhaseStatus, Status, WEIGHT_TOLERANCE, WorkUnit,
    validate_phase_specs,
};
pub use unit_id::{InvalidWorkUnitId, WorkUnitId};
