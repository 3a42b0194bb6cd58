// Workflow Outcomes - Explicit WON/LOST/CONVERTED execution and entity conversion

pub mod conversion;
pub mod executor;

pub use conversion::{
    CONVERTED_TO_LINK, ConversionError, EntityConverter, build_target, default_field_mappings,
};
pub use executor::{
    OUTCOME_UNAVAILABLE_ERROR, OutcomeRejection, TERMINAL_STATE_ERROR, WfmOutcomeExecutor,
};
