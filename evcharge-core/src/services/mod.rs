//! Remote services used by the controller.
pub mod nordpool;
pub mod persistent_state;
pub mod tesla;
