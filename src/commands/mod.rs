//! debimg commands definition.

pub mod build;
pub mod status;
