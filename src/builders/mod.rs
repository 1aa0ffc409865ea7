pub mod core;
pub mod debian_img;
pub mod status;

pub use self::core::{Outcome, Pipeline, Stage, StageState, Stages};
pub use self::status::{StatusSnapshot, StatusStore, StatusValue, DEFAULT_STATUS_FILE};
