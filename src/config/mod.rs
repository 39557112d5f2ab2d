pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{FlagOptions, config_from_flags, load_config, merge_flags};
pub use models::*;
pub use validation::{ConfigValidator, ValidationError, ValidationResult, expand_chain};
