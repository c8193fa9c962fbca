//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → published in the engine snapshot via Arc
//!
//! On reload (SIGHUP or file change):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → RequestHandler::reconfigure (atomic snapshot swap)
//!     → next dispatched request observes new config
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes replace the whole value
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Transport and worker settings only take effect on start/restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::EngineConfig;
pub use validation::{validate_config, ValidationError};
