//! Configuration loading for tagharvest.
//!
//! [`ConfigLoader`] resolves a [`HarvestConfig`] from an explicit path, inline
//! JSON in the environment, a well-known file next to the process, or the
//! built-in defaults, in that order. Every load also reports suspicious but
//! usable values as [`ConfigWarnings`].

pub mod loader;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigSource, ENV_CONFIG_JSON, ENV_CONFIG_PATH};
pub use tagharvest_core::harvest::HarvestConfig;
pub use validation::{ConfigWarning, ConfigWarnings, collect_warnings};
