//! Host wrapper around [`tagharvest_core::HarvestProcessor`].

pub mod demo;
pub mod host;

pub use host::{ServiceHost, shutdown_signal};
