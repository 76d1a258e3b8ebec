pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;

/// Version reported in the client identification string.
pub const VERSION: &str = env!("NANOHTTPS_VERSION");
