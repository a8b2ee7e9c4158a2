pub mod config;
pub mod core;

// Re-export main components for easy access
pub use config::{CasMissingKey, Config, Credentials};
pub use crate::core::*;
