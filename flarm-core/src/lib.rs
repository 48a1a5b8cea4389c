//! flarm-core: Pure decode + projection library for FLARM traffic.
//!
//! No async, no network I/O, just sentence parsing and geometry. This crate is
//! the shared core used by `flarm-server` (sources, fan-out, CLI).

pub mod config;
pub mod geo;
pub mod normalize;
pub mod ogn;
pub mod sentence;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{load_config, select_source, Config, SourceLocator};
pub use geo::{project, GeoPoint};
pub use sentence::{decode, Sentence};
pub use types::*;
