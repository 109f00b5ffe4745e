pub mod bucketing;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::{AppConfig, JourneyConfig};
pub use error::{PulseError, PulseResult};
