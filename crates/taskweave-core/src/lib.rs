pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod plan;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use event::EventBus;
pub use types::*;
