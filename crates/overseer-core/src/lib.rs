pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use config::AppConfig;
pub use error::{OverseerError, Result};
pub use event::EventBus;
pub use types::*;
