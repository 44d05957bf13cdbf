pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::TeamConfig;
pub use context::ExecutionContext;
pub use error::{ConclaveError, Result};
pub use event::{ErrorCode, EventSink, StreamEvent};
pub use types::*;
