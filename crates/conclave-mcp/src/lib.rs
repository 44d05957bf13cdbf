pub mod breaker;
pub mod gateway;

pub use breaker::{BreakerState, CircuitBreaker};
pub use gateway::{BreakerStatus, McpHealth, ToolGateway, ToolOutcome};
