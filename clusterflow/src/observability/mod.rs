//! Logging setup and step spans.

mod logging;
mod spans;

pub use logging::{init_tracing, LogConfig, LogFormat};
pub use spans::{step_span, StepSpanAttributes, StepTimer};
