pub mod clock;
pub mod message;
pub mod metrics;
pub mod shutdown;
pub mod telemetry;

pub type BoxError = metrics::BoxError;
