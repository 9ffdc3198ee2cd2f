pub mod backoff;
pub mod cancel;
pub mod error;
pub mod fingerprint;
pub mod scheduled_executor;

pub use cancel::CancelFlag;
pub use error::{EngineError, EngineResult, Envelope, ErrorBody};
pub use scheduled_executor::{ScheduledExecutor, ScheduledTask, ShutdownHandle};
