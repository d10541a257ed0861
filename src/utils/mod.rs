pub mod clock;
pub mod retry;
pub mod shutdown;

pub use clock::{Sleeper, TokioSleeper};
pub use retry::{retry_on_transient, Backoff, IsTransient, RetryResult};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
