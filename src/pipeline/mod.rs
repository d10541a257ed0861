pub mod dead_letter;
pub mod error_mapper;
pub mod policy;
pub mod retry_handler;
pub mod validator;
pub mod writer;

pub use dead_letter::{
    DeadLetterSink, LogDeadLetterSink, RejectReason, RejectionRecord, ScyllaDeadLetterSink,
    TopicDeadLetterSink,
};
pub use error_mapper::ErrorMapper;
pub use policy::{LocalRetryPolicy, RequeuePolicy, RetryPolicy};
pub use retry_handler::{Disposition, RetryHandler};
pub use validator::{UserValidator, Validator};
pub use writer::{ScyllaUserWriter, Writer};
