pub mod kafka;
pub mod message;
pub mod sender;
pub mod subscriber;

pub use kafka::{create_producer, KafkaFrameSource};
pub use message::{Envelope, HeaderNames, Headers, Message};
pub use sender::{KafkaSender, Sender};
pub use subscriber::{Delivery, Frame, FrameSource, MessageHandler, ReconnectPolicy, Subscriber};
