mod codec;
mod message;

pub use codec::FrameCodec;
pub use message::is_reserved_topic;
pub use message::Message;
pub use message::MessageError;
pub use message::ALIVE_TOPIC;
pub use message::RELAY_TOPIC;
pub use message::STOP_TOPIC;
pub use message::WILDCARD;

pub(crate) use codec::encode_parts;
