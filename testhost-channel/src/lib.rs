//! testhost-channel: loopback message channel between a supervisor and the test
//! host process it launches.

pub mod bridge;
pub mod channel;
pub mod queue;
pub mod reader;

#[cfg(test)]
mod test_support;

pub use bridge::codec::{CodecError, MessageCodec};
pub use bridge::protocol::{ACKNOWLEDGE_TYPE, ERROR_TYPE, ErrorMessage, Message};
pub use channel::{Channel, ChannelConfig, ChannelError, ChannelListener, CloseOutcome};
pub use queue::{ReceiveQueue, Take};
pub use reader::ReaderState;
