//! Live fan-out of record batches to connected viewers.

pub mod channel;
pub mod hub;
pub mod protocol;

pub use channel::{ChannelSink, Frame};
pub use hub::{BroadcastHub, DeliveryReport, LivenessReport, SubscriberId, SubscriberSink, SubscriberState};
pub use protocol::{ConnectionStatus, InboundMessage, OutboundMessage};
