pub mod ack_nack;
pub mod data;
pub mod data_frag;
pub mod gap;
pub mod heartbeat;
pub mod nack_frag;
pub mod submessage;

pub use ack_nack::AckNack;
pub use data::Data;
pub use data_frag::DataFrag;
pub use gap::Gap;
pub use heartbeat::Heartbeat;
pub use nack_frag::NackFrag;
pub use submessage::{ReaderSubmessage, Submessage, SubmessageBody, SubmessageHeader, WriterSubmessage};
