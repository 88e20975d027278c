pub mod codec;
pub mod error;
pub mod events;
pub mod models;

pub use codec::Frame;
pub use error::ProtocolError;
pub use events::{Command, EndReason, Event};
pub use models::{AudioNote, ConversationKey, Message, MessageBody, TargetKind};
