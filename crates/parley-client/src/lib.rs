pub mod audio;
pub mod call;
pub mod client;
pub mod event;
pub mod pump;
pub mod replies;

pub use audio::{AudioDevice, AudioError, SilentDevice};
pub use call::{ActiveCall, CallError, CallService, CallState};
pub use client::{ChatClient, ClientConfig, ClientError};
pub use event::{ClientEvent, PendingInvite};
pub use pump::{AudioPump, PlaybackQueue};
pub use replies::{Owed, ReplyLedger};
