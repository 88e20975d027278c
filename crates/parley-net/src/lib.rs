pub mod datagram;
pub mod error;
pub mod stream;

pub use datagram::{DatagramListener, DatagramRelay};
pub use error::NetError;
pub use stream::{ConnectionListener, DEFAULT_MAX_RECORD_BYTES, StreamConnection};
