pub mod calls;
pub mod dispatcher;
pub mod error;
pub mod groups;
pub mod server;
pub mod sessions;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::StateError;
pub use server::serve;

