pub mod coordinator;
pub mod events;
pub mod stream;
#[cfg(test)]
mod tests;

pub use coordinator::{Session, SessionChannels};
pub use events::{SessionCommand, SessionEvent};
pub use stream::StreamDriver;
