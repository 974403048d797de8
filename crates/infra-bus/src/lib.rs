//! Process-wide message bus for the rpbx engine.
//!
//! Everything that happens in the engine travels as a [`Message`]: a named
//! event carrying an ordered parameter list, an optional shared user-data
//! payload and a return value that flows back to a dispatching sender.
//!
//! The core components of this crate are:
//! - [`Message`]: the named, parameterized event
//! - [`MessageHandler`]: the handler side of the dispatch chain
//! - [`MessageRelay`]: a name-filtered binding from the bus to a module
//! - [`MessageBus`]: install/uninstall, synchronous dispatch, asynchronous
//!   enqueue with a background queue worker

pub mod bus;
pub mod clock;
pub mod handler;
pub mod message;
pub mod relay;

pub use bus::MessageBus;
pub use handler::MessageHandler;
pub use message::{Message, UserData};
pub use relay::{MessageRelay, RelayTarget};
