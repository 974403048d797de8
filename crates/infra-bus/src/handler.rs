//! Handler side of the dispatch chain.

use async_trait::async_trait;

use crate::message::Message;

/// A handler installed on the [`MessageBus`](crate::bus::MessageBus).
///
/// Handlers run in ascending priority order (0-100, lower runs earlier);
/// returning `true` consumes the message and stops the chain.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Position in the dispatch chain. Handlers with equal priority run in
    /// installation order.
    fn priority(&self) -> u32;

    /// Examines and possibly mutates the message. Returns `true` when the
    /// message was consumed.
    async fn handle(&self, msg: &mut Message) -> bool;
}
