//! Name-filtered relays binding bus messages to modules.

use std::sync::Weak;

use async_trait::async_trait;

use crate::handler::MessageHandler;
use crate::message::Message;

/// Receiver side of a [`MessageRelay`].
///
/// A module installs one relay per message name it cares about; the relay
/// hands every matching message to `received` together with the integer
/// discriminator the module registered it under.
#[async_trait]
pub trait RelayTarget: Send + Sync {
    async fn received(&self, msg: &mut Message, id: u32) -> bool;
}

/// Binds a message name to a module with a discriminator and priority.
///
/// The target is held weakly: once the owning module is gone the relay goes
/// inert instead of keeping the module alive through the bus.
pub struct MessageRelay {
    name: String,
    target: Weak<dyn RelayTarget>,
    id: u32,
    priority: u32,
}

impl MessageRelay {
    pub fn new(
        name: impl Into<String>,
        target: Weak<dyn RelayTarget>,
        id: u32,
        priority: u32,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            id,
            priority,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

#[async_trait]
impl MessageHandler for MessageRelay {
    fn priority(&self) -> u32 {
        self.priority
    }

    async fn handle(&self, msg: &mut Message) -> bool {
        if msg.name() != self.name {
            return false;
        }
        match self.target.upgrade() {
            Some(target) => target.received(msg, self.id).await,
            None => false,
        }
    }
}
