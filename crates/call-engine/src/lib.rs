//! # rpbx call engine
//!
//! Call routing and channel lifecycle for the rpbx PBX: the peering layer
//! linking two call endpoints (and their media attachment points), the
//! routing state machine turning an inbound `call.execute` into a
//! connected, accepted or rejected call, and the driver registry hosting
//! live channels behind admission gates.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌────────────┐
//!                      │   Engine   │  lifecycle flags, timer beat
//!                      └─────┬──────┘
//!                            │
//!                   ┌────────┴────────┐
//!                   │   MessageBus    │  (rpbx-infra-bus)
//!                   └────────┬────────┘
//!                            │ relays
//!              ┌─────────────┼─────────────┐
//!        ┌─────┴─────┐ ┌─────┴─────┐ ┌─────┴─────┐
//!        │  Driver a │ │  Driver b │ │    ...    │
//!        └─────┬─────┘ └───────────┘ └───────────┘
//!              │ owns
//!        ┌─────┴─────┐   peering    ┌───────────┐
//!        │  Channel  │◄────────────►│  Channel  │
//!        └───────────┘              └───────────┘
//! ```
//!
//! An inbound request arrives as `call.execute`; the owning [`Driver`]
//! creates an incoming [`Channel`] and spawns a [`Router`], which dispatches
//! the routing message and drives the channel to `accepted` or `rejected`.
//! Once accepted, the channel pairs with its target through
//! [`Channel::connect`] and later `call.*` / `chan.*` messages reach it
//! through the driver registry.

pub mod channel;
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod module;
pub mod router;

pub use rpbx_infra_bus as bus;

pub use channel::{Channel, ChannelControl};
pub use config::EngineConfig;
pub use driver::{Driver, DriverHandler};
pub use endpoint::{CallEndpoint, DataConsumer, DataEndpoint, DataSource, EndpointState};
pub use engine::{Engine, EngineState};
pub use error::{EngineError, Result};
pub use module::{MessageId, Module, ModuleCore};
pub use router::Router;

/// Commonly used types in one import.
pub mod prelude {
    pub use crate::bus::{Message, MessageBus, MessageHandler, MessageRelay, RelayTarget};
    pub use crate::channel::{Channel, ChannelControl};
    pub use crate::config::EngineConfig;
    pub use crate::driver::{Driver, DriverHandler};
    pub use crate::endpoint::CallEndpoint;
    pub use crate::engine::{Engine, EngineState};
    pub use crate::error::{EngineError, Result};
    pub use crate::module::{MessageId, Module};
    pub use crate::router::Router;
}
