//! Channels: call endpoints owned by a driver, carrying call-control state.
//!
//! A channel is born `incoming` or `outgoing`, lives in its driver's list
//! from construction until [`Channel::drop_chan`], and moves through the
//! call-control states (`routed`, `accepted`, `ringing`, `answered`, ...)
//! as messages arrive through the driver. Teardown is explicit: a dropped
//! channel leaves the registry immediately so concurrent lookups see either
//! a fully live channel or none.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use rpbx_infra_bus::{clock, Message, MessageBus, UserData};
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::endpoint::{self, CallEndpoint, EndpointState};
use crate::engine::EngineState;
use crate::error::{EngineError, Result};
use crate::module::{Module, DEFAULT_DEBUG_LEVEL};

/// Driver-specific channel behavior.
///
/// The default implementations decline everything; a protocol driver
/// installs its own control to consume tones, text and transfers.
#[async_trait]
pub trait ChannelControl: Send + Sync {
    async fn on_tone(&self, _chan: &Arc<Channel>, _msg: &mut Message, _tone: &str) -> bool {
        false
    }

    async fn on_text(&self, _chan: &Arc<Channel>, _msg: &mut Message, _text: &str) -> bool {
        false
    }

    async fn on_transfer(&self, _chan: &Arc<Channel>, _msg: &mut Message) -> bool {
        false
    }
}

struct ChannelVars {
    status: String,
    address: String,
    targetid: String,
    billid: String,
}

/// A live participant in one call, owned by a [`Driver`].
pub struct Channel {
    endpoint: EndpointState,
    self_ref: Weak<Channel>,
    driver: Weak<Driver>,
    bus: Arc<MessageBus>,
    state: Arc<EngineState>,
    outgoing: bool,
    control: Option<Arc<dyn ChannelControl>>,
    vars: StdMutex<ChannelVars>,
    timeout: AtomicU64,
    maxcall: AtomicU64,
    /// Serializes call-control message delivery to this channel.
    op_lock: tokio::sync::Mutex<()>,
    debug_enabled: AtomicBool,
    debug_level: AtomicI32,
}

impl Channel {
    /// Creates a channel and registers it with its driver. Without an
    /// explicit id the channel gets `prefix` plus the driver's next
    /// monotonic id.
    pub fn new(
        driver: &Arc<Driver>,
        outgoing: bool,
        id: Option<String>,
        control: Option<Arc<dyn ChannelControl>>,
    ) -> Arc<Channel> {
        let id = id.unwrap_or_else(|| format!("{}{}", driver.prefix(), driver.next_id()));
        let direction = if outgoing { "outgoing" } else { "incoming" };
        let chan = Arc::new_cyclic(|self_ref| Channel {
            endpoint: EndpointState::new(&id),
            self_ref: self_ref.clone(),
            driver: Arc::downgrade(driver),
            bus: driver.module().bus().clone(),
            state: driver.state().clone(),
            outgoing,
            control,
            vars: StdMutex::new(ChannelVars {
                status: direction.to_string(),
                address: String::new(),
                targetid: String::new(),
                billid: String::new(),
            }),
            timeout: AtomicU64::new(0),
            maxcall: AtomicU64::new(0),
            op_lock: tokio::sync::Mutex::new(()),
            debug_enabled: AtomicBool::new(true),
            debug_level: AtomicI32::new(driver.module().debug_level()),
        });
        driver.insert_chan(&chan);
        debug!("created {} channel '{}'", direction, id);
        chan
    }

    pub fn id(&self) -> &str {
        self.endpoint.id()
    }

    pub fn is_incoming(&self) -> bool {
        !self.outgoing
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn direction(&self) -> &'static str {
        if self.outgoing {
            "outgoing"
        } else {
            "incoming"
        }
    }

    pub fn driver(&self) -> Option<Arc<Driver>> {
        self.driver.upgrade()
    }

    pub fn status(&self) -> String {
        self.vars.lock().unwrap().status.clone()
    }

    pub fn set_status(&self, status: &str) {
        self.vars.lock().unwrap().status = status.to_string();
    }

    pub fn address(&self) -> String {
        self.vars.lock().unwrap().address.clone()
    }

    pub fn set_address(&self, address: &str) {
        self.vars.lock().unwrap().address = address.to_string();
        if let Some(driver) = self.driver() {
            driver.module().changed();
        }
    }

    pub fn targetid(&self) -> String {
        self.vars.lock().unwrap().targetid.clone()
    }

    pub fn set_targetid(&self, targetid: &str) {
        self.vars.lock().unwrap().targetid = targetid.to_string();
    }

    pub fn billid(&self) -> String {
        self.vars.lock().unwrap().billid.clone()
    }

    /// Absolute drop deadline in microseconds, 0 when disarmed.
    pub fn timeout_at(&self) -> u64 {
        self.timeout.load(Ordering::SeqCst)
    }

    pub fn set_timeout_at(&self, at: u64) {
        self.timeout.store(at, Ordering::SeqCst);
    }

    /// Absolute answer deadline in microseconds, 0 when disarmed.
    pub fn maxcall_at(&self) -> u64 {
        self.maxcall.load(Ordering::SeqCst)
    }

    pub fn set_maxcall_at(&self, at: u64) {
        self.maxcall.store(at, Ordering::SeqCst);
    }

    /// Arms the answer deadline from the `maxcall` parameter (milliseconds),
    /// disarming it when absent.
    pub fn set_maxcall(&self, msg: &Message) {
        let tout = msg.get_int_value("maxcall", 0);
        if tout > 0 {
            self.set_maxcall_at(clock::deadline_ms(tout as u64));
        } else {
            self.set_maxcall_at(0);
        }
    }

    pub(crate) async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    fn copy_billid(&self, msg: &Message) {
        if let Some(billid) = msg.get_value("billid") {
            let mut vars = self.vars.lock().unwrap();
            if vars.billid.is_empty() {
                vars.billid = billid.to_string();
            }
        }
    }

    fn self_arc(&self) -> Option<Arc<Channel>> {
        self.self_ref.upgrade()
    }

    /// Fills in the channel identity parameters. A minimal completion sets
    /// only `id` and `module`.
    pub fn complete(&self, msg: &mut Message, minimal: bool) {
        msg.set_param("id", self.id());
        if let Some(driver) = self.driver() {
            msg.set_param("module", driver.module().name());
        }
        if minimal {
            return;
        }
        let vars = self.vars.lock().unwrap();
        if !vars.status.is_empty() {
            msg.set_param("status", vars.status.clone());
        }
        if !vars.address.is_empty() {
            msg.set_param("address", vars.address.clone());
        }
        if !vars.targetid.is_empty() {
            msg.set_param("targetid", vars.targetid.clone());
        }
        if !vars.billid.is_empty() {
            msg.set_param("billid", vars.billid.clone());
        }
        drop(vars);
        let peerid = self.endpoint.peer_id();
        if !peerid.is_empty() {
            msg.set_param("peerid", peerid);
        }
    }

    /// Builds a message pre-completed from this channel. With `data` set the
    /// channel rides along as user-data, keeping itself referenced until the
    /// message dies.
    pub fn message(&self, name: &str, minimal: bool, data: bool) -> Message {
        let mut msg = Message::new(name);
        if data {
            if let Some(this) = self.self_arc() {
                msg.set_user_data(Some(this as Arc<UserData>));
            }
        }
        self.complete(&mut msg, minimal);
        msg
    }

    /// Hands the routing message to a freshly spawned router task. The call
    /// is rejected with the `failure` error before this returns an error.
    pub fn start_router(self: &Arc<Self>, msg: Message) -> Result<()> {
        match self.driver() {
            Some(driver) => {
                crate::router::Router::spawn(driver, self.id().to_string(), msg);
                Ok(())
            }
            None => {
                self.call_rejected("failure", Some("Internal server error"), None);
                Err(EngineError::RouterFailed(format!(
                    "channel '{}' has no driver",
                    self.id()
                )))
            }
        }
    }

    pub fn msg_progress(&self, msg: &Message) -> bool {
        self.set_status("progressing");
        self.copy_billid(msg);
        true
    }

    pub fn msg_ringing(&self, msg: &Message) -> bool {
        self.set_status("ringing");
        self.copy_billid(msg);
        true
    }

    pub fn msg_answered(&self, msg: &Message) -> bool {
        self.set_maxcall_at(0);
        self.set_status("answered");
        self.copy_billid(msg);
        true
    }

    pub async fn msg_tone(self: &Arc<Self>, msg: &mut Message, tone: &str) -> bool {
        match &self.control {
            Some(control) => control.on_tone(self, msg, tone).await,
            None => false,
        }
    }

    pub async fn msg_text(self: &Arc<Self>, msg: &mut Message, text: &str) -> bool {
        match &self.control {
            Some(control) => control.on_text(self, msg, text).await,
            None => false,
        }
    }

    pub async fn msg_transfer(self: &Arc<Self>, msg: &mut Message) -> bool {
        match &self.control {
            Some(control) => control.on_transfer(self, msg).await,
            None => false,
        }
    }

    /// Drops the call: disarms the timers, records the reason as status,
    /// severs the peering and leaves the driver's registry.
    pub async fn msg_drop(self: &Arc<Self>, _msg: &Message, reason: Option<&str>) -> Result<bool> {
        self.set_timeout_at(0);
        self.set_maxcall_at(0);
        let status = match reason {
            Some(reason) if !reason.is_empty() => reason,
            _ => "dropped",
        };
        self.set_status(status);
        self.disconnect(reason).await?;
        self.drop_chan();
        Ok(true)
    }

    /// Routing found a target for this call.
    pub fn call_routed(&self, msg: &Message) -> bool {
        self.set_status("routed");
        self.copy_billid(msg);
        true
    }

    /// An accepted call with no target id answers itself unless the message
    /// explicitly said `autoanswer=false`; without a peer that can be
    /// addressed later this is the only way to keep the call alive.
    fn answer_if_untargeted(msg: &Message) -> bool {
        msg.get_bool_value("autoanswer", true)
    }

    /// The routed call connected to its target.
    pub fn call_accept(&self, msg: &Message) {
        self.set_status("accepted");
        let default_timeout = self.driver().map(|d| d.timeout_ms()).unwrap_or(0);
        let tout = msg.get_int_value("timeout", default_timeout as i64);
        if tout > 0 {
            self.set_timeout_at(clock::deadline_ms(tout as u64));
        }
        self.copy_billid(msg);
        let targetid = msg.get_value("targetid").unwrap_or("").to_string();
        self.set_targetid(&targetid);
        if msg.get_bool_value("autoanswer", false) {
            self.msg_answered(msg);
        } else if msg.get_bool_value("autoring", false) {
            self.msg_ringing(msg);
        } else if targetid.is_empty() && Self::answer_if_untargeted(msg) {
            info!("answering call '{}' now because it has no targetid", self.id());
            self.msg_answered(msg);
        }
    }

    /// Routing failed with the given error code.
    pub fn call_rejected(&self, error: &str, reason: Option<&str>, _msg: Option<&Message>) {
        warn!(
            "call '{}' rejected error='{}' reason='{}'",
            self.id(),
            error,
            reason.unwrap_or("")
        );
        self.set_status("rejected");
    }

    /// Peers this channel with another call endpoint.
    pub async fn connect(
        self: &Arc<Self>,
        peer: Option<Arc<dyn CallEndpoint>>,
        reason: Option<&str>,
    ) -> Result<bool> {
        let this: Arc<dyn CallEndpoint> = self.clone();
        endpoint::connect(&this, peer, reason).await
    }

    /// Severs the peering without tearing this side down.
    pub async fn disconnect(self: &Arc<Self>, reason: Option<&str>) -> Result<bool> {
        let this: Arc<dyn CallEndpoint> = self.clone();
        endpoint::disconnect(&this, false, reason).await
    }

    /// Removes this channel from its driver's registry. After this no
    /// lookup can reach the channel again.
    pub fn drop_chan(&self) {
        if let Some(driver) = self.driver() {
            if driver.remove_chan(self) {
                driver.module().changed();
            }
        }
    }

    /// Releases the channel: severs any remaining peering finally, disarms
    /// the timers and leaves the registry. The status is kept, so a dropped
    /// or rejected channel stays readable as such. Idempotent.
    pub async fn release(self: &Arc<Self>) {
        let this: Arc<dyn CallEndpoint> = self.clone();
        if let Err(err) = endpoint::disconnect(&this, true, None).await {
            warn!("channel '{}' teardown: {}", self.id(), err);
            self.state.restart();
        }
        self.set_timeout_at(0);
        self.set_maxcall_at(0);
        self.drop_chan();
    }

    /// Full teardown: [`Channel::release`] plus the terminal `deleted`
    /// status. Idempotent.
    pub async fn cleanup(self: &Arc<Self>) {
        self.release().await;
        self.set_status("deleted");
        self.set_targetid("");
    }

    /// Handles an `engine.debug` line aimed at this channel.
    pub fn debug_line(&self, msg: &mut Message) -> bool {
        let line = msg.get_value("line").unwrap_or("").trim().to_string();
        if let Some(rest) = line.strip_prefix("level") {
            if let Ok(level) = rest.trim().parse() {
                self.debug_level.store(level, Ordering::SeqCst);
            }
        } else if line == "reset" {
            let level = self
                .driver()
                .map(|d| d.module().debug_level())
                .unwrap_or(DEFAULT_DEBUG_LEVEL);
            self.debug_level.store(level, Ordering::SeqCst);
            self.debug_enabled.store(true, Ordering::SeqCst);
        } else if line == "engine" {
            self.debug_level.store(DEFAULT_DEBUG_LEVEL, Ordering::SeqCst);
        } else if !line.is_empty() {
            let enabled = msg.get_bool_value("line", self.debug_enabled.load(Ordering::SeqCst));
            self.debug_enabled.store(enabled, Ordering::SeqCst);
        }
        let reply = format!(
            "Channel {} debug {} level {}\n",
            self.id(),
            if self.debug_enabled.load(Ordering::SeqCst) {
                "on"
            } else {
                "off"
            },
            self.debug_level.load(Ordering::SeqCst)
        );
        msg.ret_value_mut().push_str(&reply);
        true
    }
}

#[async_trait]
impl CallEndpoint for Channel {
    fn endpoint(&self) -> &EndpointState {
        &self.endpoint
    }

    async fn disconnected(&self, is_final: bool, reason: Option<&str>) {
        if is_final || self.state.is_exiting() {
            return;
        }
        // last chance to get reconnected to something
        self.set_targetid("");
        let mut msg = self.message("chan.disconnected", false, true);
        if let Some(reason) = reason {
            msg.set_param("reason", reason);
        }
        self.bus.enqueue(msg);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("direction", &self.direction())
            .field("status", &self.status())
            .finish()
    }
}
