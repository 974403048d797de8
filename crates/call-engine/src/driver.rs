//! Drivers: named modules owning a family of live channels.
//!
//! A driver hosts the channels of one protocol family, installs the relays
//! for the call-control message names, enforces admission limits and
//! forwards every routed message to the channel it addresses.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use rpbx_infra_bus::{clock, Message, MessageBus, RelayTarget, UserData};
use tracing::{debug, error};

use crate::channel::Channel;
use crate::config::EngineConfig;
use crate::endpoint::CallEndpoint;
use crate::engine::EngineState;
use crate::module::{module_set_debug, MessageId, Module, ModuleCore};

/// Protocol-specific driver behavior.
#[async_trait]
pub trait DriverHandler: Send + Sync {
    /// Handles a `call.execute` owned by this driver. `dest` is the callto
    /// target with the driver prefix already stripped. Returning `true`
    /// means a channel was created and kept.
    async fn msg_execute(&self, driver: &Arc<Driver>, msg: &mut Message, dest: &str) -> bool;

    /// Whether channels of this driver are dynamically allocated and have
    /// to be released by the router when routing ends without a call.
    fn varchan(&self) -> bool {
        true
    }
}

/// A module owning a set of live channels.
pub struct Driver {
    core: ModuleCore,
    self_ref: Weak<Driver>,
    prefix: String,
    handler: Arc<dyn DriverHandler>,
    state: Arc<EngineState>,
    chans: StdMutex<Vec<Arc<Channel>>>,
    next_id: AtomicU32,
    total: AtomicU32,
    routed: AtomicU32,
    routing: AtomicU32,
    timeout_ms: AtomicU64,
    maxroute: AtomicU32,
    maxchans: AtomicU32,
    init: AtomicBool,
}

impl Driver {
    pub fn new(
        name: impl Into<String>,
        mtype: impl Into<String>,
        bus: Arc<MessageBus>,
        state: Arc<EngineState>,
        handler: Arc<dyn DriverHandler>,
    ) -> Arc<Driver> {
        let name = name.into();
        let prefix = format!("{}/", name);
        Arc::new_cyclic(|self_ref| Driver {
            core: ModuleCore::new(name, mtype, bus),
            self_ref: self_ref.clone(),
            prefix,
            handler,
            state,
            chans: StdMutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
            total: AtomicU32::new(0),
            routed: AtomicU32::new(0),
            routing: AtomicU32::new(0),
            timeout_ms: AtomicU64::new(0),
            maxroute: AtomicU32::new(0),
            maxchans: AtomicU32::new(0),
            init: AtomicBool::new(false),
        })
    }

    /// Applies the telephony limits and installs every relay this driver
    /// answers to. Safe to call more than once; only the first call does
    /// anything.
    pub fn setup(self: &Arc<Self>, config: &EngineConfig) {
        if self.init.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timeout_ms.store(config.timeout_ms, Ordering::SeqCst);
        self.maxroute.store(config.maxroute, Ordering::SeqCst);
        self.maxchans.store(config.maxchans, Ordering::SeqCst);
        self.core.set_update_delay_secs(config.update_delay_secs);

        let target = || -> Weak<dyn RelayTarget> { Arc::downgrade(&(self.clone() as Arc<dyn RelayTarget>)) };
        self.core.install_relay(target(), MessageId::Timer, 90);
        self.core.install_relay(target(), MessageId::Status, 110);
        self.core.install_relay(target(), MessageId::Level, 120);
        self.core.install_relay(target(), MessageId::Masquerade, 10);
        self.core.install_relay(target(), MessageId::Locate, 40);
        self.core.install_relay(target(), MessageId::Drop, 60);
        self.core.install_relay(target(), MessageId::Execute, 90);
        self.core.install_relay(target(), MessageId::Halt, 100);
        self.core.install_relay(target(), MessageId::Tone, 100);
        self.core.install_relay(target(), MessageId::Text, 100);
        self.core.install_relay(target(), MessageId::Progress, 100);
        self.core.install_relay(target(), MessageId::Ringing, 100);
        self.core.install_relay(target(), MessageId::Answered, 100);
        self.core.install_relay(target(), MessageId::Transfer, 100);
        debug!("driver '{}' set up", self.core.name());
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn varchan(&self) -> bool {
        self.handler.varchan()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn routed(&self) -> u32 {
        self.routed.load(Ordering::SeqCst)
    }

    pub fn routing(&self) -> u32 {
        self.routing.load(Ordering::SeqCst)
    }

    pub fn chan_count(&self) -> usize {
        self.chans.lock().unwrap().len()
    }

    pub fn is_busy(&self) -> bool {
        self.routing() != 0 || self.chan_count() != 0
    }

    /// Monotonic channel id source; never repeats within a process.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The channel with the given id, if it is still live.
    pub fn find(&self, id: &str) -> Option<Arc<Channel>> {
        self.chans
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    pub(crate) fn insert_chan(&self, chan: &Arc<Channel>) {
        self.chans.lock().unwrap().push(chan.clone());
        self.total.fetch_add(1, Ordering::SeqCst);
        self.core.changed();
    }

    pub(crate) fn remove_chan(&self, chan: &Channel) -> bool {
        let mut chans = self.chans.lock().unwrap();
        let before = chans.len();
        chans.retain(|c| !std::ptr::eq(Arc::as_ptr(c), chan));
        chans.len() != before
    }

    pub(crate) fn routing_started(&self) {
        self.routing.fetch_add(1, Ordering::SeqCst);
        self.core.changed();
    }

    pub(crate) fn routing_finished(&self, routed: bool) {
        self.routing.fetch_sub(1, Ordering::SeqCst);
        if routed {
            self.routed.fetch_add(1, Ordering::SeqCst);
        }
        self.core.changed();
    }

    /// Whether a new routing task may start.
    pub fn can_route(&self) -> bool {
        if self.state.is_exiting() {
            return false;
        }
        let maxroute = self.maxroute.load(Ordering::SeqCst);
        !(maxroute > 0 && self.routing() >= maxroute)
    }

    /// Whether a new channel may be admitted; with `include_routers` the
    /// routing limit counts too.
    pub fn can_accept(&self, include_routers: bool) -> bool {
        if self.state.is_exiting() {
            return false;
        }
        if include_routers && !self.can_route() {
            return false;
        }
        let maxchans = self.maxchans.load(Ordering::SeqCst);
        !(maxchans > 0 && self.chan_count() >= maxchans as usize)
    }

    /// Sweeps the channel list for expired `timeout` and `maxcall`
    /// deadlines. Due channels are collected first and dropped after the
    /// list lock is gone, so a drop that empties the list cannot trip the
    /// sweep.
    async fn timer_sweep(self: &Arc<Self>, msg: &Message) {
        let now = clock::now_usecs();
        let due: Vec<(Arc<Channel>, &'static str)> = {
            let chans = self.chans.lock().unwrap();
            chans
                .iter()
                .filter_map(|c| {
                    let timeout = c.timeout_at();
                    let maxcall = c.maxcall_at();
                    if timeout != 0 && timeout < now {
                        Some((c.clone(), "timeout"))
                    } else if maxcall != 0 && maxcall < now {
                        Some((c.clone(), "noanswer"))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (chan, reason) in due {
            let _op = chan.lock_ops().await;
            if let Err(err) = chan.msg_drop(msg, Some(reason)).await {
                error!("timer drop of '{}' failed: {}", chan.id(), err);
                self.state.restart();
            }
        }
    }

    /// Drops every channel of this driver.
    pub async fn drop_all(self: &Arc<Self>, msg: &Message) {
        let reason = msg.get_value("reason").map(String::from);
        let all: Vec<Arc<Channel>> = self.chans.lock().unwrap().clone();
        for chan in all {
            debug!("dropping channel '{}'", chan.id());
            let _op = chan.lock_ops().await;
            if let Err(err) = chan.msg_drop(msg, reason.as_deref()).await {
                error!("dropping channel '{}' failed: {}", chan.id(), err);
                self.state.restart();
            }
        }
    }

    fn status_channels(&self, out: &mut String) {
        let chans = self.chans.lock().unwrap();
        for chan in chans.iter() {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(chan.id());
            out.push('=');
            out.push_str(&chan.status());
            out.push('|');
            out.push_str(&chan.address());
            out.push('|');
            out.push_str(&chan.endpoint().peer_id());
        }
    }

    async fn handle_received(self: &Arc<Self>, msg: &mut Message, id: MessageId) -> bool {
        // pick the destination key by message kind
        let dest = match id {
            MessageId::Timer => {
                self.timer_sweep(msg).await;
                return self.module_received(msg, id);
            }
            MessageId::Status | MessageId::Level => {
                return self.module_received(msg, id);
            }
            MessageId::Halt => {
                self.drop_all(msg).await;
                return false;
            }
            MessageId::Execute => msg.get_value("callto").unwrap_or("").to_string(),
            MessageId::Drop | MessageId::Masquerade | MessageId::Locate => {
                msg.get_value("id").unwrap_or("").to_string()
            }
            _ => msg.get_value("targetid").unwrap_or("").to_string(),
        };

        if id == MessageId::Drop {
            let exact = dest == self.core.name();
            if exact || dest.is_empty() || dest == self.core.mtype() {
                self.drop_all(msg).await;
                return exact;
            }
        }
        if !dest.starts_with(&self.prefix) {
            return false;
        }

        if id == MessageId::Execute {
            if !self.can_accept(false) {
                return false;
            }
            let stripped = dest[self.prefix.len()..].to_string();
            let handler = self.handler.clone();
            return handler.msg_execute(self, msg, &stripped).await;
        }

        let Some(chan) = self.find(&dest) else {
            debug!("could not find channel '{}'", dest);
            return false;
        };
        let _op = chan.lock_ops().await;
        match id {
            MessageId::Progress => chan.is_incoming() && chan.msg_progress(msg),
            MessageId::Ringing => chan.is_incoming() && chan.msg_ringing(msg),
            MessageId::Answered => chan.is_incoming() && chan.msg_answered(msg),
            MessageId::Tone => {
                let tone = msg.get_value("text").unwrap_or("").to_string();
                chan.msg_tone(msg, &tone).await
            }
            MessageId::Text => {
                let text = msg.get_value("text").unwrap_or("").to_string();
                chan.msg_text(msg, &text).await
            }
            MessageId::Drop => {
                let reason = msg.get_value("reason").map(String::from);
                match chan.msg_drop(msg, reason.as_deref()).await {
                    Ok(done) => done,
                    Err(err) => {
                        error!("dropping channel '{}' failed: {}", dest, err);
                        self.state.restart();
                        false
                    }
                }
            }
            MessageId::Transfer => chan.msg_transfer(msg).await,
            MessageId::Masquerade => {
                let new_name = msg.get_value("message").unwrap_or("").to_string();
                if new_name.is_empty() {
                    return false;
                }
                msg.rename(new_name);
                msg.clear_param("message");
                msg.set_user_data(Some(chan.clone() as Arc<UserData>));
                chan.complete(msg, false);
                // not consumed: the rewritten message continues down the
                // chain under its new name
                false
            }
            MessageId::Locate => {
                msg.set_user_data(Some(chan.clone() as Arc<UserData>));
                true
            }
            _ => false,
        }
    }
}

impl Module for Driver {
    fn module(&self) -> &ModuleCore {
        &self.core
    }

    fn status_module(&self, out: &mut String) {
        out.push_str("name=");
        out.push_str(self.core.name());
        if !self.core.mtype().is_empty() {
            out.push_str(",type=");
            out.push_str(self.core.mtype());
        }
        out.push_str(",format=Status|Address|Peer");
    }

    fn status_params(&self, out: &mut String) {
        out.push_str(&format!(
            "routed={},routing={},total={},chans={}",
            self.routed(),
            self.routing(),
            self.total(),
            self.chan_count()
        ));
    }

    fn msg_status(&self, msg: &mut Message) {
        let mut line = String::new();
        self.status_module(&mut line);
        line.push(';');
        self.status_params(&mut line);
        line.push(';');
        let mut chans = String::new();
        self.status_channels(&mut chans);
        line.push_str(&chans);
        line.push('\n');
        msg.ret_value_mut().push_str(&line);
    }

    fn gen_update(&self, msg: &mut Message) {
        msg.set_param("routed", self.routed().to_string());
        msg.set_param("routing", self.routing().to_string());
        msg.set_param("total", self.total().to_string());
        msg.set_param("chans", self.chan_count().to_string());
    }

    fn set_debug(&self, msg: &mut Message, target: &str) -> bool {
        if !target.starts_with(&self.prefix) {
            return module_set_debug(&self.core, msg, target);
        }
        match self.find(target) {
            Some(chan) => chan.debug_line(msg),
            None => false,
        }
    }
}

#[async_trait]
impl RelayTarget for Driver {
    async fn received(&self, msg: &mut Message, id: u32) -> bool {
        let Some(id) = MessageId::from_discriminant(id) else {
            error!(
                "invalid relay id {} in driver '{}', message '{}'",
                id,
                self.core.name(),
                msg.name()
            );
            return false;
        };
        let Some(this) = self.self_ref.upgrade() else {
            return false;
        };
        this.handle_received(msg, id).await
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.core.name())
            .field("chans", &self.chan_count())
            .field("routing", &self.routing())
            .finish()
    }
}
