//! Generic module plumbing: message identifiers, relay installation,
//! status reporting and the delayed `module.update` emission.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use rpbx_infra_bus::{clock, Message, MessageBus, MessageHandler, MessageRelay, RelayTarget};
use tracing::error;

/// Default debug verbosity for modules and channels.
pub const DEFAULT_DEBUG_LEVEL: i32 = 5;

/// Wire-visible message families with their stable discriminators.
///
/// The string names are the bus contract; handlers outside this crate match
/// on them. The numeric values are stable within a process and distinct per
/// kind, with the `engine.*` family below 100, call control in the 100s and
/// channel control in the 200s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageId {
    Status = 1,
    Timer = 2,
    Level = 3,
    Command = 4,
    Help = 5,
    Halt = 6,
    Execute = 101,
    Drop = 102,
    Progress = 103,
    Ringing = 104,
    Answered = 105,
    Tone = 201,
    Text = 202,
    Masquerade = 203,
    Locate = 204,
    Transfer = 205,
}

impl MessageId {
    pub const ALL: [MessageId; 16] = [
        MessageId::Status,
        MessageId::Timer,
        MessageId::Level,
        MessageId::Command,
        MessageId::Help,
        MessageId::Halt,
        MessageId::Execute,
        MessageId::Drop,
        MessageId::Progress,
        MessageId::Ringing,
        MessageId::Answered,
        MessageId::Tone,
        MessageId::Text,
        MessageId::Masquerade,
        MessageId::Locate,
        MessageId::Transfer,
    ];

    /// The bus message name this id relays.
    pub fn name(self) -> &'static str {
        match self {
            MessageId::Status => "engine.status",
            MessageId::Timer => "engine.timer",
            MessageId::Level => "engine.debug",
            MessageId::Command => "engine.command",
            MessageId::Help => "engine.help",
            MessageId::Halt => "engine.halt",
            MessageId::Execute => "call.execute",
            MessageId::Drop => "call.drop",
            MessageId::Progress => "call.progress",
            MessageId::Ringing => "call.ringing",
            MessageId::Answered => "call.answered",
            MessageId::Tone => "chan.dtmf",
            MessageId::Text => "chan.text",
            MessageId::Masquerade => "chan.masquerade",
            MessageId::Locate => "chan.locate",
            MessageId::Transfer => "chan.transfer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.name() == name)
    }

    pub fn discriminant(self) -> u32 {
        self as u32
    }

    pub fn from_discriminant(value: u32) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.discriminant() == value)
    }

    /// Bit used to track relay installation per module.
    fn mask(self) -> u32 {
        let bit = Self::ALL
            .iter()
            .position(|id| *id == self)
            .unwrap_or_default();
        1 << bit
    }
}

/// Shared state of a module: identity, installed relays and the dirty flag
/// feeding `module.update`.
pub struct ModuleCore {
    name: String,
    mtype: String,
    bus: Arc<MessageBus>,
    relays: StdMutex<u32>,
    installed: StdMutex<Vec<Arc<MessageRelay>>>,
    changed_at: AtomicU64,
    update_delay: AtomicU64,
    debug_enabled: AtomicBool,
    debug_level: AtomicI32,
}

impl ModuleCore {
    pub fn new(name: impl Into<String>, mtype: impl Into<String>, bus: Arc<MessageBus>) -> Self {
        Self {
            name: name.into(),
            mtype: mtype.into(),
            bus,
            relays: StdMutex::new(0),
            installed: StdMutex::new(Vec::new()),
            changed_at: AtomicU64::new(0),
            update_delay: AtomicU64::new(5_000_000),
            debug_enabled: AtomicBool::new(true),
            debug_level: AtomicI32::new(DEFAULT_DEBUG_LEVEL),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtype(&self) -> &str {
        &self.mtype
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Quiet period between `changed()` and the `module.update` emission.
    pub fn set_update_delay_secs(&self, secs: u64) {
        self.update_delay.store(secs * 1_000_000, Ordering::SeqCst);
    }

    /// Installs a relay for `id` once; later calls for the same id are
    /// no-ops returning `true`.
    pub fn install_relay(&self, target: Weak<dyn RelayTarget>, id: MessageId, priority: u32) -> bool {
        let mut relays = self.relays.lock().unwrap();
        if *relays & id.mask() != 0 {
            return true;
        }
        *relays |= id.mask();
        let relay = Arc::new(MessageRelay::new(
            id.name(),
            target,
            id.discriminant(),
            priority,
        ));
        self.installed.lock().unwrap().push(relay.clone());
        self.bus.install(relay);
        true
    }

    /// Removes every relay this module installed on the bus.
    pub fn uninstall_relays(&self) {
        let installed = std::mem::take(&mut *self.installed.lock().unwrap());
        *self.relays.lock().unwrap() = 0;
        for relay in installed {
            let handler: Arc<dyn MessageHandler> = relay;
            self.bus.uninstall(&handler);
        }
    }

    pub fn relay_count(&self) -> usize {
        self.installed.lock().unwrap().len()
    }

    /// Marks the module dirty; the update goes out on the first timer tick
    /// after the quiet period.
    pub fn changed(&self) {
        let delay = self.update_delay.load(Ordering::SeqCst);
        if delay == 0 {
            return;
        }
        let _ = self.changed_at.compare_exchange(
            0,
            clock::now_usecs() + delay,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn take_due_change(&self, now: u64) -> bool {
        let at = self.changed_at.load(Ordering::SeqCst);
        at != 0
            && now > at
            && self
                .changed_at
                .compare_exchange(at, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled.load(Ordering::SeqCst)
    }

    pub fn set_debug_enabled(&self, on: bool) {
        self.debug_enabled.store(on, Ordering::SeqCst);
    }

    pub fn debug_level(&self) -> i32 {
        self.debug_level.load(Ordering::SeqCst)
    }

    pub fn set_debug_level(&self, level: i32) {
        self.debug_level.store(level, Ordering::SeqCst);
    }
}

/// Shared behavior of relay-driven modules.
///
/// The provided methods implement the generic timer/status/debug handling;
/// implementors override the hooks (`status_params`, `gen_update`,
/// `set_debug`, ...) where their behavior differs.
pub trait Module: Send + Sync {
    fn module(&self) -> &ModuleCore;

    /// First status section: module identity.
    fn status_module(&self, out: &mut String) {
        let core = self.module();
        out.push_str("name=");
        out.push_str(core.name());
        if !core.mtype().is_empty() {
            out.push_str(",type=");
            out.push_str(core.mtype());
        }
    }

    /// Second status section: counters. Empty by default.
    fn status_params(&self, _out: &mut String) {}

    /// Adds this module's counters to an outgoing `module.update`.
    fn gen_update(&self, _msg: &mut Message) {}

    /// Appends this module's status report to the message return value.
    fn msg_status(&self, msg: &mut Message) {
        let mut line = String::new();
        self.status_module(&mut line);
        line.push(';');
        self.status_params(&mut line);
        line.push('\n');
        msg.ret_value_mut().push_str(&line);
    }

    /// Emits a pending `module.update` once the quiet period has passed.
    fn msg_timer(&self, msg: &Message) {
        let core = self.module();
        if core.take_due_change(msg.msg_time()) {
            let mut update = Message::new("module.update");
            update.set_param("module", core.name());
            self.gen_update(&mut update);
            core.bus().enqueue(update);
        }
    }

    /// Handles an `engine.debug` line aimed at `target`. Returns whether
    /// the command was consumed.
    fn set_debug(&self, msg: &mut Message, target: &str) -> bool {
        module_set_debug(self.module(), msg, target)
    }

    /// Generic relay dispatch for the module-level message families.
    fn module_received(&self, msg: &mut Message, id: MessageId) -> bool {
        match id {
            MessageId::Timer => {
                self.msg_timer(msg);
                false
            }
            MessageId::Status => {
                let dest = msg.get_value("module").unwrap_or("").to_string();
                let core = self.module();
                if dest == core.name() {
                    self.msg_status(msg);
                    return true;
                }
                if dest.is_empty() || dest == core.mtype() {
                    self.msg_status(msg);
                }
                false
            }
            MessageId::Level => {
                let dest = msg.get_value("module").unwrap_or("").to_string();
                self.set_debug(msg, &dest)
            }
            other => {
                error!(
                    "invalid relay id {} in module '{}', message '{}'",
                    other.discriminant(),
                    self.module().name(),
                    msg.name()
                );
                false
            }
        }
    }
}

/// Module-level `engine.debug` line handling, shared between the trait
/// default and implementors that only override the channel-addressed case.
pub fn module_set_debug(core: &ModuleCore, msg: &mut Message, target: &str) -> bool {
    if target != core.name() {
        return false;
    }
    let line = msg.get_value("line").unwrap_or("").trim().to_string();
    if let Some(rest) = line.strip_prefix("level") {
        if let Ok(level) = rest.trim().parse() {
            core.set_debug_level(level);
        }
    } else if line == "reset" {
        core.set_debug_level(DEFAULT_DEBUG_LEVEL);
        core.set_debug_enabled(true);
    } else if !line.is_empty() {
        let enabled = msg.get_bool_value("line", core.debug_enabled());
        core.set_debug_enabled(enabled);
    }
    let reply = format!(
        "Module {} debug {} level {}\n",
        core.name(),
        if core.debug_enabled() { "on" } else { "off" },
        core.debug_level()
    );
    msg.ret_value_mut().push_str(&reply);
    true
}
