//! Engine lifecycle: the bus, the driver registry and the timer beat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use rpbx_infra_bus::{Message, MessageBus};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::driver::{Driver, DriverHandler};
use crate::error::Result;

/// Process lifecycle flags shared by every driver and channel.
pub struct EngineState {
    exiting: AtomicBool,
    restart: AtomicBool,
}

impl EngineState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            exiting: AtomicBool::new(false),
            restart: AtomicBool::new(false),
        })
    }

    /// Whether the engine is shutting down. Admission gates and re-peer
    /// attempts check this.
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub fn set_exiting(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    /// Escalates an unrecoverable condition (a peering deadlock) to a
    /// process restart: stops admitting work and flags the supervisor.
    pub fn restart(&self) {
        error!("engine restart requested");
        self.restart.store(true, Ordering::SeqCst);
        self.exiting.store(true, Ordering::SeqCst);
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }
}

/// The engine: owns the message bus, the lifecycle flags and the drivers.
pub struct Engine {
    config: EngineConfig,
    bus: Arc<MessageBus>,
    state: Arc<EngineState>,
    drivers: DashMap<String, Arc<Driver>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            bus: MessageBus::new(),
            state: EngineState::new(),
            drivers: DashMap::new(),
            tasks: StdMutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates, sets up and registers a driver.
    pub fn install_driver(
        &self,
        name: &str,
        mtype: &str,
        handler: Arc<dyn DriverHandler>,
    ) -> Arc<Driver> {
        let driver = Driver::new(name, mtype, self.bus.clone(), self.state.clone(), handler);
        driver.setup(&self.config);
        self.drivers.insert(name.to_string(), driver.clone());
        info!("installed driver '{}'", name);
        driver
    }

    pub fn driver(&self, name: &str) -> Option<Arc<Driver>> {
        self.drivers.get(name).map(|d| d.value().clone())
    }

    /// Starts the bus queue worker and the once-a-second `engine.timer`
    /// beat. Only the first call does anything.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(worker) = self.bus.spawn_worker() {
            tasks.push(worker);
        }
        let bus = self.bus.clone();
        let state = self.state.clone();
        tasks.push(tokio::spawn(async move {
            let mut beat = tokio::time::interval(Duration::from_secs(1));
            beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                beat.tick().await;
                if state.is_exiting() {
                    break;
                }
                bus.enqueue(Message::new("engine.timer"));
            }
        }));
    }

    /// Shuts the engine down: flags every admission gate closed, then lets
    /// the drivers drop their channels through `engine.halt`.
    pub async fn halt(&self, reason: &str) -> bool {
        info!("engine halting: {}", reason);
        self.state.set_exiting();
        let mut msg = Message::new("engine.halt");
        msg.set_param("reason", reason);
        self.bus.dispatch(&mut msg).await
    }

    /// Aborts the background tasks. Call after [`Engine::halt`].
    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
