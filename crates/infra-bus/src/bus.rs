//! The message bus: handler registration, dispatch and the queue worker.

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::handler::MessageHandler;
use crate::message::Message;

/// Process-wide message bus.
///
/// `dispatch` walks the installed handlers synchronously (in the caller's
/// task) in ascending priority order, stopping at the first handler that
/// consumes the message. `enqueue` hands the message to a background worker
/// started with [`MessageBus::spawn_worker`], which dispatches and then
/// drops it.
pub struct MessageBus {
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    queue_tx: mpsc::UnboundedSender<Message>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl MessageBus {
    pub fn new() -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            handlers: RwLock::new(Vec::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    /// Installs a handler, keeping the chain sorted by priority. Handlers of
    /// equal priority keep installation order.
    pub fn install(&self, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.handlers.write().unwrap();
        let priority = handler.priority();
        let pos = handlers
            .iter()
            .position(|h| h.priority() > priority)
            .unwrap_or(handlers.len());
        handlers.insert(pos, handler);
    }

    /// Removes the given handler instance. Returns whether it was installed.
    pub fn uninstall(&self, handler: &Arc<dyn MessageHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        let target = Arc::as_ptr(handler) as *const ();
        let before = handlers.len();
        handlers.retain(|h| Arc::as_ptr(h) as *const () != target);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    /// Runs the message through the handler chain. Returns whether any
    /// handler consumed it.
    ///
    /// The handler list is snapshotted first: handlers are free to re-enter
    /// the bus (masquerade does) and to install or remove handlers while a
    /// dispatch is in flight.
    pub async fn dispatch(&self, msg: &mut Message) -> bool {
        msg.touch();
        let snapshot: Vec<Arc<dyn MessageHandler>> =
            self.handlers.read().unwrap().iter().cloned().collect();
        for handler in snapshot {
            if handler.handle(msg).await {
                trace!("message '{}' consumed", msg.name());
                return true;
            }
        }
        trace!("message '{}' not consumed", msg.name());
        false
    }

    /// Queues a message for the background worker. Fire-and-forget; returns
    /// `false` only when the queue is gone.
    pub fn enqueue(&self, msg: Message) -> bool {
        self.queue_tx.send(msg).is_ok()
    }

    /// Starts the queue worker task. Returns `None` if it was already
    /// started.
    pub fn spawn_worker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.queue_rx.lock().unwrap().take()?;
        let bus = Arc::clone(self);
        Some(tokio::spawn(async move {
            debug!("message queue worker started");
            while let Some(mut msg) = rx.recv().await {
                let handled = bus.dispatch(&mut msg).await;
                trace!("queued message '{}' handled={}", msg.name(), handled);
            }
            debug!("message queue worker stopped");
        }))
    }
}
