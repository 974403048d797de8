//! Call endpoints, peer linking and the data plane seam.
//!
//! A [`CallEndpoint`] is a participant in one call. It owns named
//! [`DataEndpoint`]s (the attachment points for concrete media sources and
//! consumers, which live outside this crate) and at most one peer link to
//! another call endpoint. Peer links are symmetric: `a.peer == b` if and
//! only if `b.peer == a`, and every transition between peerings happens
//! under one process-wide mutex so no third party can observe a one-sided
//! link.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{EngineError, Result};

/// Serializes every peer-pointer mutation in the process.
///
/// Two tasks swapping peers between the same endpoints have no usable lock
/// order of their own; one coarse mutex keeps the symmetry invariant.
static PEERING: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Bounded acquisition for the peering mutex. Exceeding it means the engine
/// is deadlocked and has to restart.
const PEERING_TIMEOUT: Duration = Duration::from_secs(5);

/// A media producer attached to a data endpoint.
pub trait DataSource: Send + Sync {
    fn format(&self) -> &str {
        "slin"
    }
}

/// A media sink attached to a data endpoint.
pub trait DataConsumer: Send + Sync {
    fn format(&self) -> &str {
        "slin"
    }
}

/// Named media attachment point on a call endpoint.
///
/// The engine only wires same-named endpoints of two peers together and
/// unwires them on teardown; the actual media flow is someone else's job.
pub struct DataEndpoint {
    name: String,
    source: StdMutex<Option<Arc<dyn DataSource>>>,
    consumer: StdMutex<Option<Arc<dyn DataConsumer>>>,
    peer: StdMutex<Weak<DataEndpoint>>,
}

impl DataEndpoint {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            source: StdMutex::new(None),
            consumer: StdMutex::new(None),
            peer: StdMutex::new(Weak::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Links this endpoint with a peer endpoint, replacing any previous
    /// link on either side. `None` just disconnects.
    pub fn connect(self: &Arc<Self>, other: Option<Arc<DataEndpoint>>) -> bool {
        self.disconnect();
        let Some(other) = other else {
            return false;
        };
        other.disconnect();
        *self.peer.lock().unwrap() = Arc::downgrade(&other);
        *other.peer.lock().unwrap() = Arc::downgrade(self);
        true
    }

    /// Severs the link with the current peer endpoint, if any.
    pub fn disconnect(&self) {
        let old = std::mem::replace(&mut *self.peer.lock().unwrap(), Weak::new());
        if let Some(other) = old.upgrade() {
            let mut slot = other.peer.lock().unwrap();
            if slot.upgrade().map_or(false, |p| std::ptr::eq(&*p, self)) {
                *slot = Weak::new();
            }
        }
    }

    pub fn peer(&self) -> Option<Arc<DataEndpoint>> {
        self.peer.lock().unwrap().upgrade()
    }

    pub fn set_source(&self, source: Option<Arc<dyn DataSource>>) {
        *self.source.lock().unwrap() = source;
    }

    pub fn get_source(&self) -> Option<Arc<dyn DataSource>> {
        self.source.lock().unwrap().clone()
    }

    pub fn set_consumer(&self, consumer: Option<Arc<dyn DataConsumer>>) {
        *self.consumer.lock().unwrap() = consumer;
    }

    pub fn get_consumer(&self) -> Option<Arc<dyn DataConsumer>> {
        self.consumer.lock().unwrap().clone()
    }
}

/// Identity, peer slot and data endpoints of a call endpoint.
pub struct EndpointState {
    id: String,
    peer: StdMutex<Option<Arc<dyn CallEndpoint>>>,
    data: StdMutex<Vec<Arc<DataEndpoint>>>,
}

impl EndpointState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            peer: StdMutex::new(None),
            data: StdMutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> Option<Arc<dyn CallEndpoint>> {
        self.peer.lock().unwrap().clone()
    }

    /// Id of the current peer, or empty.
    pub fn peer_id(&self) -> String {
        self.peer()
            .map(|p| p.endpoint().id().to_string())
            .unwrap_or_default()
    }

    fn peer_is(&self, other: &Arc<dyn CallEndpoint>) -> bool {
        self.peer
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |p| endpoint_eq(p, other))
    }

    fn set_peer(&self, peer: Arc<dyn CallEndpoint>) {
        *self.peer.lock().unwrap() = Some(peer);
    }

    fn take_peer(&self) -> Option<Arc<dyn CallEndpoint>> {
        self.peer.lock().unwrap().take()
    }

    fn clear_peer_if(&self, gone: &Arc<dyn CallEndpoint>) {
        let mut slot = self.peer.lock().unwrap();
        if slot.as_ref().map_or(false, |p| endpoint_eq(p, gone)) {
            *slot = None;
        }
    }

    fn data_snapshot(&self) -> Vec<Arc<DataEndpoint>> {
        self.data.lock().unwrap().clone()
    }

    /// The named data endpoint, if present. An empty name never matches.
    pub fn get_endpoint(&self, name: &str) -> Option<Arc<DataEndpoint>> {
        if name.is_empty() {
            return None;
        }
        self.data
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// The named data endpoint, created on demand. A freshly created
    /// endpoint is linked to the current peer's endpoint of the same name.
    pub fn set_endpoint(&self, name: &str) -> Option<Arc<DataEndpoint>> {
        if name.is_empty() {
            return None;
        }
        if let Some(existing) = self.get_endpoint(name) {
            return Some(existing);
        }
        let created = DataEndpoint::new(name);
        if let Some(peer) = self.peer() {
            created.connect(peer.endpoint().get_endpoint(name));
        }
        self.data.lock().unwrap().push(created.clone());
        Some(created)
    }

    /// Removes and disconnects the named data endpoint, or every endpoint
    /// when `name` is empty.
    pub fn clear_endpoint(&self, name: &str) {
        if name.is_empty() {
            let all = std::mem::take(&mut *self.data.lock().unwrap());
            for endpoint in all {
                endpoint.disconnect();
            }
            return;
        }
        let found = {
            let mut data = self.data.lock().unwrap();
            match data.iter().position(|d| d.name() == name) {
                Some(pos) => Some(data.remove(pos)),
                None => None,
            }
        };
        if let Some(endpoint) = found {
            endpoint.disconnect();
        }
    }

    pub fn set_source(&self, source: Option<Arc<dyn DataSource>>, name: &str) {
        let endpoint = if source.is_some() {
            self.set_endpoint(name)
        } else {
            self.get_endpoint(name)
        };
        if let Some(endpoint) = endpoint {
            endpoint.set_source(source);
        }
    }

    pub fn get_source(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.get_endpoint(name).and_then(|d| d.get_source())
    }

    pub fn set_consumer(&self, consumer: Option<Arc<dyn DataConsumer>>, name: &str) {
        let endpoint = if consumer.is_some() {
            self.set_endpoint(name)
        } else {
            self.get_endpoint(name)
        };
        if let Some(endpoint) = endpoint {
            endpoint.set_consumer(consumer);
        }
    }

    pub fn get_consumer(&self, name: &str) -> Option<Arc<dyn DataConsumer>> {
        self.get_endpoint(name).and_then(|d| d.get_consumer())
    }
}

/// A participant in one call.
///
/// Implementors embed an [`EndpointState`] and may override the lifecycle
/// hooks; `connected` and `disconnected` run after the peering mutex has
/// been released, so hooks are free to talk to the bus.
#[async_trait]
pub trait CallEndpoint: Send + Sync {
    fn endpoint(&self) -> &EndpointState;

    /// Called on both sides after a successful peering.
    async fn connected(&self, _reason: Option<&str>) {}

    /// Called with `is_final == false` on the side that lost its peer (the
    /// last chance to get re-peered) and with `is_final == true` on an
    /// endpoint being torn down.
    async fn disconnected(&self, _is_final: bool, _reason: Option<&str>) {}
}

fn endpoint_eq(a: &Arc<dyn CallEndpoint>, b: &Arc<dyn CallEndpoint>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

async fn lock_peering() -> Result<tokio::sync::MutexGuard<'static, ()>> {
    match tokio::time::timeout(PEERING_TIMEOUT, PEERING.lock()).await {
        Ok(guard) => Ok(guard),
        Err(_) => {
            error!("call endpoint peering mutex deadlocked");
            Err(EngineError::PeeringDeadlock)
        }
    }
}

/// Unlinks `this` from its current peer while the peering mutex is held.
/// Data endpoints are unwired before either peer pointer is cleared.
/// Returns the former peer so the caller can notify it after unlock.
fn detach_locked(this: &Arc<dyn CallEndpoint>) -> Option<Arc<dyn CallEndpoint>> {
    this.endpoint().peer()?;
    for data in this.endpoint().data_snapshot() {
        data.disconnect();
    }
    let old = this.endpoint().take_peer();
    if let Some(old_peer) = &old {
        old_peer.endpoint().clear_peer_if(this);
    }
    old
}

/// Peers `this` with `peer`, detaching both from any current peers first.
///
/// `None` for `peer` is equivalent to [`disconnect`] and returns `false`.
/// Connecting to the current peer is a no-op returning `true`. Old peers of
/// both sides are notified with a non-final `disconnected`, then both new
/// partners get `connected`.
pub async fn connect(
    this: &Arc<dyn CallEndpoint>,
    peer: Option<Arc<dyn CallEndpoint>>,
    reason: Option<&str>,
) -> Result<bool> {
    let Some(peer) = peer else {
        disconnect(this, false, reason).await?;
        return Ok(false);
    };
    if endpoint_eq(this, &peer) {
        debug!("endpoint '{}' refusing to peer with itself", this.endpoint().id());
        return Ok(false);
    }
    if this.endpoint().peer_is(&peer) {
        return Ok(true);
    }
    debug!(
        "endpoint '{}' connecting peer '{}'",
        this.endpoint().id(),
        peer.endpoint().id()
    );

    let (old_of_this, old_of_peer) = {
        let _guard = lock_peering().await?;
        if this.endpoint().peer_is(&peer) {
            return Ok(true);
        }
        let old_of_this = detach_locked(this);
        let old_of_peer = detach_locked(&peer);
        for data in this.endpoint().data_snapshot() {
            data.connect(peer.endpoint().get_endpoint(data.name()));
        }
        this.endpoint().set_peer(peer.clone());
        peer.endpoint().set_peer(this.clone());
        (old_of_this, old_of_peer)
    };

    if let Some(old) = old_of_this {
        old.disconnected(false, reason).await;
    }
    if let Some(old) = old_of_peer {
        old.disconnected(false, reason).await;
    }
    this.connected(reason).await;
    peer.connected(reason).await;
    Ok(true)
}

/// Severs the peer link of `this`, if any.
///
/// The former peer receives a non-final `disconnected` (its re-peer
/// chance); `this` receives a final `disconnected` only when `is_final` is
/// set. Returns whether there was a peer to sever.
pub async fn disconnect(
    this: &Arc<dyn CallEndpoint>,
    is_final: bool,
    reason: Option<&str>,
) -> Result<bool> {
    let old = {
        let _guard = lock_peering().await?;
        detach_locked(this)
    };
    let Some(old) = old else {
        return Ok(false);
    };
    debug!(
        "endpoint '{}' disconnected peer '{}'",
        this.endpoint().id(),
        old.endpoint().id()
    );
    old.disconnected(false, reason).await;
    if is_final {
        this.disconnected(true, reason).await;
    }
    Ok(true)
}
