//! Driver registry and dispatch: message targeting, admission, timer
//! sweeps, masquerade, status output and shutdown behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rpbx_call_engine::bus::{clock, Message, MessageHandler};
use rpbx_call_engine::prelude::*;

struct CountingHandler {
    executes: AtomicU32,
}

#[async_trait]
impl DriverHandler for CountingHandler {
    async fn msg_execute(&self, driver: &Arc<Driver>, _msg: &mut Message, dest: &str) -> bool {
        self.executes.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}{}", driver.prefix(), dest);
        Channel::new(driver, false, Some(id), None);
        true
    }
}

fn counting_handler() -> Arc<CountingHandler> {
    Arc::new(CountingHandler {
        executes: AtomicU32::new(0),
    })
}

fn test_engine(config: EngineConfig) -> Arc<Engine> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Engine::new(config).unwrap()
}

#[tokio::test]
async fn execute_needs_the_driver_prefix() {
    let engine = test_engine(EngineConfig::default());
    let handler = counting_handler();
    let driver = engine.install_driver("drv", "test", handler.clone());

    let mut foreign = Message::new("call.execute");
    foreign.set_param("callto", "other/1");
    assert!(!engine.bus().dispatch(&mut foreign).await);
    assert_eq!(handler.executes.load(Ordering::SeqCst), 0);

    let mut owned = Message::new("call.execute");
    owned.set_param("callto", "drv/1");
    assert!(engine.bus().dispatch(&mut owned).await);
    assert_eq!(handler.executes.load(Ordering::SeqCst), 1);
    assert!(driver.find("drv/1").is_some());
}

#[tokio::test]
async fn execute_is_refused_once_maxchans_is_reached() {
    let engine = test_engine(EngineConfig {
        maxchans: 1,
        ..Default::default()
    });
    let handler = counting_handler();
    let driver = engine.install_driver("drv", "test", handler.clone());

    let mut first = Message::new("call.execute");
    first.set_param("callto", "drv/a");
    assert!(engine.bus().dispatch(&mut first).await);
    assert_eq!(driver.chan_count(), 1);
    assert!(!driver.can_accept(false));

    let mut second = Message::new("call.execute");
    second.set_param("callto", "drv/b");
    assert!(!engine.bus().dispatch(&mut second).await);
    assert_eq!(handler.executes.load(Ordering::SeqCst), 1);
    assert_eq!(driver.chan_count(), 1);
}

#[tokio::test]
async fn targeted_messages_only_reach_incoming_channels() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let incoming = Channel::new(&driver, false, Some("drv/in".into()), None);
    let outgoing = Channel::new(&driver, true, Some("drv/out".into()), None);

    let mut ring_in = Message::new("call.ringing");
    ring_in.set_param("targetid", "drv/in");
    assert!(engine.bus().dispatch(&mut ring_in).await);
    assert_eq!(incoming.status(), "ringing");

    let mut ring_out = Message::new("call.ringing");
    ring_out.set_param("targetid", "drv/out");
    assert!(!engine.bus().dispatch(&mut ring_out).await);
    assert_eq!(outgoing.status(), "outgoing");

    let mut missing = Message::new("call.ringing");
    missing.set_param("targetid", "drv/nope");
    assert!(!engine.bus().dispatch(&mut missing).await);
}

#[tokio::test]
async fn locate_binds_the_channel_as_user_data() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let chan = Channel::new(&driver, false, Some("drv/5".into()), None);

    let mut locate = Message::new("chan.locate");
    locate.set_param("id", "drv/5");
    assert!(engine.bus().dispatch(&mut locate).await);
    let found = locate.user_data_as::<Channel>().expect("located channel");
    assert_eq!(found.id(), chan.id());
}

#[tokio::test]
async fn masquerade_rewrites_in_flight_and_redispatches() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let chan = Channel::new(&driver, false, Some("drv/5".into()), None);

    let mut msg = Message::new("chan.masquerade");
    msg.set_param("id", "drv/5");
    msg.set_param("message", "call.drop");
    msg.set_param("reason", "bye");

    // the drop relay picks the rewritten message up in the same pass
    assert!(engine.bus().dispatch(&mut msg).await);
    assert_eq!(msg.name(), "call.drop");
    assert!(msg.get_value("message").is_none());
    let carried = msg.user_data_as::<Channel>().expect("channel as user-data");
    assert_eq!(carried.id(), "drv/5");
    assert_eq!(chan.status(), "bye");
    assert!(driver.find("drv/5").is_none());
}

#[tokio::test]
async fn masquerade_without_new_name_is_ignored() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let _chan = Channel::new(&driver, false, Some("drv/5".into()), None);

    let mut msg = Message::new("chan.masquerade");
    msg.set_param("id", "drv/5");
    assert!(!engine.bus().dispatch(&mut msg).await);
    assert_eq!(msg.name(), "chan.masquerade");
}

#[tokio::test]
async fn timer_sweep_drops_expired_channels() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let timed_out = Channel::new(&driver, false, Some("drv/3".into()), None);
    let unanswered = Channel::new(&driver, false, Some("drv/4".into()), None);
    let healthy = Channel::new(&driver, false, Some("drv/5".into()), None);

    timed_out.set_timeout_at(clock::now_usecs() - 1);
    unanswered.set_maxcall_at(clock::now_usecs() - 1);
    healthy.set_timeout_at(clock::now_usecs() + 60_000_000);

    let mut tick = Message::new("engine.timer");
    engine.bus().dispatch(&mut tick).await;

    assert_eq!(timed_out.status(), "timeout");
    assert_eq!(unanswered.status(), "noanswer");
    assert!(driver.find("drv/3").is_none());
    assert!(driver.find("drv/4").is_none());
    assert!(driver.find("drv/5").is_some());
    assert_eq!(healthy.status(), "incoming");
}

#[tokio::test]
async fn running_engine_enforces_deadlines_on_its_own() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    engine.start();
    engine.start(); // second call is a no-op

    let chan = Channel::new(&driver, false, Some("drv/slow".into()), None);
    assert!(driver.is_busy());
    chan.set_timeout_at(clock::now_usecs() - 1);

    tokio::time::timeout(Duration::from_secs(3), async {
        while driver.find("drv/slow").is_some() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("the timer beat should drop the expired channel");
    assert_eq!(chan.status(), "timeout");
    assert!(!driver.is_busy());
}

#[tokio::test]
async fn drop_addressing_rules() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());

    // exact driver name: drop all, consumed
    Channel::new(&driver, false, None, None);
    let mut by_name = Message::new("call.drop");
    by_name.set_param("id", "drv");
    assert!(engine.bus().dispatch(&mut by_name).await);
    assert_eq!(driver.chan_count(), 0);

    // driver type: drop all, but left for other drivers of the same type
    Channel::new(&driver, false, None, None);
    let mut by_type = Message::new("call.drop");
    by_type.set_param("id", "test");
    assert!(!engine.bus().dispatch(&mut by_type).await);
    assert_eq!(driver.chan_count(), 0);

    // empty destination: wholesale drop, not consumed
    Channel::new(&driver, false, None, None);
    let mut broadcast = Message::new("call.drop");
    assert!(!engine.bus().dispatch(&mut broadcast).await);
    assert_eq!(driver.chan_count(), 0);

    // targeted drop with a reason
    let chan = Channel::new(&driver, false, Some("drv/x".into()), None);
    let mut targeted = Message::new("call.drop");
    targeted.set_param("id", "drv/x");
    targeted.set_param("reason", "admin");
    assert!(engine.bus().dispatch(&mut targeted).await);
    assert_eq!(chan.status(), "admin");
}

#[tokio::test]
async fn halt_drops_everything_and_passes_on() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let chan = Channel::new(&driver, false, None, None);

    assert!(!engine.halt("test shutdown").await);
    assert_eq!(driver.chan_count(), 0);
    assert_eq!(chan.status(), "dropped");
    assert!(engine.state().is_exiting());
    assert!(!driver.can_accept(false));
    assert!(!driver.can_route());
}

#[tokio::test]
async fn status_report_lists_counters_and_channels() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let a = Channel::new(&driver, false, Some("drv/1".into()), None);
    let b = Channel::new(&driver, true, Some("drv/2".into()), None);
    a.set_address("sip:alice@example.org");
    a.connect(Some(b.clone() as Arc<dyn CallEndpoint>), None)
        .await
        .unwrap();

    let mut status = Message::new("engine.status");
    status.set_param("module", "drv");
    assert!(engine.bus().dispatch(&mut status).await);

    let report = status.ret_value();
    assert!(report.starts_with("name=drv,type=test,format=Status|Address|Peer;"));
    assert!(report.contains("routed=0,routing=0,total=2,chans=2;"));
    assert!(report.contains("drv/1=incoming|sip:alice@example.org|drv/2"));
    assert!(report.contains("drv/2=outgoing||drv/1"));
}

#[tokio::test]
async fn debug_command_routes_to_module_or_channel() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let _chan = Channel::new(&driver, false, Some("drv/1".into()), None);

    let mut module_line = Message::new("engine.debug");
    module_line.set_param("module", "drv");
    module_line.set_param("line", "level 7");
    assert!(engine.bus().dispatch(&mut module_line).await);
    assert!(module_line.ret_value().contains("Module drv debug on level 7"));

    let mut chan_line = Message::new("engine.debug");
    chan_line.set_param("module", "drv/1");
    chan_line.set_param("line", "level 3");
    assert!(engine.bus().dispatch(&mut chan_line).await);
    assert!(chan_line.ret_value().contains("Channel drv/1 debug on level 3"));
}

struct DisconnectCounter {
    seen: AtomicU32,
    last_peer: std::sync::Mutex<Option<String>>,
}

#[async_trait]
impl MessageHandler for DisconnectCounter {
    fn priority(&self) -> u32 {
        50
    }

    async fn handle(&self, msg: &mut Message) -> bool {
        if msg.name() != "chan.disconnected" {
            return false;
        }
        self.seen.fetch_add(1, Ordering::SeqCst);
        *self.last_peer.lock().unwrap() = msg.user_data_as::<Channel>().map(|c| c.id().to_string());
        true
    }
}

#[tokio::test]
async fn losing_a_peer_offers_a_repeer_chance() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let counter = Arc::new(DisconnectCounter {
        seen: AtomicU32::new(0),
        last_peer: std::sync::Mutex::new(None),
    });
    engine.bus().install(counter.clone());
    engine.bus().spawn_worker();

    let a = Channel::new(&driver, false, Some("drv/a".into()), None);
    let b = Channel::new(&driver, true, Some("drv/b".into()), None);
    a.connect(Some(b.clone() as Arc<dyn CallEndpoint>), None)
        .await
        .unwrap();

    a.disconnect(Some("hangup")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while counter.seen.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("the abandoned peer should announce itself");

    // the side that lost its peer rides along as user-data
    assert_eq!(counter.last_peer.lock().unwrap().as_deref(), Some("drv/b"));
}

#[tokio::test]
async fn shutdown_suppresses_the_repeer_chance() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let counter = Arc::new(DisconnectCounter {
        seen: AtomicU32::new(0),
        last_peer: std::sync::Mutex::new(None),
    });
    engine.bus().install(counter.clone());
    engine.bus().spawn_worker();

    let a = Channel::new(&driver, false, Some("drv/a".into()), None);
    let b = Channel::new(&driver, true, Some("drv/b".into()), None);
    a.connect(Some(b.clone() as Arc<dyn CallEndpoint>), None)
        .await
        .unwrap();

    engine.state().set_exiting();
    a.disconnect(Some("shutdown")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(counter.seen.load(Ordering::SeqCst), 0);
    assert!(a.endpoint().peer().is_none());
    assert!(b.endpoint().peer().is_none());
}

#[tokio::test]
async fn concurrent_peer_swap_between_channels() {
    let engine = test_engine(EngineConfig::default());
    let driver = engine.install_driver("drv", "test", counting_handler());
    let a = Channel::new(&driver, false, Some("drv/a".into()), None);
    let b = Channel::new(&driver, true, Some("drv/b".into()), None);
    let p1 = Channel::new(&driver, true, Some("drv/p1".into()), None);
    let p2 = Channel::new(&driver, false, Some("drv/p2".into()), None);

    a.connect(Some(p1.clone() as Arc<dyn CallEndpoint>), None)
        .await
        .unwrap();
    b.connect(Some(p2.clone() as Arc<dyn CallEndpoint>), None)
        .await
        .unwrap();

    let (r1, r2) = tokio::join!(
        a.connect(Some(b.clone() as Arc<dyn CallEndpoint>), Some("swap")),
        b.connect(Some(a.clone() as Arc<dyn CallEndpoint>), Some("swap")),
    );
    assert!(r1.unwrap() || r2.unwrap());

    assert_eq!(a.endpoint().peer_id(), "drv/b");
    assert_eq!(b.endpoint().peer_id(), "drv/a");
    assert!(p1.endpoint().peer().is_none());
    assert!(p2.endpoint().peer().is_none());
}
