//! Routing state machine scenarios: happy path, rejections, vanished
//! channels and the driver counters around them.

use std::sync::Arc;

use async_trait::async_trait;
use rpbx_call_engine::bus::{Message, MessageHandler};
use rpbx_call_engine::prelude::*;

/// Creates an outgoing channel for every execute aimed at this driver.
struct ConnectingHandler;

#[async_trait]
impl DriverHandler for ConnectingHandler {
    async fn msg_execute(&self, driver: &Arc<Driver>, msg: &mut Message, dest: &str) -> bool {
        let id = format!("{}{}", driver.prefix(), dest);
        let chan = Channel::new(driver, true, Some(id), None);
        chan.set_address(dest);
        chan.complete(msg, true);
        true
    }

    fn varchan(&self) -> bool {
        true
    }
}

/// Answers `call.route` with a fixed target.
struct RouteReply {
    target: &'static str,
}

#[async_trait]
impl MessageHandler for RouteReply {
    fn priority(&self) -> u32 {
        50
    }

    async fn handle(&self, msg: &mut Message) -> bool {
        if msg.name() != "call.route" {
            return false;
        }
        *msg.ret_value_mut() = self.target.to_string();
        true
    }
}

fn test_engine() -> Arc<Engine> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Engine::new(EngineConfig::default()).unwrap()
}

async fn run_router(driver: &Arc<Driver>, chan: &Arc<Channel>, msg: Message) {
    Router::spawn(driver.clone(), chan.id().to_string(), msg)
        .await
        .unwrap();
}

#[tokio::test]
async fn happy_path_call_ends_answered() {
    let engine = test_engine();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));
    engine
        .bus()
        .install(Arc::new(RouteReply { target: "drv/out" }));

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    assert_eq!(chan.status(), "incoming");

    run_router(&driver, &chan, Message::new("call.route")).await;

    assert_eq!(chan.status(), "answered");
    assert_eq!(driver.routed(), 1);
    assert_eq!(driver.routing(), 0);
    // the target channel was created by the execute handler
    assert!(driver.find("drv/out").is_some());
    assert!(driver.find("drv/1").is_some());
}

#[tokio::test]
async fn preset_callto_skips_the_routing_dispatch() {
    let engine = test_engine();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));
    // no RouteReply installed: a routing dispatch would find no takers

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    let mut msg = Message::new("call.route");
    msg.set_param("callto", "drv/direct");
    run_router(&driver, &chan, msg).await;

    assert_eq!(chan.status(), "answered");
    assert_eq!(driver.routed(), 1);
    assert!(driver.find("drv/direct").is_some());
}

#[tokio::test]
async fn antiloop_exhaustion_rejects_looping() {
    let engine = test_engine();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));
    engine
        .bus()
        .install(Arc::new(RouteReply { target: "drv/out" }));

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    let mut msg = Message::new("call.route");
    msg.set_param("antiloop", "0");
    run_router(&driver, &chan, msg).await;

    assert_eq!(chan.status(), "rejected");
    assert_eq!(driver.routed(), 0);
    assert_eq!(driver.routing(), 0);
    // the dynamic channel was released when routing failed
    assert!(driver.find("drv/1").is_none());
}

#[tokio::test]
async fn dash_ret_value_rejects_with_unknown() {
    let engine = test_engine();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));
    engine.bus().install(Arc::new(RouteReply { target: "-" }));

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    run_router(&driver, &chan, Message::new("call.route")).await;

    assert_eq!(chan.status(), "rejected");
    assert_eq!(driver.routed(), 0);
}

#[tokio::test]
async fn no_route_handler_rejects_with_noroute() {
    let engine = test_engine();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    run_router(&driver, &chan, Message::new("call.route")).await;

    assert_eq!(chan.status(), "rejected");
    assert_eq!(driver.routed(), 0);
    assert!(driver.find("drv/1").is_none());
}

#[tokio::test]
async fn unconnectable_target_rejects_with_noconn() {
    let engine = test_engine();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));
    // target outside this driver's prefix: the execute dispatch finds no owner
    engine
        .bus()
        .install(Arc::new(RouteReply { target: "nowhere/9" }));

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    run_router(&driver, &chan, Message::new("call.route")).await;

    assert_eq!(chan.status(), "rejected");
    assert_eq!(driver.routed(), 0);
}

/// Route handler that tears the channel down mid-routing.
struct VanishingReply {
    chan: std::sync::Mutex<Option<Arc<Channel>>>,
}

#[async_trait]
impl MessageHandler for VanishingReply {
    fn priority(&self) -> u32 {
        50
    }

    async fn handle(&self, msg: &mut Message) -> bool {
        if msg.name() != "call.route" {
            return false;
        }
        let chan = self.chan.lock().unwrap().take();
        if let Some(chan) = chan {
            chan.release().await;
        }
        *msg.ret_value_mut() = "drv/out".to_string();
        true
    }
}

#[tokio::test]
async fn vanished_channel_aborts_the_router() {
    let engine = test_engine();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    engine.bus().install(Arc::new(VanishingReply {
        chan: std::sync::Mutex::new(Some(chan.clone())),
    }));

    run_router(&driver, &chan, Message::new("call.route")).await;

    // neither accepted nor rejected: the run was abandoned
    assert_eq!(chan.status(), "incoming");
    assert_eq!(driver.routed(), 0);
    assert_eq!(driver.routing(), 0);
}

#[tokio::test]
async fn accepted_call_with_targetid_does_not_autoanswer() {
    let engine = test_engine();

    struct TargetingHandler;

    #[async_trait]
    impl DriverHandler for TargetingHandler {
        async fn msg_execute(&self, driver: &Arc<Driver>, msg: &mut Message, dest: &str) -> bool {
            let id = format!("{}{}", driver.prefix(), dest);
            let chan = Channel::new(driver, true, Some(id), None);
            msg.set_param("targetid", chan.id());
            true
        }
    }

    let driver = engine.install_driver("drv", "test", Arc::new(TargetingHandler));
    engine
        .bus()
        .install(Arc::new(RouteReply { target: "drv/out" }));

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    run_router(&driver, &chan, Message::new("call.route")).await;

    assert_eq!(chan.status(), "accepted");
    assert_eq!(chan.targetid(), "drv/out");
    assert_eq!(driver.routed(), 1);
}

#[tokio::test]
async fn autoring_flag_rings_instead_of_answering() {
    let engine = test_engine();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));
    engine
        .bus()
        .install(Arc::new(RouteReply { target: "drv/out" }));

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    let mut msg = Message::new("call.route");
    msg.set_param("autoring", "yes");
    msg.set_param("autoanswer", "no");
    run_router(&driver, &chan, msg).await;

    assert_eq!(chan.status(), "ringing");
}

#[tokio::test]
async fn start_router_runs_the_state_machine() {
    let engine = test_engine();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));
    engine
        .bus()
        .install(Arc::new(RouteReply { target: "drv/out" }));

    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    chan.start_router(Message::new("call.route")).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while driver.routed() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("the spawned router should finish");
    assert_eq!(chan.status(), "answered");
    assert_eq!(driver.routing(), 0);
}

#[tokio::test]
async fn start_router_rejects_without_a_driver() {
    let engine = test_engine();
    let driver = Driver::new(
        "drv",
        "test",
        engine.bus().clone(),
        engine.state().clone(),
        Arc::new(ConnectingHandler),
    );
    driver.setup(engine.config());
    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);

    drop(driver);
    let result = chan.start_router(Message::new("call.route"));
    assert!(matches!(result, Err(EngineError::RouterFailed(_))));
    assert_eq!(chan.status(), "rejected");
}

/// Route handler that parks until released, so the test can observe the
/// in-flight routing counter.
struct BlockingReply {
    entered: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    release: tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
}

#[async_trait]
impl MessageHandler for BlockingReply {
    fn priority(&self) -> u32 {
        50
    }

    async fn handle(&self, msg: &mut Message) -> bool {
        if msg.name() != "call.route" {
            return false;
        }
        if let Some(entered) = self.entered.lock().unwrap().take() {
            let _ = entered.send(());
        }
        if let Some(release) = self.release.lock().await.take() {
            let _ = release.await;
        }
        *msg.ret_value_mut() = "-".to_string();
        true
    }
}

#[tokio::test]
async fn routing_respects_maxroute_admission() {
    let engine = Engine::new(EngineConfig {
        maxroute: 1,
        ..Default::default()
    })
    .unwrap();
    let driver = engine.install_driver("drv", "test", Arc::new(ConnectingHandler));

    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel();
    engine.bus().install(Arc::new(BlockingReply {
        entered: std::sync::Mutex::new(Some(entered_tx)),
        release: tokio::sync::Mutex::new(Some(release_rx)),
    }));

    assert!(driver.can_route());
    let chan = Channel::new(&driver, false, Some("drv/1".into()), None);
    let router = Router::spawn(driver.clone(), chan.id().to_string(), Message::new("call.route"));

    entered_rx.await.unwrap();
    assert_eq!(driver.routing(), 1);
    assert!(!driver.can_route());
    assert!(!driver.can_accept(true));
    assert!(driver.can_accept(false));

    release_tx.send(()).unwrap();
    router.await.unwrap();
    assert_eq!(driver.routing(), 0);
    assert!(driver.can_route());
}
