//! Session lifecycle tests against mock collaborators

use std::sync::{Arc, Mutex};
use std::time::Duration;

use whisper_engine::mock::{
    BridgeStart, MockFailure, MockPortAllocator, MockProxyBridge, MockRoutingEngine,
    MockTunProvider, TunOutcome,
};
use whisper_engine::{
    Config, Error, EventHandler, SessionEvent, SessionManager, SessionState, StopReason,
    DEFAULT_REMOTE_URL, DEFAULT_RESOLVER_URL,
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    fn errors(&self) -> usize {
        self.count(|e| matches!(e, SessionEvent::Error { .. }))
    }

    fn disconnects(&self) -> usize {
        self.count(|e| matches!(e, SessionEvent::Disconnected { .. }))
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
    async fn on_event(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct Harness {
    session: Arc<SessionManager>,
    ports: Arc<MockPortAllocator>,
    bridge: Arc<MockProxyBridge>,
    provider: Arc<MockTunProvider>,
    engine: Arc<MockRoutingEngine>,
    events: Arc<RecordingHandler>,
}

struct Setup {
    config: Config,
    ports: MockPortAllocator,
    bridge: MockProxyBridge,
    provider: MockTunProvider,
    engine: MockRoutingEngine,
}

impl Default for Setup {
    fn default() -> Self {
        let mut config = Config::default();
        config.shutdown.grace_ms = 1000;
        config.shutdown.force_ms = 200;

        Self {
            config,
            ports: MockPortAllocator::new(51820),
            bridge: MockProxyBridge::new(),
            provider: MockTunProvider::new(),
            engine: MockRoutingEngine::new(),
        }
    }
}

impl Setup {
    fn build(self) -> Harness {
        let ports = Arc::new(self.ports);
        let bridge = Arc::new(self.bridge);
        let provider = Arc::new(self.provider);
        let engine = Arc::new(self.engine);
        let events = Arc::new(RecordingHandler::default());

        let session = SessionManager::new(
            &self.config,
            ports.clone(),
            bridge.clone(),
            provider.clone(),
            engine.clone(),
        )
        .with_event_handler(events.clone());

        Harness {
            session: Arc::new(session),
            ports,
            bridge,
            provider,
            engine,
            events,
        }
    }
}

fn harness() -> Harness {
    Setup::default().build()
}

async fn wait_for_state(session: &SessionManager, state: SessionState) {
    let mut rx = session.subscribe();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

#[tokio::test]
async fn test_connect_reaches_running() {
    let h = harness();

    h.session
        .connect("wss://relay.test/", "https://resolver.test/dns-query")
        .await
        .unwrap();

    assert_eq!(h.session.state(), SessionState::Running);
    assert_eq!(h.ports.calls(), 1);
    assert_eq!(
        h.bridge.starts(),
        vec![BridgeStart {
            remote_url: "wss://relay.test/".into(),
            port: 51820,
            resolver_url: "https://resolver.test/dns-query".into(),
        }]
    );

    assert!(h.engine.wait_for_start(WAIT).await);
    assert_eq!(h.engine.start_calls(), 1);
    let keys = h.engine.keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].proxy(), "socks5://127.0.0.1:51820");
    assert!(keys[0].device().starts_with("fd://"));
    assert_eq!(keys[0].mtu(), 1500);
    assert_eq!(keys[0].mark(), 0);

    let status = h.session.status();
    assert_eq!(status.proxy_port, Some(51820));
    assert_eq!(status.tun_name.as_deref(), Some("whisper"));
    assert_eq!(status.remote_url.as_deref(), Some("wss://relay.test/"));
    assert!(status.last_error.is_none());

    assert_eq!(
        h.events.count(|e| matches!(e, SessionEvent::Connected { proxy_port: 51820, .. })),
        1
    );

    h.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_interface_request() {
    let h = harness();
    h.session.connect("", "").await.unwrap();

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let ipv4 = request.ipv4.clone().unwrap();
    assert_eq!(ipv4.address.to_string(), "10.0.0.2");
    assert_eq!(ipv4.prefix_len, 24);
    assert_eq!(request.routes[0].to_string(), "0.0.0.0/0");
    assert_eq!(request.dns_servers[0].to_string(), "10.0.0.144");
    assert_eq!(request.mtu, 1500);
    assert!(!request.blocking);
    assert_eq!(request.excluded_apps.len(), 1);

    h.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_blank_urls_use_defaults() {
    let h = harness();
    h.session.connect("", "").await.unwrap();

    let start = &h.bridge.starts()[0];
    assert_eq!(start.remote_url, DEFAULT_REMOTE_URL);
    assert_eq!(start.resolver_url, DEFAULT_RESOLVER_URL);

    h.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_bare_hosts_are_normalized() {
    let h = harness();
    h.session.connect("example.com", "example.org").await.unwrap();

    let start = &h.bridge.starts()[0];
    assert_eq!(start.remote_url, "wss://example.com/");
    assert_eq!(start.resolver_url, "https://example.org");

    h.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_port_unavailable_aborts_before_bridge() {
    let h = Setup {
        ports: MockPortAllocator::exhausted(),
        ..Default::default()
    }
    .build();

    let err = h.session.connect("relay.test", "").await.unwrap_err();

    assert!(matches!(err, Error::PortUnavailable(_)));
    assert_eq!(h.bridge.start_calls(), 0);
    assert_eq!(h.bridge.stop_calls(), 0);
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.events.errors(), 1);

    let status = h.session.status();
    assert!(status.proxy_port.is_none());
    assert!(status.remote_url.is_none());
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_bridge_error_aborts() {
    let h = Setup {
        bridge: MockProxyBridge::failing(MockFailure::Error),
        ..Default::default()
    }
    .build();

    let err = h.session.connect("relay.test", "").await.unwrap_err();

    assert!(matches!(err, Error::BridgeStartFailed(_)));
    assert_eq!(h.provider.establish_calls(), 0);
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.events.errors(), 1);
}

#[tokio::test]
async fn test_bridge_panic_is_contained() {
    let h = Setup {
        bridge: MockProxyBridge::failing(MockFailure::Panic),
        ..Default::default()
    }
    .build();

    let err = h.session.connect("relay.test", "").await.unwrap_err();

    match err {
        Error::BridgeStartFailed(message) => assert!(message.contains("native code")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(h.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_interface_failure_stops_bridge_once() {
    for outcome in [TunOutcome::Fail, TunOutcome::Decline] {
        let h = Setup {
            provider: MockTunProvider::with_outcome(outcome),
            ..Default::default()
        }
        .build();

        let err = h.session.connect("relay.test", "").await.unwrap_err();

        assert!(matches!(err, Error::InterfaceEstablishFailed(_)), "{:?}", outcome);
        assert_eq!(h.bridge.start_calls(), 1);
        assert_eq!(h.bridge.stop_calls(), 1);
        assert_eq!(h.engine.start_calls(), 0);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.events.errors(), 1);
    }
}

#[tokio::test]
async fn test_connect_while_running_is_rejected() {
    let h = harness();
    h.session.connect("wss://relay.test/", "").await.unwrap();
    let before = h.session.status();

    let err = h
        .session
        .connect("wss://other.test/", "https://other.test")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AlreadyRunning));
    let after = h.session.status();
    assert_eq!(after.state, SessionState::Running);
    assert_eq!(after.proxy_port, before.proxy_port);
    assert_eq!(after.remote_url, before.remote_url);
    assert_eq!(after.resolver_url, before.resolver_url);
    assert_eq!(after.tun_name, before.tun_name);
    assert_eq!(h.ports.calls(), 1);
    assert_eq!(h.bridge.start_calls(), 1);
    assert_eq!(h.provider.establish_calls(), 1);

    h.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_when_idle_is_noop() {
    let h = harness();

    h.session.disconnect().await.unwrap();
    h.session.revoke().await.unwrap();

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.bridge.stop_calls(), 0);
    assert_eq!(h.engine.stop_calls(), 0);
    assert_eq!(h.events.disconnects(), 0);
}

#[tokio::test]
async fn test_concurrent_disconnects_tear_down_once() {
    let h = harness();
    h.session.connect("wss://relay.test/", "").await.unwrap();
    assert!(h.engine.wait_for_start(WAIT).await);

    let (a, b, c) = tokio::join!(
        h.session.disconnect(),
        h.session.disconnect(),
        h.session.revoke()
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.engine.stop_calls(), 1);
    assert_eq!(h.bridge.stop_calls(), 1);
    assert_eq!(h.events.disconnects(), 1);
    assert!(h.events.events().iter().any(|e| matches!(
        e,
        SessionEvent::Disconnected {
            reason: StopReason::Requested
        }
    )));
}

#[tokio::test]
async fn test_concurrent_disconnects_across_tasks() {
    let h = harness();
    h.session.connect("wss://relay.test/", "").await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let session = h.session.clone();
            tokio::spawn(async move { session.disconnect().await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Late callers may return before the first teardown finishes
    wait_for_state(&h.session, SessionState::Idle).await;
    assert_eq!(h.engine.stop_calls(), 1);
    assert_eq!(h.bridge.stop_calls(), 1);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let h = harness();

    h.session.connect("wss://relay.test/", "").await.unwrap();
    h.session.disconnect().await.unwrap();
    h.session.connect("wss://relay.test/", "").await.unwrap();

    assert_eq!(h.session.state(), SessionState::Running);
    assert_eq!(h.bridge.start_calls(), 2);
    assert_eq!(h.provider.establish_calls(), 2);

    h.session.disconnect().await.unwrap();
    assert_eq!(h.bridge.stop_calls(), 2);
}

#[tokio::test]
async fn test_engine_failure_keeps_session_running() {
    for failure in [MockFailure::Error, MockFailure::Panic] {
        let h = Setup {
            engine: MockRoutingEngine::failing(failure.clone()),
            ..Default::default()
        }
        .build();

        h.session.connect("wss://relay.test/", "").await.unwrap();
        assert!(h.engine.wait_for_start(WAIT).await);

        tokio::time::timeout(WAIT, async {
            while h.events.count(|e| matches!(e, SessionEvent::EngineFailed { .. })) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no engine failure event");

        assert_eq!(h.session.state(), SessionState::Running);
        assert!(h.session.status().last_error.is_some());
        assert_eq!(h.events.errors(), 0);

        h.session.disconnect().await.unwrap();
        assert_eq!(h.engine.stop_calls(), 1);
        assert_eq!(h.bridge.stop_calls(), 1);
    }
}

#[tokio::test]
async fn test_disconnect_during_starting_is_queued() {
    let h = Setup {
        bridge: MockProxyBridge::with_start_delay(Duration::from_millis(200)),
        ..Default::default()
    }
    .build();

    let session = h.session.clone();
    let connect = tokio::spawn(async move { session.connect("wss://relay.test/", "").await });
    wait_for_state(&h.session, SessionState::Starting).await;

    h.session.disconnect().await.unwrap();
    connect.await.unwrap().unwrap();

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.bridge.start_calls(), 1);
    assert_eq!(h.bridge.stop_calls(), 1);
    assert_eq!(h.events.disconnects(), 1);
}

#[tokio::test]
async fn test_slow_teardown_is_cancelled() {
    let mut setup = Setup {
        engine: MockRoutingEngine::with_stop_delay(Duration::from_secs(30)),
        ..Default::default()
    };
    setup.config.shutdown.grace_ms = 50;
    setup.config.shutdown.force_ms = 200;
    let h = setup.build();

    h.session.connect("wss://relay.test/", "").await.unwrap();
    assert!(h.engine.wait_for_start(WAIT).await);

    tokio::time::timeout(WAIT, h.session.disconnect())
        .await
        .expect("teardown wait was not bounded")
        .unwrap();

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.engine.stop_calls(), 1);
    // Cancelled while the engine was stopping; the bridge is stopped anyway
    assert_eq!(h.bridge.stop_calls(), 1);
    assert!(!h.session.status().shutting_down);

    // The session is usable again
    h.session.connect("wss://relay.test/", "").await.unwrap();
    assert_eq!(h.session.state(), SessionState::Running);
}

#[tokio::test]
async fn test_interrupted_teardown_returns_to_idle() {
    let mut setup = Setup {
        engine: MockRoutingEngine::with_stop_delay(Duration::from_secs(30)),
        ..Default::default()
    };
    setup.config.shutdown.grace_ms = 10_000;
    let h = setup.build();

    h.session.connect("wss://relay.test/", "").await.unwrap();

    let session = h.session.clone();
    let disconnect = tokio::spawn(async move { session.disconnect_with(StopReason::ProcessExit).await });
    wait_for_state(&h.session, SessionState::Stopping).await;

    h.session.interrupt_teardown();
    let result = tokio::time::timeout(WAIT, disconnect)
        .await
        .expect("interrupt did not end the teardown wait")
        .unwrap();

    assert!(matches!(result, Err(Error::TeardownInterrupted)));
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.events.disconnects(), 1);
    assert_eq!(h.engine.stop_calls(), 1);
    assert_eq!(h.bridge.stop_calls(), 1);
}

#[tokio::test]
async fn test_teardown_never_leaves_engine_running() {
    let engines = [
        MockRoutingEngine::new().start_delay(Duration::from_millis(100)),
        MockRoutingEngine::new().insert_delay(Duration::from_millis(50)),
    ];
    for engine in engines {
        let h = Setup {
            engine,
            ..Default::default()
        }
        .build();

        h.session.connect("wss://relay.test/", "").await.unwrap();
        h.session.disconnect().await.unwrap();

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.engine.is_running());
        assert_eq!(h.engine.keys().len(), 1);
        assert_eq!(h.engine.stop_calls(), 1);
        assert_eq!(h.bridge.stop_calls(), 1);

        // A start still queued behind the teardown must not revive the engine
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!h.engine.is_running());
    }
}

#[tokio::test]
async fn test_hung_engine_start_is_cancelled_and_stopped() {
    let mut setup = Setup {
        engine: MockRoutingEngine::new().start_delay(Duration::from_secs(30)),
        ..Default::default()
    };
    setup.config.shutdown.grace_ms = 50;
    let h = setup.build();

    h.session.connect("wss://relay.test/", "").await.unwrap();
    assert!(h.engine.wait_for_start(WAIT).await);

    tokio::time::timeout(WAIT, h.session.disconnect())
        .await
        .expect("teardown wait was not bounded")
        .unwrap();

    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(!h.engine.is_running());
    assert_eq!(h.engine.stop_calls(), 1);
    assert_eq!(h.bridge.stop_calls(), 1);

    h.session.connect("wss://relay.test/", "").await.unwrap();
    assert_eq!(h.session.state(), SessionState::Running);
}

#[tokio::test]
async fn test_engine_failure_during_teardown_stays_with_old_session() {
    let h = Setup {
        engine: MockRoutingEngine::failing(MockFailure::Error).start_delay(Duration::from_millis(100)),
        ..Default::default()
    }
    .build();

    h.session.connect("wss://relay.test/", "").await.unwrap();
    h.session.disconnect().await.unwrap();

    h.session.connect("wss://relay.test/", "").await.unwrap();
    assert!(h.session.status().last_error.is_none());

    h.session.disconnect().await.unwrap();
    assert_eq!(h.engine.stop_calls(), 2);
}
