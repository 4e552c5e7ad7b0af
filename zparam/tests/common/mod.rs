use std::sync::LazyLock;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use zenoh::Wait;
use zenoh::config::WhatAmI;
use zparam::config::BrokerConfig;

/// Port counter for per-test routers, offset by process id so parallel test
/// binaries do not collide
static NEXT_PORT: LazyLock<AtomicU16> = LazyLock::new(|| {
    let pid = std::process::id();
    let base_port = 30000 + ((pid % 10000) as u16);
    println!("Test process {} using base port {}", pid, base_port);
    AtomicU16::new(base_port)
});

/// An in-process zenoh router standing in for the broker
pub struct TestRouter {
    pub port: u16,
    _session: zenoh::Session,
}

impl TestRouter {
    pub fn new() -> Self {
        Self::on_port(NEXT_PORT.fetch_add(1, Ordering::SeqCst))
    }

    /// Router listening on a given port, e.g. to restart a stopped one
    pub fn on_port(port: u16) -> Self {
        let endpoint = format!("tcp/127.0.0.1:{}", port);

        let mut config = zenoh::Config::default();
        config.set_mode(Some(WhatAmI::Router)).unwrap();
        config
            .insert_json5("listen/endpoints", &format!("[\"{}\"]", endpoint))
            .unwrap();
        config
            .insert_json5("scouting/multicast/enabled", "false")
            .unwrap();

        let session = zenoh::open(config)
            .wait()
            .expect("Failed to open Zenoh router session");
        thread::sleep(Duration::from_millis(500));
        println!("Zenoh router ready on {}", endpoint);

        Self {
            port,
            _session: session,
        }
    }

    /// Close the router session, dropping every client transport
    #[allow(dead_code)]
    pub fn stop(self) -> u16 {
        let port = self.port;
        self._session
            .close()
            .wait()
            .expect("Failed to close Zenoh router session");
        port
    }

    /// Broker config pointing at this router
    pub fn broker_config(&self, root_topic: &str) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".into(),
            port: self.port,
            root_topic: root_topic.into(),
            control_root: format!("{}/control/", root_topic),
            connect_timeout_secs: 5,
            monitor_interval_ms: 50,
        }
    }
}

/// A port nothing listens on
#[allow(dead_code)]
pub fn unused_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}
