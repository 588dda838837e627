//! Shared helpers for the end-to-end tests: fast timer settings, an
//! in-process network per test, and a delivery collector.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use weft::{FabricConfig, LinkMonitorConfig, MemNetwork, Node, NodeBuilder, PublicationInfo};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Timers scaled down so convergence happens in milliseconds.
pub fn fast_config() -> FabricConfig {
    FabricConfig::default()
        .with_subs_rate(Duration::from_millis(25))
        .with_link_monitor(LinkMonitorConfig {
            probe_spacing: Duration::from_millis(20),
            probe_period: Duration::from_millis(100),
            max_probes_lost: 3,
        })
}

pub fn start_node(net: &Arc<MemNetwork>) -> Node {
    NodeBuilder::new()
        .config(fast_config())
        .start_mem(net)
        .expect("node starts")
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn settle(millis: u64) {
    std::thread::sleep(Duration::from_millis(millis));
}

/// Collects deliveries from a subscription or ack handler.
#[derive(Clone, Default)]
pub struct Collector {
    events: Arc<Mutex<Vec<(PublicationInfo, Vec<u8>)>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, info: &PublicationInfo, payload: &[u8]) {
        self.events
            .lock()
            .unwrap()
            .push((info.clone(), payload.to_vec()));
    }

    pub fn handler(&self) -> impl Fn(&PublicationInfo, &[u8]) + Send + Sync + 'static {
        let collector = self.clone();
        move |info, payload| collector.push(info, payload)
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<(PublicationInfo, Vec<u8>)> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let collector = self.clone();
        wait_until(timeout, move || collector.count() >= n)
    }
}
