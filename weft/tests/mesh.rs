//! Mesh behavior: loop control in a triangle, recovery from lost
//! subscription frames, and muted-link monitoring.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, settle, start_node, wait_until, Collector};
use weft::MemNetwork;

/// Message type byte of an encoded frame: `[array(5), version, type, ...]`.
fn frame_type(frame: &[u8]) -> u8 {
    if frame.len() > 2 {
        frame[2]
    } else {
        0
    }
}

fn is_probe(frame: &[u8]) -> bool {
    frame
        .windows(b"$weft/probe".len())
        .any(|window| window == b"$weft/probe")
}

#[test]
fn triangle_mesh_delivers_once_with_bounded_traffic() {
    init_tracing();
    let net = MemNetwork::new();
    let x = start_node(&net);
    let y = start_node(&net);
    let z = start_node(&net);

    let deliveries = Collector::new();
    let _sub = x.subscribe(&["a/b"], deliveries.handler()).unwrap();

    // Full triangle: every pair linked
    x.link(y.addr()).unwrap();
    y.link(z.addr()).unwrap();
    z.link(x.addr()).unwrap();

    // Let interests propagate and the loop-control converge
    settle(1500);

    // Count publication frames crossing any edge from here on,
    // ignoring the link monitor's probes
    let pub_frames = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pub_frames);
    net.set_loss(Some(Box::new(move |_, _, frame| {
        if frame_type(frame) == 1 && !is_probe(frame) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        false
    })));

    let publication = y.publication(&["a/b"]).create().unwrap();
    publication.publish(b"mesh", 0).unwrap();

    assert!(deliveries.wait_for(1, Duration::from_secs(3)));
    settle(500);
    // Exactly one delivery at the subscriber
    assert_eq!(deliveries.count(), 1);
    // The publication crossed each edge at most once per direction
    assert!(pub_frames.load(Ordering::SeqCst) <= 3);

    net.set_loss(None);
    x.stop();
    y.stop();
    z.stop();
}

#[test]
fn lost_subscription_is_retransmitted() {
    init_tracing();
    let net = MemNetwork::new();
    let a = start_node(&net);
    let b = start_node(&net);

    // Drop the first SUB frame only
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    net.set_loss(Some(Box::new(move |_, _, frame| {
        frame_type(frame) == 3 && !flag.swap(true, Ordering::SeqCst)
    })));

    let deliveries = Collector::new();
    let _sub = a.subscribe(&["r/t"], deliveries.handler()).unwrap();

    // The initial SUB is lost; the retransmission converges the link
    b.link(a.addr()).unwrap();
    assert!(dropped.load(Ordering::SeqCst));

    let publication = b.publication(&["r/t"]).create().unwrap();
    publication.publish(b"after loss", 0).unwrap();
    assert!(deliveries.wait_for(1, Duration::from_secs(3)));

    net.set_loss(None);
    a.stop();
    b.stop();
}

#[test]
fn unresponsive_peer_is_dropped_after_full_retry_budget() {
    init_tracing();
    let net = MemNetwork::new();
    let a = weft::NodeBuilder::new()
        .config(common::fast_config().with_max_sub_retries(3))
        .start_mem(&net)
        .unwrap();
    let b = start_node(&net);
    let b_port = b.port();

    // Swallow everything addressed to B: the port stays registered but
    // never answers, so only retransmission can give up on it
    let subs_sent = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&subs_sent);
    net.set_loss(Some(Box::new(move |_, to, frame| {
        if to == b_port {
            if frame_type(frame) == 3 {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            return true;
        }
        false
    })));

    assert!(a.link(weft::PeerAddr::local(b_port)).is_err());
    // The initial send plus max_sub_retries retransmissions, no more
    assert_eq!(subs_sent.load(Ordering::SeqCst), 4);

    net.set_loss(None);
    a.stop();
    b.stop();
}

#[test]
fn lost_sak_triggers_idempotent_resend() {
    init_tracing();
    let net = MemNetwork::new();
    let a = start_node(&net);
    let b = start_node(&net);

    // Drop the first SAK; the duplicate SUB that follows must be
    // answered again without disturbing state
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    net.set_loss(Some(Box::new(move |_, _, frame| {
        frame_type(frame) == 4 && !flag.swap(true, Ordering::SeqCst)
    })));

    let deliveries = Collector::new();
    let _sub = a.subscribe(&["s/1"], deliveries.handler()).unwrap();
    b.link(a.addr()).unwrap();

    let publication = b.publication(&["s/1"]).create().unwrap();
    publication.publish(b"ok", 0).unwrap();
    assert!(deliveries.wait_for(1, Duration::from_secs(3)));
    settle(300);
    assert_eq!(deliveries.count(), 1);

    net.set_loss(None);
    a.stop();
    b.stop();
}

#[test]
fn muted_link_is_probed() {
    init_tracing();
    let net = MemNetwork::new();
    let x = start_node(&net);
    let y = start_node(&net);
    let z = start_node(&net);

    let deliveries = Collector::new();
    let _sub = x.subscribe(&["m/n"], deliveries.handler()).unwrap();
    x.link(y.addr()).unwrap();
    y.link(z.addr()).unwrap();
    z.link(x.addr()).unwrap();
    settle(1500);

    // A muted edge exists by now; its monitor sends probes
    let probes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&probes);
    net.set_loss(Some(Box::new(move |_, _, frame| {
        if is_probe(frame) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        false
    })));

    let probes_seen = Arc::clone(&probes);
    assert!(wait_until(Duration::from_secs(3), move || {
        probes_seen.load(Ordering::SeqCst) > 0
    }));

    net.set_loss(None);
    x.stop();
    y.stop();
    z.stop();
}

#[test]
fn delivery_survives_node_loss_in_triangle() {
    init_tracing();
    let net = MemNetwork::new();
    let x = start_node(&net);
    let y = start_node(&net);
    let z = start_node(&net);

    let deliveries = Collector::new();
    let _sub = x.subscribe(&["k/l"], deliveries.handler()).unwrap();
    x.link(y.addr()).unwrap();
    y.link(z.addr()).unwrap();
    z.link(x.addr()).unwrap();
    settle(1500);

    // Z disappears; probe failures or send failures drop it and the
    // surviving edge between X and Y unmutes if it needs to
    z.stop();
    settle(1000);

    let publication = y.publication(&["k/l"]).create().unwrap();
    // Retained so it is re-forwarded once the mesh heals
    publication.publish(b"still here", 5).unwrap();
    assert!(deliveries.wait_for(1, Duration::from_secs(5)));

    x.stop();
    y.stop();
}
