//! End-to-end protected publications: pre-shared-key encryption,
//! ECDH-ES recipients with counter signatures, signed-only payloads,
//! and acknowledgements routed back along the forwarding path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, settle, start_node, Collector};
use weft::{
    generate_ec_key, public_half, EcCurve, Entity, FabricConfig, Key, MemNetwork, MemoryKeyStore,
    NodeBuilder, ALG_ECDH_ES_A256KW, ALG_ES384, ALG_RESERVED,
};

fn fast() -> FabricConfig {
    common::fast_config()
}

#[test]
fn preshared_key_publication_stays_confidential() {
    init_tracing();
    let net = MemNetwork::new();

    let shared = Key::Symmetric(vec![0x7c; 32]);
    let sub_store = Arc::new(MemoryKeyStore::new());
    sub_store.put("net", shared.clone());
    let pub_store = Arc::new(MemoryKeyStore::new());
    pub_store.put("net", shared);

    let subscriber = NodeBuilder::new()
        .config(fast())
        .key_store(sub_store)
        .start_mem(&net)
        .unwrap();
    let eavesdropper = start_node(&net);
    let publisher = NodeBuilder::new()
        .config(fast())
        .key_store(pub_store)
        .start_mem(&net)
        .unwrap();

    let deliveries = Collector::new();
    let _sub = subscriber
        .subscribe(&["sealed/+"], deliveries.handler())
        .unwrap();
    let overheard = Collector::new();
    let _spy = eavesdropper
        .subscribe(&["sealed/+"], overheard.handler())
        .unwrap();

    publisher.link(subscriber.addr()).unwrap();
    publisher.link(eavesdropper.addr()).unwrap();

    let publication = publisher
        .publication(&["sealed/box"])
        .recipients(vec![Entity::new(ALG_RESERVED, "net")])
        .create()
        .unwrap();
    publication.publish(b"for keyholders", 0).unwrap();

    assert!(deliveries.wait_for(1, Duration::from_secs(2)));
    assert_eq!(deliveries.take()[0].1, b"for keyholders");
    // The node without the key forwards nothing to its application
    settle(300);
    assert_eq!(overheard.count(), 0);

    publisher.stop();
    subscriber.stop();
    eavesdropper.stop();
}

#[test]
fn ecdh_recipient_with_countersignature_and_ack() {
    init_tracing();
    let net = MemNetwork::new();

    let bob_key = generate_ec_key(EcCurve::P384);
    let alice_key = generate_ec_key(EcCurve::P384);

    // Publisher: Bob's public key plus its own signing identity
    let alice_store = Arc::new(MemoryKeyStore::new());
    alice_store.put("bob", public_half(&bob_key));
    alice_store.put("alice", alice_key.clone());
    alice_store.set_identity("alice");

    // Subscriber: its own key pair plus Alice's public key
    let bob_store = Arc::new(MemoryKeyStore::new());
    bob_store.put("bob", bob_key);
    bob_store.put("alice", public_half(&alice_key));

    let alice = NodeBuilder::new()
        .config(fast())
        .key_store(alice_store)
        .signer(Entity::new(ALG_ES384, "alice"))
        .start_mem(&net)
        .unwrap();
    // The forwarder holds no keys at all
    let middle = start_node(&net);
    let bob = NodeBuilder::new()
        .config(fast())
        .key_store(bob_store)
        .start_mem(&net)
        .unwrap();

    alice.link(middle.addr()).unwrap();
    bob.link(middle.addr()).unwrap();

    // The middle node subscribes too but can never decrypt
    let leaked = Collector::new();
    let _middle_sub = middle
        .subscribe(&["secret/data"], leaked.handler())
        .unwrap();
    settle(300);

    let acks = Collector::new();
    let publication = alice
        .publication(&["secret/data"])
        .recipients(vec![Entity::new(ALG_ECDH_ES_A256KW, "bob")])
        .ack_handler(acks.handler())
        .create()
        .unwrap();

    // Acknowledge from inside the delivery callback
    let bob_node = bob.clone();
    let acking = Collector::new();
    let observed = acking.clone();
    let _ack_sub = bob
        .subscribe(&["secret/data"], move |info, payload| {
            observed.push(info, payload);
            bob_node.ack(info, b"roger").unwrap();
        })
        .unwrap();
    settle(300);

    publication.publish(b"classified", 0).unwrap();

    assert!(acking.wait_for(1, Duration::from_secs(3)));
    let events = acking.take();
    assert_eq!(events[0].1, b"classified");
    // The counter signature attests the sender end to end
    assert_eq!(
        events[0].0.sender,
        Some(Entity::new(ALG_ES384, "alice"))
    );
    // The forwarder delivered nothing to its own application
    settle(300);
    assert_eq!(leaked.count(), 0);

    // The acknowledgement retraced the path to the publisher
    assert!(acks.wait_for(1, Duration::from_secs(3)));
    assert_eq!(acks.take()[0].1, b"roger");

    alice.stop();
    middle.stop();
    bob.stop();
}

#[test]
fn signed_publication_sender_requires_known_key() {
    init_tracing();
    let net = MemNetwork::new();

    let signer_key = generate_ec_key(EcCurve::P384);
    let pub_store = Arc::new(MemoryKeyStore::new());
    pub_store.put("alice", signer_key.clone());
    pub_store.set_identity("alice");

    let knowing_store = Arc::new(MemoryKeyStore::new());
    knowing_store.put("alice", public_half(&signer_key));

    let publisher = NodeBuilder::new()
        .config(fast())
        .key_store(pub_store)
        .signer(Entity::new(ALG_ES384, "alice"))
        .start_mem(&net)
        .unwrap();
    let knowing = NodeBuilder::new()
        .config(fast())
        .key_store(knowing_store)
        .start_mem(&net)
        .unwrap();
    let ignorant = start_node(&net);

    let verified = Collector::new();
    let _sub1 = knowing.subscribe(&["signed/t"], verified.handler()).unwrap();
    let unverified = Collector::new();
    let _sub2 = ignorant
        .subscribe(&["signed/t"], unverified.handler())
        .unwrap();

    publisher.link(knowing.addr()).unwrap();
    publisher.link(ignorant.addr()).unwrap();

    let publication = publisher.publication(&["signed/t"]).create().unwrap();
    publication.publish(b"attested", 0).unwrap();

    assert!(verified.wait_for(1, Duration::from_secs(2)));
    assert!(unverified.wait_for(1, Duration::from_secs(2)));

    // With the key the signature verifies; without it the payload still
    // arrives but the sender identity is cleared
    assert_eq!(
        verified.take()[0].0.sender,
        Some(Entity::new(ALG_ES384, "alice"))
    );
    assert_eq!(unverified.take()[0].0.sender, None);

    publisher.stop();
    knowing.stop();
    ignorant.stop();
}

#[test]
fn ack_on_unacknowledged_publication_is_rejected() {
    init_tracing();
    let net = MemNetwork::new();
    let node = start_node(&net);

    let node_for_handler = node.clone();
    let results = Collector::new();
    let observed = results.clone();
    let _sub = node
        .subscribe(&["plain/t"], move |info, payload| {
            assert!(node_for_handler.ack(info, b"nope").is_err());
            observed.push(info, payload);
        })
        .unwrap();

    let publication = node.publication(&["plain/t"]).create().unwrap();
    publication.publish(b"data", 0).unwrap();
    assert!(results.wait_for(1, Duration::from_secs(1)));
    node.stop();
}
