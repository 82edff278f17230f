//! Merkle Sync Integration Tests
//!
//! These tests verify that members converge on the same member oplogs:
//! 1. Live broadcast to connected members
//! 2. Catch-up through Merkle sync after a disconnect
//! 3. Merkle trees that agree once synced
//!
//! Run with: cargo test --test integration_merkle_sync

mod common;

use common::{connect, join, spawn_node, wait_until};
use ptt_core::transport::{MemoryHub, PeerTransport};
use ptt_core::{OplogFamily, PttID};
use std::collections::HashSet;

fn sorted(mut ids: Vec<PttID>) -> Vec<PttID> {
    ids.sort();
    ids
}

#[tokio::test]
async fn test_new_member_broadcast() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;
    let carol = spawn_node(&hub, "carol").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;

    // Carol joins after Bob: Bob learns of her from Alice
    let carol_pm = join(&alice_pm, &carol).await;
    let carol_id = carol.user_id();
    wait_until("Bob sees Carol", || bob_pm.is_member(&carol_id)).await;
    wait_until("Carol sees Bob", || carol_pm.is_member(&bob.user_id())).await;
}

#[tokio::test]
async fn test_members_converge_after_disconnect() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;

    // Step 1: Bob drops off
    let (alice_node, bob_node) = (alice.node_id(), bob.node_id());
    bob.transport.disconnect(alice_node).await.expect("Failed to disconnect");
    wait_until("peers gone", || {
        alice.ptt.peer(&bob_node).is_none() && bob.ptt.peer(&alice_node).is_none()
    })
    .await;

    // Step 2: Alice adds members Bob does not see
    let mut added = HashSet::new();
    for _ in 0..5 {
        let id = PttID::random();
        alice_pm.add_member(id).await.expect("Failed to add member");
        added.insert(id);
    }
    let removed = *added.iter().next().expect("no member added");
    alice_pm.delete_member(removed).await.expect("Failed to delete member");
    assert!(!alice_pm.is_member(&removed));
    assert!(added.iter().all(|id| !bob_pm.is_member(id)));

    // Step 3: they reconnect and sync catches Bob up
    connect(&bob, &alice).await;
    let expected = sorted(alice_pm.member_ids().expect("Failed to list members"));
    wait_until("member lists converge", || {
        bob_pm.member_ids().map(sorted).ok().as_ref() == Some(&expected)
    })
    .await;
    assert!(!bob_pm.is_member(&removed));

    // Step 4: with the same logs the trees agree
    let alice_count = alice_pm
        .oplogs(OplogFamily::Member)
        .count_alive()
        .expect("Failed to count oplogs");
    wait_until("oplog counts converge", || {
        bob_pm.oplogs(OplogFamily::Member).count_alive().ok() == Some(alice_count)
    })
    .await;
    alice_pm.generate_merkle().expect("Failed to generate Merkle tree");
    bob_pm.generate_merkle().expect("Failed to generate Merkle tree");
}
