//! Master Integration Tests
//!
//! These tests verify master changes across members:
//! 1. Transfer of the master role to a member
//! 2. Master logs that need every master's signature
//! 3. Peer types following the roles
//!
//! Run with: cargo test --test integration_transfer_master

mod common;

use common::{join, spawn_node, wait_until};
use ptt_core::{OplogFamily, PeerType, PttError, PttID, Status};

use ptt_core::transport::MemoryHub;

#[tokio::test]
async fn test_transfer_master_to_member() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;
    let master0 = alice_pm.master_log0_hash().expect("Alice lacks master-log-0");
    let (alice_id, bob_id) = (alice.user_id(), bob.user_id());

    // Step 1: Alice, the only master, hands the role to Bob; the log
    // waits for Bob's signature
    let log = alice_pm.transfer_master(bob_id).await.expect("Failed to transfer master");
    assert_ne!(log.status(), Status::Alive);
    assert!(alice_pm.is_master(&alice_id));
    assert!(!alice_pm.is_master(&bob_id));

    // Step 2: Bob co-signs and both sides apply the sealed log
    wait_until("Bob becomes master on both sides", || {
        bob_pm.is_master(&bob_id)
            && !bob_pm.is_master(&alice_id)
            && alice_pm.is_master(&bob_id)
            && !alice_pm.is_master(&alice_id)
    })
    .await;
    let sealed = alice_pm
        .oplogs(OplogFamily::Master)
        .get(&log.id)
        .expect("Failed to read oplog")
        .expect("transfer log missing");
    assert_eq!(sealed.status(), Status::Alive);
    assert!(sealed.master_signs.iter().any(|s| s.id == alice_id));
    assert!(sealed.master_signs.iter().any(|s| s.id == bob_id));
    assert_eq!(bob_pm.master_ids(), vec![bob_id]);
    assert_eq!(bob_pm.master_log0_hash().expect("Bob lacks master-log-0"), master0);
    assert_eq!(bob_pm.newest_master_log_id(), Some(log.id));

    // Step 3: only the new master may rotate
    assert_eq!(alice_pm.create_op_key().await.err(), Some(PttError::InvalidStatus));
    bob_pm.create_op_key().await.expect("New master failed to create op-key");

    // Step 4: Alice now sees Bob as important, Bob sees Alice as a member
    let (alice_node, bob_node) = (alice.node_id(), bob.node_id());
    wait_until("roles reflected in peer types", || {
        alice_pm.peer_type(&bob_node) == Some(PeerType::Important)
            && bob_pm.peer_type(&alice_node) == Some(PeerType::Member)
    })
    .await;
}

#[tokio::test]
async fn test_master_add_needs_every_master() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;
    let bob_id = bob.user_id();

    // Step 1: with one master the log seals at once
    alice_pm.add_master(bob_id).await.expect("Failed to add master");
    wait_until("Bob is master on both sides", || {
        alice_pm.is_master(&bob_id) && bob_pm.is_master(&bob_id)
    })
    .await;

    // Step 2: the next master log waits for Bob's signature
    let carol = PttID::random();
    let log = alice_pm.add_master(carol).await.expect("Failed to add master");
    assert_ne!(log.status(), Status::Alive);
    assert!(!alice_pm.is_master(&carol));
    let pending = alice_pm
        .oplogs(OplogFamily::Master)
        .pending_list()
        .expect("Failed to list pending oplogs");
    assert!(pending.iter().any(|l| l.id == log.id));

    // Step 3: Bob co-signs and the sealed log comes back
    wait_until("Carol is master on both sides", || {
        alice_pm.is_master(&carol) && bob_pm.is_master(&carol)
    })
    .await;
    let sealed = alice_pm
        .oplogs(OplogFamily::Master)
        .get(&log.id)
        .expect("Failed to read oplog")
        .expect("master log missing");
    assert_eq!(sealed.status(), Status::Alive);
    assert_eq!(alice_pm.master_ids().len(), 3);
}

#[tokio::test]
async fn test_member_cannot_move_master() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;

    assert_eq!(
        bob_pm.transfer_master(PttID::random()).await.err(),
        Some(PttError::InvalidOp)
    );
    assert_eq!(bob_pm.add_master(PttID::random()).await.err(), Some(PttError::InvalidStatus));
}

#[tokio::test]
async fn test_transfer_master_needs_member_target() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let alice_id = alice.user_id();
    let stranger = PttID::random();

    assert_eq!(alice_pm.transfer_master(stranger).await.err(), Some(PttError::InvalidOp));
    assert!(alice_pm.is_master(&alice_id));
    assert!(!alice_pm.is_master(&stranger));
    assert_eq!(alice_pm.master_ids(), vec![alice_id]);
    assert!(alice_pm
        .oplogs(OplogFamily::Master)
        .pending_list()
        .expect("Failed to list pending oplogs")
        .is_empty());
}

#[tokio::test]
async fn test_transfer_master_waits_for_target() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let alice_id = alice.user_id();

    // A member whose nodes are unreachable never signs, so the role stays
    let absent = PttID::random();
    alice_pm.add_member(absent).await.expect("Failed to add member");
    let log = alice_pm.transfer_master(absent).await.expect("Failed to transfer master");
    assert_ne!(log.status(), Status::Alive);
    assert!(alice_pm.is_master(&alice_id));
    assert!(!alice_pm.is_master(&absent));
    let stored = alice_pm
        .get_master(&alice_id)
        .expect("Failed to read master")
        .expect("Alice's record missing");
    assert_eq!(stored.status, Status::Alive);
    assert!(stored.sync_info.is_some());
}
