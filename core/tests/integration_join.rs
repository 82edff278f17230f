//! Join Integration Tests
//!
//! These tests run the join handshake between in-process nodes:
//! 1. Invitation out of band
//! 2. Challenge exchange under the join-key
//! 3. Approval and bootstrap from the entity bundle
//! 4. Peer classification on both sides
//!
//! Run with: cargo test --test integration_join

mod common;

use common::{connect, join, spawn_node, wait_until, SERVICE};
use ptt_core::entity::JoinType;
use ptt_core::ptt::Invitation;
use ptt_core::transport::MemoryHub;
use ptt_core::{PeerType, PttError, PttID};

#[tokio::test]
async fn test_join_bootstraps_entity() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    // Step 1: Alice creates an entity and is its only master
    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    assert!(alice_pm.is_master(&alice.user_id()));
    assert!(!alice_pm.is_member(&bob.user_id()));
    let used = alice_pm
        .invitation(JoinType::Entity)
        .expect("Failed to create invitation")
        .hash;
    assert!(alice_pm.join_key(&used).is_some());

    // Step 2: Bob joins through an invitation; the harness dials Alice
    let bob_pm = join(&alice_pm, &bob).await;

    // The answered join-key is retired and a fresh one takes its place
    wait_until("join-key retired", || {
        let keys = alice_pm.join_key_list();
        !keys.is_empty() && keys.iter().all(|k| k.hash != used)
    })
    .await;

    // Step 3: Bob's copy carries Alice as master and himself as member
    assert_eq!(bob_pm.entity_id(), alice_pm.entity_id());
    assert_eq!(bob_pm.entity().name, "general");
    assert!(bob_pm.is_master(&alice.user_id()));
    assert!(bob_pm.is_member(&bob.user_id()));
    assert_eq!(
        bob_pm.master_log0_hash().expect("Bob lacks master-log-0"),
        alice_pm.master_log0_hash().expect("Alice lacks master-log-0")
    );

    // Step 4: both share an op-key
    let shared = alice_pm.oldest_op_key().expect("Alice has no op-key");
    assert!(bob_pm.op_key(&shared.hash).is_some());

    // Step 5: each side classifies the other
    let (alice_node, bob_node) = (alice.node_id(), bob.node_id());
    wait_until("peer types settle", || {
        alice.ptt.peer(&bob_node).map(|p| p.peer_type) == Some(PeerType::Member)
            && bob.ptt.peer(&alice_node).map(|p| p.peer_type) == Some(PeerType::Important)
    })
    .await;
    assert_eq!(alice_pm.peer_type(&bob_node), Some(PeerType::Member));
    assert_eq!(bob_pm.peer_type(&alice_node), Some(PeerType::Important));
    assert!(alice_pm.confirm_joins().is_empty());
}

#[tokio::test]
async fn test_join_recorded_on_personal_entity() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let bob_personal = bob
        .spm
        .create_entity("bob", true)
        .await
        .expect("Failed to create personal entity");
    assert!(bob_personal.is_personal());
    assert_eq!(
        bob.spm.create_entity("bob again", true).await.err(),
        Some(PttError::AlreadyExists)
    );

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    join(&alice_pm, &bob).await;

    let id = *alice_pm.entity_id();
    wait_until("join recorded", || {
        bob_personal
            .joined_entities()
            .map(|joined| joined.iter().any(|j| j.entity_id == id && j.service == SERVICE))
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_join_through_text_invitation() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;
    connect(&alice, &bob).await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let text = alice_pm
        .invitation(JoinType::Entity)
        .expect("Failed to create invitation")
        .encode()
        .expect("Failed to encode invitation");

    let invitation = Invitation::decode(&text).expect("Failed to decode invitation");
    let hash = invitation.hash;
    bob.ptt.join(invitation).await.expect("Failed to start join");

    let id = *alice_pm.entity_id();
    wait_until("joined entity", || bob.ptt.entity(&id).is_some()).await;
    assert!(bob.ptt.join_status(&hash).is_none());

    // The join-key answered one joiner and was replaced.
    let next = alice_pm.invitation(JoinType::Entity).expect("Failed to create invitation");
    assert_ne!(next.hash, hash);
    assert!(alice.ptt.join_entity(&hash).is_none());
}

#[tokio::test]
async fn test_join_refusals() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let invitation = alice_pm.invitation(JoinType::Entity).expect("Failed to create invitation");

    // My own invitation
    assert_eq!(alice.ptt.join(invitation.clone()).await, Err(PttError::AlreadyMyNode));

    // Entity id not derived from the creator
    let mut forged = invitation.clone();
    forged.entity_id = PttID::random();
    assert_eq!(bob.ptt.join(forged).await, Err(PttError::InvalidEntity));

    // Key swapped under the advertised hash
    let mut swapped = invitation.clone();
    swapped.key = alice_pm.oldest_op_key().expect("Alice has no op-key");
    assert_eq!(bob.ptt.join(swapped).await, Err(PttError::InvalidKey));

    // Service Bob does not run
    let mut foreign = invitation.clone();
    foreign.service = "chat".into();
    assert_eq!(bob.ptt.join(foreign).await, Err(PttError::InvalidEntity));

    // Already hosted
    join(&alice_pm, &bob).await;
    let again = alice_pm.invitation(JoinType::Entity).expect("Failed to create invitation");
    assert_eq!(bob.ptt.join(again).await, Err(PttError::AlreadyExists));
}
