//! Person and Entity Lifecycle Tests
//!
//! These tests verify the delete-like operations end to end:
//! 1. Members deleted, transferred and migrated
//! 2. Masters migrated and deleted
//! 3. Entity deletion reaching every member
//!
//! Run with: cargo test --test integration_person_lifecycle

mod common;

use common::{join, spawn_node, wait_until};
use ptt_core::transport::MemoryHub;
use ptt_core::{PttError, PttID, Status};

fn member_status(pm: &ptt_core::ProtocolManager, id: &PttID) -> Option<Status> {
    pm.get_member(id).ok().flatten().map(|p| p.status)
}

fn master_status(pm: &ptt_core::ProtocolManager, id: &PttID) -> Option<Status> {
    pm.get_master(id).ok().flatten().map(|p| p.status)
}

#[tokio::test]
async fn test_master_deletes_member() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;
    let (alice_id, bob_id) = (alice.user_id(), bob.user_id());

    // Step 1: a plain member cannot remove others
    assert_eq!(bob_pm.delete_member(alice_id).await.err(), Some(PttError::InvalidOp));

    // Step 2: the master removes Bob
    let log = alice_pm.delete_member(bob_id).await.expect("Failed to delete member");
    assert_eq!(log.status(), Status::Alive);
    assert!(!alice_pm.is_member(&bob_id));
    assert_eq!(member_status(&alice_pm, &bob_id), Some(Status::Deleted));
    assert!(!alice_pm.member_ids().expect("Failed to list members").contains(&bob_id));

    // Step 3: a second delete finds nothing alive
    assert_eq!(alice_pm.delete_member(bob_id).await.err(), Some(PttError::AlreadyDeleted));
    assert_eq!(
        alice_pm.delete_member(PttID::random()).await.err(),
        Some(PttError::NotFound)
    );
}

#[tokio::test]
async fn test_master_transfers_member() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    join(&alice_pm, &bob).await;
    let bob_id = bob.user_id();
    let next_id = PttID::random();

    alice_pm
        .transfer_member(bob_id, next_id)
        .await
        .expect("Failed to transfer member");

    let old = alice_pm
        .get_member(&bob_id)
        .expect("Failed to read member")
        .expect("Bob's record missing");
    assert_eq!(old.status, Status::Transferred);
    assert_eq!(old.transfer_to_id, Some(next_id));
    assert!(alice_pm.is_member(&next_id));
}

#[tokio::test]
async fn test_member_migrates_self() {
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
    wait_until("Bob holds his own member record", || bob_pm.is_member(&bob_id)).await;

    // Step 1: Bob moves himself; his own signature seals the log
    let next_id = PttID::random();
    let log = bob_pm.migrate_member(next_id).await.expect("Failed to migrate member");
    assert_eq!(log.status(), Status::Alive);
    assert_eq!(member_status(&bob_pm, &bob_id), Some(Status::Migrated));
    assert!(bob_pm.is_member(&next_id));

    // Step 2: Alice follows
    wait_until("Alice sees the migration", || {
        member_status(&alice_pm, &bob_id) == Some(Status::Migrated) && alice_pm.is_member(&next_id)
    })
    .await;
}

#[tokio::test]
async fn test_master_migrates_self() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;
    let alice_id = alice.user_id();

    // Step 1: Bob holds no master record to move
    assert_eq!(bob_pm.migrate_master(PttID::random()).await.err(), Some(PttError::NotFound));

    // Step 2: Alice moves her master role to a new id
    let next_id = PttID::random();
    let log = alice_pm.migrate_master(next_id).await.expect("Failed to migrate master");
    assert_eq!(log.status(), Status::Alive);
    assert!(!alice_pm.is_master(&alice_id));
    assert!(alice_pm.is_master(&next_id));
    assert_eq!(master_status(&alice_pm, &alice_id), Some(Status::Migrated));
    assert_eq!(alice_pm.master_ids(), vec![next_id]);

    // Step 3: Bob follows
    wait_until("Bob sees the new master", || {
        bob_pm.is_master(&next_id) && !bob_pm.is_master(&alice_id)
    })
    .await;
}

#[tokio::test]
async fn test_delete_master_needs_every_master() {
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

    alice_pm.add_master(bob_id).await.expect("Failed to add master");
    wait_until("Bob is master on both sides", || {
        alice_pm.is_master(&bob_id) && bob_pm.is_master(&bob_id)
    })
    .await;

    // With two masters the delete waits for Bob's signature
    let log = alice_pm.delete_master(bob_id).await.expect("Failed to delete master");
    assert_ne!(log.status(), Status::Alive);
    assert!(alice_pm.is_master(&bob_id));

    wait_until("Bob is removed on both sides", || {
        !alice_pm.is_master(&bob_id) && !bob_pm.is_master(&bob_id)
    })
    .await;
    assert_eq!(master_status(&alice_pm, &bob_id), Some(Status::Deleted));
    assert_eq!(alice_pm.master_ids(), vec![alice.user_id()]);
}

#[tokio::test]
async fn test_delete_entity_reaches_members() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;
    let entity_id = *alice_pm.entity_id();

    // Step 1: members cannot delete the entity
    assert_eq!(bob_pm.delete_entity().await.err(), Some(PttError::InvalidOp));

    // Step 2: the master deletes it and it leaves Alice's node
    let log = alice_pm.delete_entity().await.expect("Failed to delete entity");
    assert_eq!(log.status(), Status::Alive);
    assert_eq!(alice_pm.status(), Status::Deleted);
    assert!(alice.ptt.entity(&entity_id).is_none());
    assert_eq!(alice_pm.delete_entity().await.err(), Some(PttError::AlreadyDeleted));

    // Step 3: Bob gets the delete log and drops it too
    wait_until("Bob drops the entity", || {
        bob_pm.status() == Status::Deleted && bob.ptt.entity(&entity_id).is_none()
    })
    .await;
}
