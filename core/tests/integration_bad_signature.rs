//! Oplog Validation Integration Tests
//!
//! These tests feed crafted oplogs to a member and check what sticks:
//! 1. Tampered content fails signature checks
//! 2. A seal naming an unknown master log is dropped
//! 3. Logs from a non-master are ignored
//! 4. Real master signatures under an unknown seal are re-checked
//!
//! Run with: cargo test --test integration_bad_signature

mod common;

use common::{join, spawn_node, wait_until};
use ptt_core::oplog::PersonOp;
use ptt_core::transport::{MemoryHub, PeerTransport};
use ptt_core::{BaseOplog, MyInfo, OplogFamily, PttError, PttID, Status, Timestamp};

#[tokio::test]
async fn test_tampered_oplog_rejected() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;

    // Take Alice's sealed log adding Bob and point it at someone else
    let bob_id = bob.user_id();
    let mut log = alice_pm
        .oplogs(OplogFamily::Member)
        .alive_list()
        .expect("Failed to list oplogs")
        .into_iter()
        .find(|l| l.obj_id == bob_id)
        .expect("no member log for Bob");
    assert!(log.verify().is_ok());
    let carol = PttID::random();
    log.obj_id = carol;
    assert_eq!(log.verify(), Err(PttError::InvalidSign));

    let result = bob_pm.handle_oplogs(OplogFamily::Member, vec![log], None).await;
    assert_eq!(result.err(), Some(PttError::InvalidSign));
    assert!(!bob_pm.is_member(&carol));
    assert!(bob_pm.is_member(&bob_id));
}

#[tokio::test]
async fn test_forged_seal_left_pending() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;

    // Step 1: keep the log away from Alice, who could seal it for real
    let (alice_node, bob_node) = (alice.node_id(), bob.node_id());
    bob.transport.disconnect(alice_node).await.expect("Failed to disconnect");
    wait_until("peers gone", || {
        alice.ptt.peer(&bob_node).is_none() && bob.ptt.peer(&alice_node).is_none()
    })
    .await;

    // Step 2: a master add signed by Alice's device, sealed under a
    // master log nobody has
    let my = alice.ptt.my_info();
    let carol = PttID::random();
    let now = Timestamp::now();
    let mut log = BaseOplog::new(OplogFamily::Master, my.user_id, carol, PersonOp::Add.into(), vec![], None, now);
    log.sign(&my.node_key, Some(my.node_extra.clone())).expect("Failed to sign");
    log.internal_sign(my.node_sign_id, &my.node_key, None, now, alice_pm.config().expire_oplog_seconds)
        .expect("Failed to sign");
    log.set_master_log_id(PttID::random(), 1);
    assert!(log.verify().is_ok());
    assert_eq!(log.status(), Status::Alive);

    // Step 3: Bob strips the seal and keeps it waiting for masters
    let changed = bob_pm
        .handle_oplogs(OplogFamily::Master, vec![log.clone()], None)
        .await
        .expect("Failed to handle oplog");
    assert_eq!(changed.len(), 1);
    let stored = bob_pm
        .oplogs(OplogFamily::Master)
        .get(&log.id)
        .expect("Failed to read oplog")
        .expect("log not kept");
    assert_ne!(stored.status(), Status::Alive);
    assert!(stored.master_log_id.is_none());
    assert!(!bob_pm.is_master(&carol));
    assert_eq!(bob_pm.master_ids(), vec![alice.user_id()]);
}

#[tokio::test]
async fn test_non_master_log_ignored() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;

    // Mallory signs a master add for herself under a real master log id
    let mallory = MyInfo::generate("mallory");
    let now = Timestamp::now();
    let mut log = BaseOplog::new(
        OplogFamily::Master,
        mallory.user_id,
        mallory.user_id,
        PersonOp::Add.into(),
        vec![],
        None,
        now,
    );
    log.sign(&mallory.user_key, None).expect("Failed to sign");
    log.master_sign(mallory.user_id, &mallory.user_key, None, now, 300)
        .expect("Failed to sign");
    let master_log_id = bob_pm.newest_master_log_id().expect("Bob has no master log");
    log.set_master_log_id(master_log_id, 1);
    assert!(log.verify().is_ok());

    let changed = bob_pm
        .handle_oplogs(OplogFamily::Master, vec![log.clone()], None)
        .await
        .expect("Failed to handle oplog");
    assert!(changed.is_empty());
    assert!(bob_pm
        .oplogs(OplogFamily::Master)
        .get(&log.id)
        .expect("Failed to read oplog")
        .is_none());
    assert!(!bob_pm.is_master(&mallory.user_id));
    assert!(!alice_pm.is_master(&mallory.user_id));
}

#[tokio::test]
async fn test_unknown_seal_rechecked_against_signers() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub, "alice").await;
    let bob = spawn_node(&hub, "bob").await;

    let alice_pm = alice
        .spm
        .create_entity("general", false)
        .await
        .expect("Failed to create entity");
    let bob_pm = join(&alice_pm, &bob).await;

    let (alice_node, bob_node) = (alice.node_id(), bob.node_id());
    bob.transport.disconnect(alice_node).await.expect("Failed to disconnect");
    wait_until("peers gone", || {
        alice.ptt.peer(&bob_node).is_none() && bob.ptt.peer(&alice_node).is_none()
    })
    .await;

    let my = alice.ptt.my_info();
    let expire = alice_pm.config().expire_oplog_seconds;
    let master_add = |obj: PttID, signer: &MyInfo| {
        let now = Timestamp::now();
        let mut log = BaseOplog::new(OplogFamily::Master, my.user_id, obj, PersonOp::Add.into(), vec![], None, now);
        log.sign(&my.node_key, Some(my.node_extra.clone())).expect("Failed to sign");
        log.master_sign(signer.user_id, &signer.user_key, None, now, expire)
            .expect("Failed to sign");
        log.set_master_log_id(PttID::random(), 1);
        assert!(log.verify().is_ok());
        log
    };

    // Step 1: Mallory's signature cannot stand in for Alice's
    let mallory = MyInfo::generate("mallory");
    let carol = PttID::random();
    let forged = master_add(carol, &mallory);
    bob_pm
        .handle_oplogs(OplogFamily::Master, vec![forged.clone()], None)
        .await
        .expect("Failed to handle oplog");
    let stored = bob_pm
        .oplogs(OplogFamily::Master)
        .get(&forged.id)
        .expect("Failed to read oplog")
        .expect("log not kept");
    assert_eq!(stored.status(), Status::Pending);
    assert!(stored.master_log_id.is_none());
    assert!(!bob_pm.is_master(&carol));

    // Step 2: Alice's own signature is enough for Bob to seal it himself
    let known = bob_pm.newest_master_log_id().expect("Bob has no master log");
    let dave = PttID::random();
    let signed = master_add(dave, &my);
    bob_pm
        .handle_oplogs(OplogFamily::Master, vec![signed.clone()], None)
        .await
        .expect("Failed to handle oplog");
    let stored = bob_pm
        .oplogs(OplogFamily::Master)
        .get(&signed.id)
        .expect("Failed to read oplog")
        .expect("log not kept");
    assert_eq!(stored.status(), Status::Alive);
    assert_eq!(stored.master_log_id, Some(known));
    assert_eq!(stored.weight, 1);
    assert!(bob_pm.is_master(&dave));
}
