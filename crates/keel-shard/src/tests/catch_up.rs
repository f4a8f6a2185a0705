//! Multi-replica convergence: live followers and joining replicas.

use std::sync::Arc;

use keel_meta::SuperblockStore;
use keel_types::{ShardId, ShardState};

use super::helpers::{TEST_PG, attach_manager, cluster};

// -----------------------------------------------------------------------
// Live follower convergence
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_followers_apply_create_with_identical_record() {
    let c = cluster(3, &[TEST_PG]);

    let info = c.replicas[0]
        .manager
        .create_shard(TEST_PG, 4096)
        .await
        .unwrap();

    for replica in &c.replicas {
        assert_eq!(replica.manager.shards_of(TEST_PG), vec![info.id]);
        // Timestamps are proposer-stamped, so the record is bit-identical.
        assert_eq!(replica.manager.shard_info(info.id), Some(info.clone()));
        assert_eq!(replica.manager.shard_sequence_num(TEST_PG), Some(1));
        assert_eq!(
            replica.manager.get_shard_chunk(info.id),
            c.replicas[0].manager.get_shard_chunk(info.id)
        );
    }
}

#[tokio::test]
async fn test_seal_proposed_from_follower_converges() {
    let c = cluster(3, &[TEST_PG]);

    let info = c.replicas[0]
        .manager
        .create_shard(TEST_PG, 4096)
        .await
        .unwrap();
    let chunk = c.replicas[0].manager.get_shard_chunk(info.id).unwrap();

    // Any replica may propose a seal.
    let sealed = c.replicas[1].manager.seal_shard(&info).await.unwrap();
    assert_eq!(sealed.state, ShardState::Sealed);

    for replica in &c.replicas {
        assert_eq!(
            replica.manager.shard_info(info.id).unwrap().state,
            ShardState::Sealed
        );
        assert!(!replica.selector.is_busy(chunk));
    }
}

#[tokio::test]
async fn test_sequence_catches_up_after_every_commit() {
    let c = cluster(2, &[TEST_PG]);

    for seq in 1..=4u64 {
        c.replicas[0]
            .manager
            .create_shard(TEST_PG, 4096)
            .await
            .unwrap();
        for replica in &c.replicas {
            assert_eq!(replica.manager.shard_sequence_num(TEST_PG), Some(seq));
        }
    }
}

#[tokio::test]
async fn test_followers_do_not_allocate_but_adopt() {
    let c = cluster(2, &[TEST_PG]);

    c.replicas[0]
        .manager
        .create_shard(TEST_PG, 4096)
        .await
        .unwrap();
    c.replicas[0]
        .manager
        .create_shard(TEST_PG, 4096)
        .await
        .unwrap();

    // The follower adopted sequences 1..2; a create it proposes next gets 3.
    let info = c.replicas[1]
        .manager
        .create_shard(TEST_PG, 4096)
        .await
        .unwrap();
    assert_eq!(info.id, ShardId::new(TEST_PG, 3));

    for replica in &c.replicas {
        assert_eq!(replica.manager.shard_sequence_num(TEST_PG), Some(3));
        assert_eq!(replica.manager.shards_of(TEST_PG).len(), 3);
    }
}

// -----------------------------------------------------------------------
// Joining replica catches up from the log
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_joining_follower_replays_to_leader_state() {
    let c = cluster(1, &[TEST_PG]);
    let leader = c.leader();

    let mut infos = Vec::new();
    for _ in 0..5 {
        infos.push(leader.manager.create_shard(TEST_PG, 4096).await.unwrap());
    }

    // A follower joins at sequence 0 and replays commits 1..5 in order.
    let joiner = leader.device.add_replica();
    let follower = attach_manager(joiner, Arc::new(SuperblockStore::in_memory()), &[TEST_PG]);
    assert_eq!(follower.manager.shard_sequence_num(TEST_PG), Some(0));
    assert_eq!(follower.device.replay().await, 5);

    assert_eq!(follower.manager.shard_sequence_num(TEST_PG), Some(5));
    assert_eq!(
        follower.manager.shards_of(TEST_PG),
        leader.manager.shards_of(TEST_PG)
    );
    for info in &infos {
        assert_eq!(follower.manager.shard_info(info.id), Some(info.clone()));
        assert_eq!(
            follower.manager.get_shard_chunk(info.id),
            leader.manager.get_shard_chunk(info.id)
        );
    }
    assert_eq!(follower.selector.busy_count(), 5);
}

#[tokio::test]
async fn test_joining_follower_sees_seals() {
    let c = cluster(1, &[TEST_PG]);
    let leader = c.leader();

    let a = leader.manager.create_shard(TEST_PG, 4096).await.unwrap();
    let b = leader.manager.create_shard(TEST_PG, 4096).await.unwrap();
    leader.manager.seal_shard(&a).await.unwrap();

    let joiner = leader.device.add_replica();
    let follower = attach_manager(joiner, Arc::new(SuperblockStore::in_memory()), &[TEST_PG]);
    follower.device.replay().await;

    assert_eq!(
        follower.manager.shard_info(a.id).unwrap().state,
        ShardState::Sealed
    );
    assert_eq!(
        follower.manager.shard_info(b.id).unwrap().state,
        ShardState::Open
    );
    assert_eq!(follower.selector.busy_count(), 1);
}
