//! Chunk migrations under failures.
//!
//! Test flow:
//! 1) Shard `foo.bar` on `x`, insert documents, then move a range between shards.
//! 2) Inject failures at fixed points of the protocol (recipient crash while
//!    catching up, a concurrent move of the same range, a lost commit reply,
//!    a failure right before commit).
//!
//! Failure model covered:
//! - Recipient dies after cloning and never reaches the critical section.
//! - Two migrations race for the same range on one donor.
//! - The donor loses the config catalog's commit reply.
//! - A commit is replayed after it already applied.
//!
//! Verification:
//! - Ownership changes only when the commit applies, and exactly once.
//! - Every document stays visible through a router exactly once.
//! - Cloned documents on a failed recipient are removed after restart.

mod common;

use std::time::Duration;

use common::{
    catalog_version, docs_for, insert_all, shard_on_primary, shard_split_at_zero, start_cluster, wait_until, xs, NS,
};
use shardline::failpoint::{
    FailPointMode, MIGRATION_FAIL_BEFORE_COMMIT, MIGRATION_LOSE_COMMIT_ACK, MIGRATION_PAUSE_AFTER_CLONE,
    RECIPIENT_PAUSE_CATCH_UP,
};
use shardline::{ChunkRange, Filter, ShardError, ShardId, ShardKey};

fn count_from(docs: &[shardline::Document], min: i64) -> usize {
    xs(docs).into_iter().filter(|x| *x >= min).count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recipient_crash_during_catch_up_aborts_migration() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_on_primary(&router).await;
    insert_all(&router, docs_for(-10..10)).await;
    let before = catalog_version(&cluster).await;

    cluster.failpoints().enable(RECIPIENT_PAUSE_CATCH_UP, FailPointMode::Pause);
    let mover = cluster.router();
    let migration = tokio::spawn(async move {
        mover
            .move_range(NS, ShardKey::int(0), None, ShardId::from("shard1"))
            .await
    });

    let recipient = cluster.shard("shard1").expect("shard1");
    wait_until("recipient to finish cloning", || {
        let recipient = recipient.clone();
        async move { recipient.raw_documents(NS).map(|d| count_from(&d, 0) == 10).unwrap_or(false) }
    })
    .await;
    cluster.crash_shard("shard1").await.expect("crash recipient");

    let res = tokio::time::timeout(Duration::from_secs(10), migration)
        .await
        .expect("migration should give up")
        .expect("join");
    assert!(matches!(res, Err(ShardError::MigrationAborted { .. })), "{res:?}");

    let map = cluster.manager().load(NS).await.expect("load");
    assert_eq!(map.collection_version().major, before.major);
    assert!(map.chunks().iter().all(|c| c.shard == ShardId::from("shard0")));
    let donor = cluster.shard("shard0").expect("shard0");
    let owned = donor
        .find(NS, &Filter::All, Some(map.collection_version()), None)
        .await
        .expect("donor find");
    assert_eq!(xs(&owned), (-10..10).collect::<Vec<_>>());
    assert_eq!(xs(&router.find(NS, &Filter::All, None).await.expect("find")), (-10..10).collect::<Vec<_>>());

    cluster.failpoints().disable(RECIPIENT_PAUSE_CATCH_UP);
    cluster.restart_shard("shard1").await.expect("restart recipient");
    router.cleanup_orphaned(NS, None).await.expect("cleanup");
    wait_until("cloned documents to be removed", || {
        let recipient = recipient.clone();
        async move { recipient.raw_documents(NS).map(|d| d.is_empty()).unwrap_or(false) }
    })
    .await;
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_moves_of_one_range_conflict() {
    let cluster = start_cluster(3).await;
    let router = cluster.router();
    shard_on_primary(&router).await;
    insert_all(&router, docs_for(0..20)).await;

    cluster.failpoints().enable(MIGRATION_PAUSE_AFTER_CLONE, FailPointMode::Pause);
    let first_router = cluster.router();
    let first = tokio::spawn(async move {
        first_router
            .move_range(NS, ShardKey::min(1), None, ShardId::from("shard1"))
            .await
    });
    let shard1 = cluster.shard("shard1").expect("shard1");
    wait_until("first migration to clone", || {
        let shard1 = shard1.clone();
        async move { shard1.raw_documents(NS).map(|d| d.len() == 20).unwrap_or(false) }
    })
    .await;

    let second = cluster
        .router()
        .move_range(NS, ShardKey::min(1), None, ShardId::from("shard2"))
        .await;
    assert!(
        matches!(second, Err(ShardError::ConflictingOperationInProgress(_))),
        "{second:?}"
    );

    cluster.failpoints().disable(MIGRATION_PAUSE_AFTER_CLONE);
    let outcome = first.await.expect("join").expect("first migration");
    assert!(!outcome.id.is_nil());
    let chunks = router.list_chunks(NS).await.expect("list chunks");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].shard, ShardId::from("shard1"));
    assert_eq!(xs(&router.find(NS, &Filter::All, None).await.expect("find")), (0..20).collect::<Vec<_>>());
    let shard2 = cluster.shard("shard2").expect("shard2");
    assert!(shard2.raw_documents(NS).expect("raw shard2").is_empty());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replayed_commit_is_idempotent() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_split_at_zero(&router).await;
    let manager = cluster.manager();
    let map = manager.load(NS).await.expect("load");
    let range = ChunkRange::new(ShardKey::int(0), ShardKey::max(1)).expect("range");
    let from = ShardId::from("shard1");
    let to = ShardId::from("shard0");

    let first = manager
        .commit_migration(NS, map.epoch(), &range, &from, &to)
        .await
        .expect("commit");
    let after_first = manager.load(NS).await.expect("load");
    let second = manager
        .commit_migration(NS, map.epoch(), &range, &from, &to)
        .await
        .expect("replayed commit");
    assert_eq!(first, second);
    assert_eq!(manager.load(NS).await.expect("load"), after_first);
    assert!(first.version > map.collection_version());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_commit_reply_still_completes() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_split_at_zero(&router).await;
    insert_all(&router, docs_for(-10..10)).await;

    cluster
        .failpoints()
        .enable(MIGRATION_LOSE_COMMIT_ACK, FailPointMode::Times(1));
    let outcome = router
        .move_range(NS, ShardKey::int(0), None, ShardId::from("shard0"))
        .await
        .expect("move despite lost reply");
    assert_eq!(outcome.version, catalog_version(&cluster).await);
    let chunks = router.list_chunks(NS).await.expect("list chunks");
    assert!(chunks.iter().all(|c| c.shard == ShardId::from("shard0")));
    assert_eq!(xs(&router.find(NS, &Filter::All, None).await.expect("find")), (-10..10).collect::<Vec<_>>());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_before_commit_keeps_ownership() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_split_at_zero(&router).await;
    insert_all(&router, docs_for(-10..10)).await;
    let before = catalog_version(&cluster).await;

    cluster
        .failpoints()
        .enable(MIGRATION_FAIL_BEFORE_COMMIT, FailPointMode::Times(1));
    let res = router
        .move_range(NS, ShardKey::int(0), None, ShardId::from("shard0"))
        .await;
    assert!(matches!(res, Err(ShardError::MigrationAborted { .. })), "{res:?}");
    assert_eq!(catalog_version(&cluster).await, before);

    // Documents cloned onto shard0 are orphans there and must stay hidden.
    assert_eq!(xs(&router.find(NS, &Filter::All, None).await.expect("find")), (-10..10).collect::<Vec<_>>());
    let shard0 = cluster.shard("shard0").expect("shard0");
    wait_until("aborted clone to be removed", || {
        let shard0 = shard0.clone();
        async move { shard0.raw_documents(NS).map(|d| count_from(&d, 0) == 0).unwrap_or(false) }
    })
    .await;

    // The range can still move once the failure is gone.
    router
        .move_range(NS, ShardKey::int(0), None, ShardId::from("shard0"))
        .await
        .expect("retry move");
    cluster.shutdown();
}
