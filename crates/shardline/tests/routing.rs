//! Routing through the catalog cache while chunks change hands.
//!
//! Test flow:
//! 1) Shard `foo.bar` on `x` with `[MinKey, 0)` on shard0 and `[0, MaxKey)` on shard1.
//! 2) Warm a second router, then move `[0, MaxKey)` to shard0 through the first.
//! 3) Write and read through the stale router.
//!
//! Failure model covered:
//! - A router holding an old routing table sends a write to the former owner.
//! - Split/merge/move leave the routing table with gaps or stale versions.
//! - Only some of the shards a multi-write targets know the newer version.
//!
//! Verification:
//! - The stale write is applied exactly once, on the new owner.
//! - A stale multi-write reports what every shard applied, even after a retry.
//! - Versions only move forward and every document stays visible exactly once.

mod common;

use serde_json::json;

use common::{
    catalog_version, doc, docs_for, insert_all, range, shard_on_primary, shard_split_at_zero, start_cluster, xs, NS,
};
use shardline::query::{Stage, UpdateOp, UpdateSpec};
use shardline::{ChunkRange, Command, CommandReply, Filter, ShardError, ShardId, ShardKey};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_router_write_lands_once_on_new_owner() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_split_at_zero(&router).await;
    insert_all(&router, docs_for(-10..10)).await;

    let stale = cluster.router();
    assert_eq!(stale.find(NS, &Filter::All, None).await.expect("warm").len(), 20);
    let before = catalog_version(&cluster).await;
    assert_eq!(stale.cache().cached_version(NS), Some(before));

    let moved = router
        .move_range(NS, ShardKey::int(0), None, ShardId::from("shard0"))
        .await
        .expect("move range");
    assert!(moved.version > before, "{} should be newer than {before}", moved.version);
    assert_eq!(stale.cache().cached_version(NS), Some(before));

    let reply = stale
        .insert(NS, vec![doc(json!({"_id": "stale-write", "x": 5}))], None)
        .await;
    assert!(reply.error.is_none(), "stale insert failed: {:?}", reply.error);
    assert_eq!(reply.inserted, 1);
    assert_eq!(stale.cache().cached_version(NS), Some(moved.version));

    let found = router
        .find(NS, &Filter::eq("_id", "stale-write"), None)
        .await
        .expect("find stale write");
    assert_eq!(found.len(), 1);
    let on_new_owner = cluster
        .shard("shard0")
        .expect("shard0")
        .raw_documents(NS)
        .expect("raw shard0");
    assert!(on_new_owner
        .iter()
        .any(|d| d.get("_id") == Some(&json!("stale-write"))));
    let on_old_owner = cluster
        .shard("shard1")
        .expect("shard1")
        .raw_documents(NS)
        .expect("raw shard1");
    assert!(!on_old_owner
        .iter()
        .any(|d| d.get("_id") == Some(&json!("stale-write"))));

    let all = stale.find(NS, &Filter::All, None).await.expect("find all");
    assert_eq!(all.len(), 21);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_and_merge_bump_versions() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_on_primary(&router).await;
    insert_all(&router, docs_for(-5..5)).await;
    let initial = catalog_version(&cluster).await;

    let split = router.split_chunk(NS, ShardKey::int(0)).await.expect("split");
    assert!(split > initial);
    let again = router.split_chunk(NS, ShardKey::int(0)).await.expect("split at a boundary");
    assert_eq!(again, split);

    let chunks = router.list_chunks(NS).await.expect("list chunks");
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].range.max, ShardKey::int(0));
    assert_eq!(chunks[1].range.min, ShardKey::int(0));
    assert!(chunks.iter().all(|c| c.shard == ShardId::from("shard0")));

    let merged = router
        .merge_chunks(NS, ChunkRange::full(1))
        .await
        .expect("merge");
    assert!(merged > split);
    assert_eq!(router.list_chunks(NS).await.expect("list chunks").len(), 1);
    assert_eq!(xs(&router.find(NS, &Filter::All, None).await.expect("find")), (-5..5).collect::<Vec<_>>());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn move_range_splits_inside_a_chunk() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_on_primary(&router).await;
    insert_all(&router, docs_for(0..20)).await;

    router
        .move_range(NS, ShardKey::int(5), Some(ShardKey::int(10)), ShardId::from("shard1"))
        .await
        .expect("move sub-range");
    let chunks = router.list_chunks(NS).await.expect("list chunks");
    let moved: Vec<_> = chunks.iter().filter(|c| c.shard == ShardId::from("shard1")).collect();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].range, range(5, 10));
    assert_eq!(chunks.len(), 3);

    let shard1 = cluster.shard("shard1").expect("shard1");
    let version = catalog_version(&cluster).await;
    let owned = shard1.find(NS, &Filter::All, Some(version), None).await.expect("find on shard1");
    assert_eq!(xs(&owned), (5..10).collect::<Vec<_>>());
    assert_eq!(xs(&router.find(NS, &Filter::All, None).await.expect("find")), (0..20).collect::<Vec<_>>());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn move_to_current_owner_changes_nothing() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_split_at_zero(&router).await;
    let before = catalog_version(&cluster).await;
    let outcome = router
        .move_range(NS, ShardKey::int(0), None, ShardId::from("shard1"))
        .await
        .expect("no-op move");
    assert!(outcome.id.is_nil());
    assert_eq!(outcome.version, before);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aggregate_update_and_delete_span_shards() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_split_at_zero(&router).await;
    insert_all(&router, docs_for(-10..10)).await;

    let total = router
        .aggregate(NS, &[Stage::Count("n".to_string())])
        .await
        .expect("count");
    assert_eq!(total, vec![doc(json!({"n": 20}))]);
    let low = router
        .aggregate(
            NS,
            &[Stage::Match(Filter::ShardKeyRange(range(0, 5))), Stage::Count("n".to_string())],
        )
        .await
        .expect("count range");
    assert_eq!(low, vec![doc(json!({"n": 5}))]);

    let tagged = router
        .update(
            NS,
            &UpdateSpec {
                filter: Filter::ShardKeyRange(range(-2, 2)),
                op: UpdateOp::Set(doc(json!({"tag": "mid"}))),
                multi: true,
                upsert: false,
            },
            None,
        )
        .await
        .expect("multi update");
    assert_eq!(tagged.matched, 4);
    assert_eq!(tagged.modified, 4);
    let mid = router
        .find(NS, &Filter::eq("tag", "mid"), None)
        .await
        .expect("find tagged");
    assert_eq!(xs(&mid), vec![-2, -1, 0, 1]);

    let deleted = router
        .delete(NS, &Filter::ShardKeyRange(range(-10, 0)), true, None)
        .await
        .expect("delete");
    assert_eq!(deleted, 10);
    assert_eq!(xs(&router.find(NS, &Filter::All, None).await.expect("find")), (0..10).collect::<Vec<_>>());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shard_key_changes_are_refused() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_split_at_zero(&router).await;
    insert_all(&router, docs_for(0..1)).await;
    let err = router
        .update(
            NS,
            &UpdateSpec {
                filter: Filter::eq("_id", 0),
                op: UpdateOp::Set(doc(json!({"x": -1}))),
                multi: false,
                upsert: false,
            },
            None,
        )
        .await
        .expect_err("shard key update");
    assert!(matches!(err, ShardError::InvalidOptions(_) | ShardError::IllegalOperation(_)), "{err}");
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_multi_writes_count_every_shard_once() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_split_at_zero(&router).await;
    insert_all(&router, docs_for(-5..5)).await;
    let stale = cluster.router();
    assert_eq!(stale.find(NS, &Filter::All, None).await.expect("warm").len(), 10);
    let shard1 = cluster.shard("shard1").expect("shard1");

    // shard0 still accepts the old version; shard1 does not.
    router.split_chunk(NS, ShardKey::int(2)).await.expect("split");
    shard1.refresh_metadata(NS).await.expect("refresh shard1");
    let tagged = stale
        .update(
            NS,
            &UpdateSpec {
                filter: Filter::All,
                op: UpdateOp::Set(doc(json!({"tag": "all"}))),
                multi: true,
                upsert: false,
            },
            None,
        )
        .await
        .expect("stale multi update");
    assert_eq!(tagged.matched, 10);
    assert_eq!(tagged.modified, 10);

    let shard0 = cluster.shard("shard0").expect("shard0");
    shard0.refresh_metadata(NS).await.expect("refresh shard0");
    router.split_chunk(NS, ShardKey::int(3)).await.expect("split");
    shard1.refresh_metadata(NS).await.expect("refresh shard1");
    let deleted = stale
        .delete(NS, &Filter::All, true, None)
        .await
        .expect("stale multi delete");
    assert_eq!(deleted, 10);
    assert!(router.find(NS, &Filter::All, None).await.expect("find").is_empty());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disallowed_migrations_refuse_moves() {
    let cluster = start_cluster(2).await;
    let router = cluster.router();
    shard_split_at_zero(&router).await;
    insert_all(&router, docs_for(-5..5)).await;
    let before = catalog_version(&cluster).await;

    let command: Command = serde_json::from_value(json!({
        "command": "setAllowMigrations",
        "ns": NS,
        "allow": false
    }))
    .expect("command");
    assert_eq!(router.run_command(command).await.expect("disallow"), CommandReply::Ok);
    assert!(!cluster.manager().collection(NS).await.expect("collection").allow_migrations);

    let res = router
        .move_range(NS, ShardKey::int(0), None, ShardId::from("shard0"))
        .await;
    assert!(matches!(res, Err(ShardError::ConflictingOperationInProgress(_))), "{res:?}");
    assert_eq!(catalog_version(&cluster).await, before);

    router.set_allow_migrations(NS, true).await.expect("allow");
    router
        .move_range(NS, ShardKey::int(0), None, ShardId::from("shard0"))
        .await
        .expect("move once allowed");
    assert_eq!(xs(&router.find(NS, &Filter::All, None).await.expect("find")), (-5..5).collect::<Vec<_>>());
    cluster.shutdown();
}
