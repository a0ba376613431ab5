//! Multi-member behavior: replication, failover, watches, leases,
//! membership changes and restart from disk.

mod common;

use common::{eventually, fast_options, get, get_local, put, TestCluster};
use std::time::Duration;
use tessera::core::error::ErrorKind;
use tessera::kv::{Principal, PutRequest, RangeRequest, WatchNotice, WatchRequest};
use tessera::raft::Role;
use tokio::time::timeout;

#[tokio::test]
async fn writes_are_visible_everywhere() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    let rev = put(&leader, "color", "blue").await;

    for member in cluster.members() {
        // Linearizable reads see the write on every member, followers
        // included.
        assert_eq!(get(&member, "color").await, Some(b"blue".to_vec()));
        assert!(member.current_revision() >= rev);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn followers_accept_writes() {
    let cluster = TestCluster::start(3).await;
    let follower = cluster.follower().await;
    let rev = put(&follower, "via", "follower").await;
    assert!(rev >= 1);

    let leader = cluster.leader().await;
    assert_eq!(get(&leader, "via").await, Some(b"follower".to_vec()));
    cluster.shutdown().await;
}

#[tokio::test]
async fn serializable_reads_converge() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    put(&leader, "k", "v").await;

    for member in cluster.members() {
        eventually(|| {
            let member = member.clone();
            async move { get_local(&member, "k").await }
        })
        .await;
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn leader_failover_keeps_committed_data() {
    let mut cluster = TestCluster::start(3).await;
    let old = cluster.leader().await;
    let rev = put(&old, "stable", "yes").await;
    for member in cluster.members() {
        eventually(|| {
            let member = member.clone();
            async move { (member.current_revision() >= rev).then_some(()) }
        })
        .await;
    }

    cluster.stop_member(old.id()).await;
    let new = cluster.new_leader(old.id()).await;
    assert_ne!(new.id(), old.id());

    assert_eq!(get(&new, "stable").await, Some(b"yes".to_vec()));
    let next = put(&new, "after", "failover").await;
    assert!(next > rev);

    let survivor = cluster
        .members()
        .into_iter()
        .find(|m| m.id() != new.id())
        .unwrap();
    assert_eq!(get(&survivor, "after").await, Some(b"failover".to_vec()));
    cluster.shutdown().await;
}

#[tokio::test]
async fn minority_cannot_serve_linearizable_reads() {
    let cluster = TestCluster::start_with(3, |o| {
        o.request_timeout = Duration::from_millis(300);
        o.retry.budget = Duration::from_millis(600);
    })
    .await;
    let leader = cluster.leader().await;
    put(&leader, "k", "v").await;

    let follower = cluster.follower().await;
    eventually(|| {
        let follower = follower.clone();
        async move { get_local(&follower, "k").await }
    })
    .await;
    cluster.network.isolate(follower.id());
    let err = follower
        .range(&Principal::Anonymous, RangeRequest::key("k"), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    // Local reads still answer from applied state.
    assert_eq!(get_local(&follower, "k").await, Some(b"v".to_vec()));
    cluster.network.heal_all();
    cluster.shutdown().await;
}

#[tokio::test]
async fn watches_on_followers_see_leader_writes_in_order() {
    let cluster = TestCluster::start(3).await;
    let follower = cluster.follower().await;
    let mut sub = follower
        .watch(&Principal::Anonymous, WatchRequest::range("a", "z"))
        .unwrap();

    let leader = cluster.leader().await;
    let mut expected = Vec::new();
    for i in 0..5 {
        expected.push(put(&leader, &format!("k{}", i), "v").await);
    }

    let mut seen = Vec::new();
    while seen.len() < expected.len() {
        match timeout(common::WAIT, sub.notices.recv()).await.unwrap().unwrap() {
            WatchNotice::Events { revision, events } => {
                assert_eq!(events.len(), 1);
                seen.push(revision);
            }
            other => panic!("unexpected notice {:?}", other),
        }
    }
    assert_eq!(seen, expected);
    assert!(follower.cancel_watch(sub.id));
    cluster.shutdown().await;
}

#[tokio::test]
async fn follower_watch_from_a_future_revision_waits_for_it() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    let base = put(&leader, "job", "0").await;

    let follower = cluster.follower().await;
    eventually(|| {
        let follower = follower.clone();
        async move { (follower.current_revision() >= base).then_some(()) }
    })
    .await;
    let mut sub = follower
        .watch(
            &Principal::Anonymous,
            WatchRequest::key("job").from_revision(base + 2),
        )
        .unwrap();

    put(&leader, "job", "1").await;
    let target = put(&leader, "job", "2").await;
    assert_eq!(target, base + 2);

    match timeout(common::WAIT, sub.notices.recv()).await.unwrap().unwrap() {
        WatchNotice::Events { revision, events } => {
            assert_eq!(revision, target);
            assert_eq!(events[0].kv.value, b"2");
        }
        other => panic!("unexpected notice {:?}", other),
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn leases_expire_with_cluster_time() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    let grant = leader
        .lease_grant(&Principal::Anonymous, 0, 5)
        .await
        .unwrap();
    leader
        .put(
            &Principal::Anonymous,
            PutRequest::new("ephemeral", "x").with_lease(grant.id),
        )
        .await
        .unwrap();
    put(&leader, "durable", "y").await;

    let follower = cluster.follower().await;
    let mut sub = follower
        .watch(&Principal::Anonymous, WatchRequest::key("ephemeral"))
        .unwrap();

    cluster.clock.advance_ms(6_000);
    let notice = timeout(common::WAIT, sub.notices.recv()).await.unwrap().unwrap();
    let WatchNotice::Events { events, .. } = notice else {
        panic!("expected events");
    };
    assert_eq!(events[0].kind, tessera::kv::EventKind::Delete);

    for member in cluster.members() {
        assert_eq!(get(&member, "ephemeral").await, None);
        assert_eq!(get(&member, "durable").await, Some(b"y".to_vec()));
    }
    let ttl = leader
        .lease_time_to_live(&Principal::Anonymous, grant.id, false)
        .await
        .unwrap();
    assert_eq!(ttl.ttl, -1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn keep_alive_extends_a_lease() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    let grant = member.lease_grant(&Principal::Anonymous, 42, 5).await.unwrap();
    assert_eq!(grant.id, 42);

    cluster.clock.advance_ms(3_000);
    eventually(|| {
        let member = member.clone();
        async move {
            let ttl = member
                .lease_time_to_live(&Principal::Anonymous, 42, false)
                .await
                .ok()?;
            (ttl.ttl <= 2).then_some(())
        }
    })
    .await;

    assert_eq!(member.lease_keep_alive(&Principal::Anonymous, 42).await.unwrap(), 5);
    cluster.clock.advance_ms(3_000);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        member.lease_leases(&Principal::Anonymous).await.unwrap(),
        vec![42]
    );

    cluster.clock.advance_ms(3_000);
    eventually(|| {
        let member = member.clone();
        async move {
            let leases = member.lease_leases(&Principal::Anonymous).await.ok()?;
            leases.is_empty().then_some(())
        }
    })
    .await;
    let err = member
        .lease_keep_alive(&Principal::Anonymous, 42)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    cluster.shutdown().await;
}

#[tokio::test]
async fn lease_ttl_is_capped() {
    let cluster = TestCluster::start_with(1, |o| o.max_lease_ttl = 60).await;
    let member = cluster.leader().await;
    let err = member
        .lease_grant(&Principal::Anonymous, 0, 61)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    cluster.shutdown().await;
}

#[tokio::test]
async fn added_member_catches_up_and_removed_member_leaves() {
    let mut cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    put(&leader, "before", "join").await;

    let info = leader
        .member_add(&Principal::Anonymous, "m4", "local-new", "")
        .await
        .unwrap();
    assert_eq!(leader.member_list().len(), 4);

    // A joining member starts from the membership that includes itself.
    let joined = cluster.spawn(fast_options(info.id, leader.member_list()));
    eventually(|| {
        let joined = joined.clone();
        async move { get_local(&joined, "before").await }
    })
    .await;
    eventually(|| {
        let joined = joined.clone();
        async move { (joined.member_list().len() == 4).then_some(()) }
    })
    .await;

    // The newcomer counts towards the quorum and serves reads.
    put(&leader, "after", "join").await;
    assert_eq!(get(&joined, "after").await, Some(b"join".to_vec()));

    let follower = cluster
        .members()
        .into_iter()
        .find(|m| m.id() != leader.id() && m.id() != info.id)
        .unwrap();
    let leader = cluster.leader().await;
    leader
        .member_remove(&Principal::Anonymous, follower.id())
        .await
        .unwrap();
    assert!(leader.member_list().iter().all(|m| m.id != follower.id()));
    cluster.stop_member(follower.id()).await;

    put(&leader, "after", "remove").await;
    assert_eq!(get(&joined, "after").await, Some(b"remove".to_vec()));
    cluster.shutdown().await;
}

#[tokio::test]
async fn membership_changes_validate_their_target() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    let err = member
        .member_remove(&Principal::Anonymous, 999)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = member
        .member_update(&Principal::Anonymous, 999, "local-x")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    member
        .member_update(&Principal::Anonymous, 1, "local-moved")
        .await
        .unwrap();
    assert_eq!(member.member_list()[0].peer_addr, "local-moved");
    cluster.shutdown().await;
}

#[tokio::test]
async fn restart_recovers_state_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let options = || {
        let mut o = fast_options(1, common::members(1));
        o.data_dir = Some(dir.path().to_path_buf());
        o.snapshot_interval = 8;
        o.wal.fsync = false;
        o
    };

    let mut cluster = TestCluster::start_with(0, |_| {}).await;
    let member = cluster.spawn(options());
    eventually(|| {
        let member = member.clone();
        async move { (member.raft().status().role == Role::Leader).then_some(()) }
    })
    .await;
    let mut last = 0;
    for i in 0..20 {
        last = put(&member, &format!("key-{:02}", i), &i.to_string()).await;
    }
    let hash_before = member.hash_kv(0).unwrap().0;
    cluster.stop_member(1).await;

    let member = cluster.spawn(options());
    eventually(|| {
        let member = member.clone();
        async move { (member.current_revision() >= last).then_some(()) }
    })
    .await;
    assert_eq!(member.current_revision(), last);
    assert_eq!(member.hash_kv(0).unwrap().0, hash_before);
    assert_eq!(get(&member, "key-07").await, Some(b"7".to_vec()));

    let next = put(&member, "post-restart", "ok").await;
    assert_eq!(next, last + 1);
    assert!(dir.path().join("snap").read_dir().unwrap().next().is_some());
    cluster.shutdown().await;
}

#[tokio::test]
async fn auto_compaction_keeps_recent_history() {
    let cluster = TestCluster::start_with(1, |o| {
        o.compaction_retention = 3;
        o.compaction_interval = Duration::from_millis(20);
    })
    .await;
    let member = cluster.leader().await;
    let mut last = 0;
    for i in 0..10 {
        last = put(&member, "k", &i.to_string()).await;
    }

    eventually(|| {
        let member = member.clone();
        async move { (member.status().compact_revision == last - 3).then_some(()) }
    })
    .await;
    let err = member
        .range(&Principal::Anonymous, RangeRequest::key("k").at_revision(1), true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RevisionCompacted);
    let (_, resp) = member
        .range(
            &Principal::Anonymous,
            RangeRequest::key("k").at_revision(last - 3),
            true,
        )
        .await
        .unwrap();
    assert_eq!(resp.kvs[0].value, b"6");
    cluster.shutdown().await;
}
