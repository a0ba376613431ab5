//! Authentication and role-based access control through a running member
//! and the etcd service.

mod common;

use common::{eventually, TestCluster};
use std::time::Duration;
use tessera::adapters::etcd::{proto, to_etcd_error, EtcdService, GrpcCode};
use tessera::core::error::{ErrorKind, TesseraError};
use tessera::kv::auth::prefix_permission;
use tessera::kv::{
    Permission, PermissionType, Principal, PutRequest, RangeRequest, RequestOp, TxnRequest,
    WatchRequest,
};
use tessera::server::Member;

fn root() -> Principal {
    Principal::User("root".into())
}

/// Create `root`, grant it the root role and turn authentication on.
async fn enable_auth(member: &Member) {
    let anon = Principal::Anonymous;
    member.user_add(&anon, "root", Some("rootpw")).await.unwrap();
    member.user_grant_role(&anon, "root", "root").await.unwrap();
    member.auth_enable(&anon).await.unwrap();
    assert!(member.auth_status().0);
}

/// A user `app` limited to read-write under `app/` and read-only on `shared`.
async fn add_app_user(member: &Member) {
    member.role_add(&root(), "app-rw").await.unwrap();
    member
        .role_grant_permission(&root(), "app-rw", prefix_permission(PermissionType::ReadWrite, b"app/"))
        .await
        .unwrap();
    member
        .role_grant_permission(
            &root(),
            "app-rw",
            Permission::new(PermissionType::Read, "shared", ""),
        )
        .await
        .unwrap();
    member.user_add(&root(), "app", Some("apppw")).await.unwrap();
    member.user_grant_role(&root(), "app", "app-rw").await.unwrap();
}

#[tokio::test]
async fn enabling_requires_a_root_user() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    let err = member.auth_enable(&Principal::Anonymous).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    member
        .user_add(&Principal::Anonymous, "root", Some("pw"))
        .await
        .unwrap();
    let err = member.auth_enable(&Principal::Anonymous).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition, "root role missing");
    assert!(!member.auth_status().0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn tokens_resolve_to_users() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    enable_auth(&member).await;

    let token = member.authenticate("root", "rootpw").await.unwrap();
    assert_eq!(member.principal_for(Some(&token)).unwrap(), root());

    let err = member.principal_for(None).unwrap_err();
    assert_eq!(err, TesseraError::AuthenticationRequired);
    let err = member.principal_for(Some("forged")).unwrap_err();
    assert_eq!(err, TesseraError::InvalidToken);

    let err = member.authenticate("root", "wrong").await.unwrap_err();
    assert_eq!(err, TesseraError::AuthenticationFailed);
    let err = member.authenticate("nobody", "rootpw").await.unwrap_err();
    assert_eq!(err, TesseraError::AuthenticationFailed);
    cluster.shutdown().await;
}

#[tokio::test]
async fn anonymous_requests_are_refused_once_enabled() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    common::put(&member, "k", "v").await;
    enable_auth(&member).await;

    let anon = Principal::Anonymous;
    let err = member
        .put(&anon, PutRequest::new("k", "v2"))
        .await
        .unwrap_err();
    assert_eq!(err, TesseraError::AuthenticationRequired);
    let err = member
        .range(&anon, RangeRequest::key("k"), true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    assert!(member.watch(&anon, WatchRequest::key("k")).is_err());
    assert!(member.lease_grant(&anon, 0, 10).await.is_err());

    // Root still works.
    let (_, resp) = member
        .range(&root(), RangeRequest::key("k"), false)
        .await
        .unwrap();
    assert_eq!(resp.kvs[0].value, b"v");
    cluster.shutdown().await;
}

#[tokio::test]
async fn role_permissions_bound_key_access() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    enable_auth(&member).await;
    add_app_user(&member).await;
    member
        .put(&root(), PutRequest::new("shared", "config"))
        .await
        .unwrap();

    let token = member.authenticate("app", "apppw").await.unwrap();
    let app = member.principal_for(Some(&token)).unwrap();

    member
        .put(&app, PutRequest::new("app/one", "1"))
        .await
        .unwrap();
    let (_, resp) = member
        .range(&app, RangeRequest::range("app/", "app0"), false)
        .await
        .unwrap();
    assert_eq!(resp.kvs.len(), 1);
    let (_, resp) = member
        .range(&app, RangeRequest::key("shared"), true)
        .await
        .unwrap();
    assert_eq!(resp.kvs[0].value, b"config");

    let err = member
        .put(&app, PutRequest::new("shared", "mine"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = member
        .range(&app, RangeRequest::range("a", "z"), true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(member.watch(&app, WatchRequest::key("other")).is_err());
    member.watch(&app, WatchRequest::key("app/one")).unwrap();

    // Administrative operations need the root role.
    let err = member.user_list(&app).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = member
        .member_remove(&app, member.id())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // Users may look themselves up.
    assert_eq!(member.user_get(&app, "app").await.unwrap(), vec!["app-rw".to_string()]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn transactions_are_checked_on_every_branch() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    enable_auth(&member).await;
    member.role_add(&root(), "r").await.unwrap();
    member
        .role_grant_permission(&root(), "r", Permission::new(PermissionType::ReadWrite, "foo", "zoo"))
        .await
        .unwrap();
    member.user_add(&root(), "u", Some("upw")).await.unwrap();
    member.user_grant_role(&root(), "u", "r").await.unwrap();
    let u = Principal::User("u".into());

    member.put(&u, PutRequest::new("foo1", "bar")).await.unwrap();

    // The failure branch is never taken here, but it is still checked.
    let txn = TxnRequest {
        compare: Vec::new(),
        success: vec![RequestOp::Put(PutRequest::new("foo2", "x"))],
        failure: vec![RequestOp::Put(PutRequest::new("zoo1", "x"))],
    };
    let err = member.txn(&u, txn).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let (_, resp) = member
        .range(&root(), RangeRequest::key("foo2"), false)
        .await
        .unwrap();
    assert!(resp.kvs.is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn previous_values_need_read_inside_transactions() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    enable_auth(&member).await;
    member.role_add(&root(), "writer").await.unwrap();
    member
        .role_grant_permission(&root(), "writer", prefix_permission(PermissionType::Write, b"logs/"))
        .await
        .unwrap();
    member.user_add(&root(), "w", Some("wpw")).await.unwrap();
    member.user_grant_role(&root(), "w", "writer").await.unwrap();
    let w = Principal::User("w".into());
    member
        .put(&root(), PutRequest::new("logs/secret", "hidden"))
        .await
        .unwrap();

    let put = |prev_kv: bool| {
        let mut req = PutRequest::new("logs/secret", "overwritten");
        req.prev_kv = prev_kv;
        TxnRequest {
            compare: Vec::new(),
            success: vec![RequestOp::Put(req)],
            failure: Vec::new(),
        }
    };
    let err = member.txn(&w, put(true)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let (_, resp) = member
        .range(&root(), RangeRequest::key("logs/secret"), false)
        .await
        .unwrap();
    assert_eq!(resp.kvs[0].value, b"hidden");

    member.txn(&w, put(false)).await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn revoking_a_permission_takes_effect() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    enable_auth(&member).await;
    add_app_user(&member).await;
    let app = Principal::User("app".into());

    member
        .role_revoke_permission(&root(), "app-rw", b"shared", b"")
        .await
        .unwrap();
    let perms = member.role_get(&root(), "app-rw").await.unwrap();
    assert_eq!(perms.len(), 1);
    let err = member
        .range(&app, RangeRequest::key("shared"), true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let err = member
        .role_revoke_permission(&root(), "app-rw", b"shared", b"")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    cluster.shutdown().await;
}

#[tokio::test]
async fn root_cannot_be_dismantled_while_enabled() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    enable_auth(&member).await;

    let err = member.user_delete(&root(), "root").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    let err = member
        .user_revoke_role(&root(), "root", "root")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    member.auth_disable(&root()).await.unwrap();
    assert!(!member.auth_status().0);
    member.user_delete(&Principal::Anonymous, "root").await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn password_change_invalidates_tokens() {
    let cluster = TestCluster::start(1).await;
    let member = cluster.leader().await;
    enable_auth(&member).await;
    add_app_user(&member).await;

    let token = member.authenticate("app", "apppw").await.unwrap();
    member
        .user_change_password(&root(), "app", "newpw")
        .await
        .unwrap();
    assert_eq!(member.principal_for(Some(&token)).unwrap_err(), TesseraError::InvalidToken);
    assert!(member.authenticate("app", "apppw").await.is_err());
    member.authenticate("app", "newpw").await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn tokens_expire_with_cluster_time() {
    let cluster = TestCluster::start_with(1, |o| o.token_ttl = Duration::from_secs(30)).await;
    let member = cluster.leader().await;
    enable_auth(&member).await;

    let token = member.authenticate("root", "rootpw").await.unwrap();
    cluster.clock.advance_ms(10_000);
    tokio::time::sleep(Duration::from_millis(100)).await;
    member.principal_for(Some(&token)).unwrap();

    cluster.clock.advance_ms(25_000);
    eventually(|| {
        let member = member.clone();
        let token = token.clone();
        async move { member.principal_for(Some(&token)).is_err().then_some(()) }
    })
    .await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn auth_state_replicates_to_followers() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader().await;
    enable_auth(&leader).await;
    let token = leader.authenticate("root", "rootpw").await.unwrap();

    for member in cluster.members() {
        let found = eventually(|| {
            let member = member.clone();
            let token = token.clone();
            async move { member.principal_for(Some(&token)).ok() }
        })
        .await;
        assert_eq!(found, root());
    }
    let follower = cluster.follower().await;
    let follower_token = follower.authenticate("root", "rootpw").await.unwrap();
    assert_eq!(leader.principal_for(Some(&follower_token)).unwrap(), root());
    cluster.shutdown().await;
}

// ============================================================================
// etcd service
// ============================================================================

#[tokio::test]
async fn service_auth_flow() {
    let cluster = TestCluster::start(1).await;
    let service = EtcdService::new(cluster.leader().await);

    service
        .user_add(
            None,
            proto::AuthUserAddRequest {
                name: "root".into(),
                password: "rootpw".into(),
                options: None,
            },
        )
        .await
        .unwrap();
    service
        .user_grant_role(
            None,
            proto::AuthUserGrantRoleRequest {
                user: "root".into(),
                role: "root".into(),
            },
        )
        .await
        .unwrap();
    service.auth_enable(None).await.unwrap();

    let token = service
        .authenticate(proto::AuthenticateRequest {
            name: "root".into(),
            password: "rootpw".into(),
        })
        .await
        .unwrap()
        .token;
    assert!(!token.is_empty());

    let status = service.auth_status(Some(&token)).unwrap();
    assert!(status.enabled);
    assert!(status.auth_revision >= 3);

    let put = proto::PutRequest {
        key: b"k".to_vec(),
        value: b"v".to_vec(),
        ..Default::default()
    };
    service.put(Some(&token), put.clone()).await.unwrap();

    let err = service.put(None, put.clone()).await.unwrap_err();
    assert_eq!(to_etcd_error(&err).message, "etcdserver: user name is empty");
    let err = service.put(Some("bogus"), put).await.unwrap_err();
    assert_eq!(to_etcd_error(&err).code, GrpcCode::Unauthenticated);

    let err = service
        .authenticate(proto::AuthenticateRequest {
            name: "root".into(),
            password: "nope".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(
        to_etcd_error(&err).message,
        "etcdserver: authentication failed, invalid user ID or password"
    );

    let users = service.user_list(Some(&token)).await.unwrap();
    assert_eq!(users.users, vec!["root".to_string()]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn service_rejects_empty_passwords_unless_asked() {
    let cluster = TestCluster::start(1).await;
    let service = EtcdService::new(cluster.leader().await);

    let err = service
        .user_add(
            None,
            proto::AuthUserAddRequest {
                name: "svc".into(),
                password: String::new(),
                options: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    service
        .user_add(
            None,
            proto::AuthUserAddRequest {
                name: "svc".into(),
                password: String::new(),
                options: Some(proto::UserAddOptions { no_password: true }),
            },
        )
        .await
        .unwrap();
    let roles = service
        .user_get(None, proto::AuthUserGetRequest { name: "svc".into() })
        .await
        .unwrap();
    assert!(roles.roles.is_empty());
    cluster.shutdown().await;
}
