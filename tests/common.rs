//! Common test utilities.
//!
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tessera::core::time::{Clock, ManualClock, Tick};
use tessera::kv::{Principal, PutRequest, RangeRequest};
use tessera::raft::{LocalNetwork, MemberInfo, NodeId, Role};
use tessera::server::{Member, MemberOptions, MemberTasks};
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(10);

/// Write `contents` to a temporary config file.
pub fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

/// Minimal single-member configuration rooted at `data_dir`.
pub fn single_member_toml(data_dir: &Path) -> String {
    format!(
        r#"
[member]
id = 1
name = "solo"
data_dir = "{}"
"#,
        data_dir.display()
    )
}

pub fn members(n: u64) -> Vec<MemberInfo> {
    (1..=n)
        .map(|id| MemberInfo::new(id, format!("m{}", id), format!("local-{}", id)))
        .collect()
}

/// Options tuned for fast in-process clusters.
pub fn fast_options(id: NodeId, initial: Vec<MemberInfo>) -> MemberOptions {
    let mut options = MemberOptions::in_memory(id, initial);
    options.node.tick_interval = Duration::from_millis(10);
    options.lease_tick = Duration::from_millis(20);
    options.request_timeout = Duration::from_secs(2);
    options.retry.initial = Duration::from_millis(10);
    options.retry.max_interval = Duration::from_millis(100);
    options.retry.budget = Duration::from_secs(5);
    options.seed = Some(id);
    options
}

struct Running {
    member: Member,
    stop: watch::Sender<bool>,
    tasks: Option<MemberTasks>,
}

/// Members connected through a [`LocalNetwork`], sharing one manual clock.
pub struct TestCluster {
    pub network: LocalNetwork,
    pub clock: Arc<ManualClock>,
    nodes: Vec<Running>,
}

impl TestCluster {
    pub async fn start(n: u64) -> Self {
        Self::start_with(n, |_| {}).await
    }

    /// Start `n` members, letting `tweak` adjust each member's options.
    pub async fn start_with(n: u64, tweak: impl Fn(&mut MemberOptions)) -> Self {
        let network = LocalNetwork::new();
        let clock = Arc::new(ManualClock::new(Tick::new(1_000_000)));
        let initial = members(n);
        let mut cluster = Self {
            network,
            clock,
            nodes: Vec::new(),
        };
        for info in &initial {
            let mut options = fast_options(info.id, initial.clone());
            tweak(&mut options);
            cluster.spawn(options);
        }
        cluster
    }

    /// Start a member and join it to the network.
    pub fn spawn(&mut self, options: MemberOptions) -> Member {
        let (transport, inbox) = self.network.register(options.id, 1024);
        let (stop, stop_rx) = watch::channel(false);
        let clock: Arc<dyn Clock> = self.clock.clone();
        let (member, tasks) =
            Member::start_with_clock(options, Arc::new(transport), inbox, stop_rx, clock)
                .expect("member starts");
        self.nodes.push(Running {
            member: member.clone(),
            stop,
            tasks: Some(tasks),
        });
        member
    }

    pub fn member(&self, id: NodeId) -> Member {
        self.nodes
            .iter()
            .find(|n| n.member.id() == id)
            .map(|n| n.member.clone())
            .expect("member exists")
    }

    pub fn members(&self) -> Vec<Member> {
        self.nodes.iter().map(|n| n.member.clone()).collect()
    }

    /// Wait until some running member leads and return it.
    pub async fn leader(&self) -> Member {
        let members = self.members();
        eventually(|| {
            let members = members.clone();
            async move { members.into_iter().find(|m| m.is_leader()) }
        })
        .await
    }

    /// Wait for a leader other than `old`.
    pub async fn new_leader(&self, old: NodeId) -> Member {
        let members: Vec<Member> = self.members().into_iter().filter(|m| m.id() != old).collect();
        eventually(|| {
            let members = members.clone();
            async move {
                members
                    .into_iter()
                    .find(|m| m.raft().status().role == Role::Leader)
            }
        })
        .await
    }

    pub async fn follower(&self) -> Member {
        let leader = self.leader().await;
        self.members()
            .into_iter()
            .find(|m| m.id() != leader.id())
            .expect("cluster has a follower")
    }

    /// Stop one member and wait for its tasks.
    pub async fn stop_member(&mut self, id: NodeId) {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.member.id() == id)
            .expect("member exists");
        let mut node = self.nodes.remove(pos);
        node.stop.send_replace(true);
        if let Some(tasks) = node.tasks.take() {
            let _ = tasks.join().await;
        }
        self.network.unregister(id);
    }

    pub async fn shutdown(mut self) {
        let ids: Vec<NodeId> = self.nodes.iter().map(|n| n.member.id()).collect();
        for id in ids {
            self.stop_member(id).await;
        }
    }
}

/// Poll `check` until it yields a value or [`WAIT`] elapses.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {:?}", WAIT);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn put(member: &Member, key: &str, value: &str) -> i64 {
    member
        .put(&Principal::Anonymous, PutRequest::new(key, value))
        .await
        .expect("put succeeds")
        .0
}

/// Linearizable single-key read.
pub async fn get(member: &Member, key: &str) -> Option<Vec<u8>> {
    let (_, resp) = member
        .range(&Principal::Anonymous, RangeRequest::key(key), false)
        .await
        .expect("range succeeds");
    resp.kvs.into_iter().next().map(|kv| kv.value)
}

/// Local (serializable) single-key read.
pub async fn get_local(member: &Member, key: &str) -> Option<Vec<u8>> {
    let (_, resp) = member
        .range(&Principal::Anonymous, RangeRequest::key(key), true)
        .await
        .expect("range succeeds");
    resp.kvs.into_iter().next().map(|kv| kv.value)
}
