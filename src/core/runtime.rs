//! Process runtime.
//!
//! Start order: member (log, state machine, Raft) → peer listener → client
//! listener. Shutdown runs in reverse: listeners stop accepting first, then
//! the member drains and stops.

use crate::core::config::Config;
use crate::net::tls::{TlsIdentity, TlsPaths};
use crate::raft::transport::Transport;
use crate::server::{Member, MemberOptions, MemberTasks};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long listeners get to finish in-flight calls on shutdown.
const LISTENER_DRAIN: Duration = Duration::from_secs(5);

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Starting,
    Healthy,
    Failed,
    Stopping,
    Stopped,
}

/// Health of the two runtime components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub member: ComponentHealth,
    pub listeners: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            member: ComponentHealth::Starting,
            listeners: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    pub fn is_ready(&self) -> bool {
        self.member == ComponentHealth::Healthy && self.listeners == ComponentHealth::Healthy
    }

    pub fn is_alive(&self) -> bool {
        self.member != ComponentHealth::Failed && self.listeners != ComponentHealth::Failed
    }
}

type ListenerTask = JoinHandle<Result<()>>;

/// One member process: the replicated store plus its listeners.
pub struct Runtime {
    config: Arc<Config>,
    health: RuntimeHealth,
    running: Arc<AtomicBool>,

    /// External shutdown trigger.
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Internal, ordered shutdown signals.
    listeners_tx: watch::Sender<bool>,
    member_tx: watch::Sender<bool>,

    member: Option<Member>,
    member_tasks: Option<MemberTasks>,
    listeners: Vec<(&'static str, ListenerTask)>,
    client_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (listeners_tx, _) = watch::channel(false);
        let (member_tx, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            listeners_tx,
            member_tx,
            member: None,
            member_tasks: None,
            listeners: Vec::new(),
            client_addr: None,
            peer_addr: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The local member, once started.
    pub fn member(&self) -> Option<&Member> {
        self.member.as_ref()
    }

    /// Bound client address (resolves port 0).
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn start(&mut self) -> Result<()> {
        let options = MemberOptions::from_config(&self.config);
        tracing::info!(
            member_id = options.id,
            name = %options.name,
            data_dir = %self.config.member.data_dir.display(),
            members = options.initial_members.len(),
            "starting tessera"
        );

        let (inbox_tx, inbox_rx) = mpsc::channel(options.node.input_queue);
        let transport = self.transport(&options)?;
        let (member, tasks) = Member::start(options, transport, inbox_rx, self.member_tx.subscribe())
            .context("failed to start member")?;
        self.member = Some(member.clone());
        self.member_tasks = Some(tasks);
        self.health.member = ComponentHealth::Healthy;

        self.start_listeners(member, inbox_tx).await?;
        self.health.listeners = ComponentHealth::Healthy;

        self.running.store(true, Ordering::Release);
        tracing::info!(
            client = ?self.client_addr,
            peer = ?self.peer_addr,
            "tessera started"
        );
        Ok(())
    }

    #[cfg(feature = "grpc")]
    fn transport(&self, options: &MemberOptions) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(crate::net::peer::GrpcTransport::new(
            options.id,
            options.request_timeout,
        )))
    }

    /// Without gRPC there is no peer network, so only a single member can run.
    #[cfg(not(feature = "grpc"))]
    fn transport(&self, options: &MemberOptions) -> Result<Arc<dyn Transport>> {
        if options.initial_members.len() > 1 {
            anyhow::bail!("multi-member clusters need the `grpc` feature");
        }
        let network = crate::raft::transport::LocalNetwork::new();
        let (transport, _inbox) = network.register(options.id, 1);
        Ok(Arc::new(transport))
    }

    #[cfg(feature = "grpc")]
    async fn start_listeners(&mut self, member: Member, inbox: mpsc::Sender<crate::raft::message::Message>) -> Result<()> {
        use crate::adapters::etcd::{EtcdService, EtcdServices};
        use crate::net::peer::PeerServer;
        use tonic::transport::server::TcpIncoming;
        use tonic::transport::Server;

        let listeners = &self.config.listeners;

        let peer_listener = tokio::net::TcpListener::bind(&listeners.peer_bind)
            .await
            .with_context(|| format!("binding peer listener on {}", listeners.peer_bind))?;
        self.peer_addr = Some(peer_listener.local_addr()?);
        let peer_incoming =
            TcpIncoming::from_listener(peer_listener, true, None).map_err(anyhow::Error::msg)?;
        let peer_router = Server::builder().add_service(PeerServer::new(member.id(), inbox));
        let stop = wait_for(self.listeners_tx.subscribe());
        let task = tokio::spawn(async move {
            peer_router
                .serve_with_incoming_shutdown(peer_incoming, stop)
                .await
                .context("peer listener failed")
        });
        self.listeners.push(("peer", task));

        let mut server = Server::builder();
        if let Some(paths) = TlsPaths::from_listeners(listeners) {
            let identity = TlsIdentity::load(&paths).context("loading client TLS identity")?;
            server = with_tls(server, &identity)?;
        } else {
            tracing::warn!(bind = %listeners.client_bind, "client listener runs without TLS");
        }

        let client_listener = tokio::net::TcpListener::bind(&listeners.client_bind)
            .await
            .with_context(|| format!("binding client listener on {}", listeners.client_bind))?;
        self.client_addr = Some(client_listener.local_addr()?);
        let client_incoming =
            TcpIncoming::from_listener(client_listener, true, None).map_err(anyhow::Error::msg)?;
        let client_router = EtcdServices::new(EtcdService::new(member)).add_to(&mut server);
        let stop = wait_for(self.listeners_tx.subscribe());
        let task = tokio::spawn(async move {
            client_router
                .serve_with_incoming_shutdown(client_incoming, stop)
                .await
                .context("client listener failed")
        });
        self.listeners.push(("client", task));
        Ok(())
    }

    #[cfg(not(feature = "grpc"))]
    async fn start_listeners(&mut self, _member: Member, _inbox: mpsc::Sender<crate::raft::message::Message>) -> Result<()> {
        if TlsPaths::from_listeners(&self.config.listeners).is_some() {
            anyhow::bail!("TLS is configured but this build has no client listener");
        }
        tracing::warn!("built without `grpc`; no listeners started");
        Ok(())
    }

    /// Run until Ctrl-C, an external shutdown, or a listener failure.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        let failed = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
                None
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested");
                None
            }
            index = first_exit(&mut self.listeners) => Some(index),
        };

        // A finished JoinHandle must not be polled again.
        if let Some((index, outcome)) = failed {
            let (name, _) = self.listeners.remove(index);
            match outcome {
                Ok(()) => tracing::error!(listener = name, "listener stopped unexpectedly"),
                Err(e) => tracing::error!(listener = name, error = %format!("{:#}", e), "listener failed"),
            }
            self.health.listeners = ComponentHealth::Failed;
        }

        self.stop().await
    }

    /// Stop listeners, then the member.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping tessera");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        if self.health.listeners != ComponentHealth::Failed {
            self.health.listeners = ComponentHealth::Stopping;
        }
        self.listeners_tx.send_replace(true);
        for (name, task) in self.listeners.drain(..) {
            match tokio::time::timeout(LISTENER_DRAIN, task).await {
                Ok(Ok(Ok(()))) => tracing::info!(listener = name, "listener stopped"),
                Ok(Ok(Err(e))) => tracing::warn!(listener = name, error = %format!("{:#}", e), "listener stopped with error"),
                Ok(Err(e)) => tracing::warn!(listener = name, error = %e, "listener task panicked"),
                Err(_) => tracing::warn!(listener = name, "listener stop timed out"),
            }
        }
        if self.health.listeners != ComponentHealth::Failed {
            self.health.listeners = ComponentHealth::Stopped;
        }

        self.health.member = ComponentHealth::Stopping;
        self.member_tx.send_replace(true);
        self.member = None;
        let result = match self.member_tasks.take() {
            Some(tasks) => tasks.join().await.context("member stopped with error"),
            None => Ok(()),
        };
        self.health.member = if result.is_ok() {
            ComponentHealth::Stopped
        } else {
            ComponentHealth::Failed
        };

        tracing::info!("tessera stopped");
        result
    }
}

#[cfg(feature = "tls")]
fn with_tls(server: tonic::transport::Server, identity: &TlsIdentity) -> Result<tonic::transport::Server> {
    server
        .tls_config(identity.server_config())
        .context("configuring client TLS")
}

#[cfg(all(feature = "grpc", not(feature = "tls")))]
fn with_tls(_server: tonic::transport::Server, _identity: &TlsIdentity) -> Result<tonic::transport::Server> {
    anyhow::bail!("TLS is configured but this build lacks the `tls` feature")
}

/// Resolve once `rx` turns true or its sender goes away.
async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolve with the position and outcome of the first listener task to
/// exit. Pending forever when there are none.
async fn first_exit(listeners: &mut [(&'static str, ListenerTask)]) -> (usize, Result<()>) {
    if listeners.is_empty() {
        return futures::future::pending().await;
    }
    let watched = listeners.iter_mut().map(|(_, task)| task);
    let (joined, index, _) = futures::future::select_all(watched).await;
    let outcome = match joined {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("listener task panicked: {}", e)),
    };
    (index, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(dir: &std::path::Path) -> Config {
        let mut config = Config::single_member(1, dir.to_path_buf());
        config.listeners.client_bind = "127.0.0.1:0".into();
        config.listeners.peer_bind = "127.0.0.1:0".into();
        config
    }

    #[test]
    fn health_requires_both_components() {
        let mut health = RuntimeHealth::default();
        assert!(!health.is_ready());
        health.member = ComponentHealth::Healthy;
        health.listeners = ComponentHealth::Healthy;
        assert!(health.is_ready());
        health.listeners = ComponentHealth::Failed;
        assert!(!health.is_alive());
    }

    #[tokio::test]
    async fn wait_for_resolves_on_signal_or_drop() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for(rx));
        tx.send(true).unwrap();
        waiter.await.unwrap();

        let (tx, rx) = watch::channel(false);
        drop(tx);
        wait_for(rx).await;
    }

    #[cfg(feature = "grpc")]
    #[tokio::test]
    async fn start_and_stop_single_member() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = Runtime::new(local_config(dir.path())).unwrap();
        runtime.start().await.unwrap();
        assert!(runtime.is_ready());
        assert!(runtime.client_addr().is_some());
        assert!(runtime.member().is_some());

        runtime.stop().await.unwrap();
        assert_eq!(runtime.health().member, ComponentHealth::Stopped);
        assert_eq!(runtime.health().listeners, ComponentHealth::Stopped);
        assert!(!runtime.is_running());
    }
}
