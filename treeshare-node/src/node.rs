//! Node supervisor: owns the endpoint, the worker tasks and the event stream.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use treeshare_core::{Identifier, MatchFinder, PeerEntry, RequestError, ShareCore};

use crate::config::{Config, ConfigError};
use crate::dispatcher::{self, run_receive_loop, Outbound, SendError};
use crate::endpoint::MulticastEndpoint;
use crate::finder::TreeFinder;
use crate::transfer::TransferPool;
use crate::workers::{self, NodeEvent};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("cannot join multicast group {group}: {source}")]
    EndpointUnavailable { group: SocketAddr, source: io::Error },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// A running node. Dropping it without [`Node::shutdown`] aborts the workers and leaves
/// detached transfers to the runtime.
pub struct Node {
    core: Arc<ShareCore>,
    out: Outbound,
    endpoint: Option<MulticastEndpoint>,
    transfers: TransferPool,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    events: UnboundedReceiver<NodeEvent>,
    drain_timeout: Duration,
}

impl Node {
    /// Join the configured group and start all workers. Must run inside a tokio runtime.
    pub fn start(config: &Config) -> Result<Self, NodeError> {
        let identifier = config.identifier()?;
        let group = SocketAddr::new(config.group, config.port);
        let endpoint = MulticastEndpoint::join(config)
            .map_err(|source| NodeError::EndpointUnavailable { group, source })?;
        info!(id = %identifier, %group, search = config.search, download = config.download, "joined group");
        let socket = endpoint.socket();
        let dest = endpoint.group();
        Ok(Self::spawn(config, identifier, socket, dest, Some(endpoint)))
    }

    /// Run on an already bound socket, sending everything to `dest`. No group membership.
    #[cfg(test)]
    pub fn attach(
        config: &Config,
        identifier: Identifier,
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
    ) -> Self {
        Self::spawn(config, identifier, socket, dest, None)
    }

    fn spawn(
        config: &Config,
        identifier: Identifier,
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
        endpoint: Option<MulticastEndpoint>,
    ) -> Self {
        let core = Arc::new(ShareCore::new(identifier, config.capabilities()));
        let out = Outbound::new(socket.clone(), dest, config.maximum_message_size);
        let transfers = TransferPool::new(
            config.max_transfers,
            config.socket_timeout(),
            config.download_dir.clone(),
        );
        let finder: Arc<dyn MatchFinder> = Arc::new(TreeFinder::new(config.root_dir.clone()));
        let (queues, rx) = dispatcher::queues();
        let (events_tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        {
            let core = core.clone();
            let cancel = cancel.clone();
            let max_len = config.maximum_message_size;
            tasks.spawn(async move {
                if let Err(e) = run_receive_loop(socket, core, queues, max_len, cancel.clone()).await {
                    error!(error = %e, "receive loop failed; stopping node");
                    cancel.cancel();
                }
            });
        }
        tasks.spawn(workers::advertise_loop(
            core.clone(),
            out.clone(),
            config.port,
            config.advertisement_interval(),
            cancel.clone(),
        ));
        tasks.spawn(workers::sweep_loop(
            core.clone(),
            config.sweep_interval(),
            config.max_advertisement_age(),
            config.request_ttl(),
            cancel.clone(),
        ));
        tasks.spawn(workers::search_request_worker(
            rx.search_requests,
            core.clone(),
            finder.clone(),
            out.clone(),
            cancel.clone(),
        ));
        tasks.spawn(workers::download_request_worker(
            rx.download_requests,
            core.clone(),
            finder,
            out.clone(),
            transfers.clone(),
            cancel.clone(),
        ));
        tasks.spawn(workers::search_response_worker(
            rx.search_responses,
            events_tx.clone(),
            cancel.clone(),
        ));
        tasks.spawn(workers::download_response_worker(
            rx.download_responses,
            events_tx,
            transfers.clone(),
            cancel.clone(),
        ));

        Self {
            core,
            out,
            endpoint,
            transfers,
            cancel,
            tasks,
            events,
            drain_timeout: config.socket_timeout() * 2,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        self.core.identifier()
    }

    /// Live peers, sorted by identifier.
    pub fn peers(&self) -> Vec<PeerEntry> {
        self.core.registry().snapshot()
    }

    /// Poll the registry until `id` has advertised or `limit` passes.
    pub async fn wait_for_peer(&self, id: &Identifier, limit: Duration) -> Option<PeerEntry> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some(entry) = self.core.registry().lookup(id) {
                return Some(entry);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Ask every node for files matching `query`. Returns the request serial.
    pub async fn search(&self, query: &str) -> Result<u64, NodeError> {
        let msg = self.core.search_request(query, Instant::now());
        self.out.send(&msg).await?;
        debug!(serial = msg.header.serial, %query, "search sent");
        Ok(msg.header.serial)
    }

    /// Ask `target` for the single file matching `query`. The target must have advertised.
    pub async fn download(&self, target: &Identifier, query: &str) -> Result<u64, NodeError> {
        let msg = self.core.download_request(target, query, Instant::now())?;
        self.out.send(&msg).await?;
        debug!(serial = msg.header.serial, %target, %query, "download request sent");
        Ok(msg.header.serial)
    }

    /// Next report or transfer outcome. `None` once every worker has stopped.
    pub async fn next_event(&mut self) -> Option<NodeEvent> {
        self.events.recv().await
    }

    /// Stop the workers, let in-flight transfers finish or time out, then leave the group.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "task ended abnormally");
            }
        }
        if !self.transfers.drain(self.drain_timeout).await {
            warn!("transfers still running at shutdown");
        }
        if let Some(endpoint) = &self.endpoint {
            if let Err(e) = endpoint.leave() {
                debug!(error = %e, "leaving group");
            }
        }
        info!(id = %self.core.identifier(), "node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeshare_core::Report;

    struct Pair {
        alice: Node,
        bob: Node,
        _dirs: Vec<tempfile::TempDir>,
    }

    fn config(root: &std::path::Path, downloads: &std::path::Path) -> Config {
        Config {
            root_dir: root.to_path_buf(),
            download_dir: downloads.to_path_buf(),
            advertisement_interval_ms: 50,
            sweep_interval_ms: 50,
            socket_timeout_ms: 5_000,
            ..Config::default()
        }
    }

    /// Two nodes whose sockets point at each other stand in for a two-member group.
    async fn pair() -> Pair {
        let a_root = tempfile::tempdir().unwrap();
        let b_root = tempfile::tempdir().unwrap();
        let a_dl = tempfile::tempdir().unwrap();
        let b_dl = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(b_root.path().join("reports")).unwrap();
        std::fs::write(b_root.path().join("reports/old.txt"), b"last year").unwrap();
        std::fs::write(b_root.path().join("reports/new.txt"), b"this year").unwrap();

        let a_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let a_addr = a_sock.local_addr().unwrap();
        let b_addr = b_sock.local_addr().unwrap();
        let alice = Node::attach(
            &config(a_root.path(), a_dl.path()),
            Identifier::parse("alice@pc-a").unwrap(),
            a_sock,
            b_addr,
        );
        let bob = Node::attach(
            &config(b_root.path(), b_dl.path()),
            Identifier::parse("bob@pc-b").unwrap(),
            b_sock,
            a_addr,
        );
        Pair {
            alice,
            bob,
            _dirs: vec![a_root, b_root, a_dl, b_dl],
        }
    }

    async fn event(node: &mut Node) -> NodeEvent {
        tokio::time::timeout(Duration::from_secs(5), node.next_event())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn nodes_discover_each_other() {
        let p = pair().await;
        let bob = Identifier::parse("bob@pc-b").unwrap();
        let alice = Identifier::parse("alice@pc-a").unwrap();
        assert!(p.alice.wait_for_peer(&bob, Duration::from_secs(5)).await.is_some());
        assert!(p.bob.wait_for_peer(&alice, Duration::from_secs(5)).await.is_some());
        assert_eq!(p.alice.peers().len(), 1);
        p.alice.shutdown().await;
        p.bob.shutdown().await;
    }

    #[tokio::test]
    async fn search_then_download() {
        let mut p = pair().await;
        let bob = Identifier::parse("bob@pc-b").unwrap();
        assert!(p.alice.wait_for_peer(&bob, Duration::from_secs(5)).await.is_some());

        p.alice.search("old").await.unwrap();
        match event(&mut p.alice).await {
            NodeEvent::Report(Report::SearchHit { from, path, .. }) => {
                assert_eq!(from, bob);
                assert_eq!(path, "/reports/old.txt");
            }
            other => panic!("unexpected {:?}", other),
        }

        p.alice.download(&bob, "txt").await.unwrap();
        assert!(matches!(
            event(&mut p.alice).await,
            NodeEvent::Report(Report::DownloadAmbiguous { matches: 2, .. })
        ));

        p.alice.download(&bob, "old.txt").await.unwrap();
        assert!(matches!(
            event(&mut p.alice).await,
            NodeEvent::Report(Report::DownloadReady { .. })
        ));
        match event(&mut p.alice).await {
            NodeEvent::Fetched { from, file } => {
                assert_eq!(from, bob);
                assert!(file.path.ends_with("pc-b/old.txt"));
                assert_eq!(std::fs::read(file.path).unwrap(), b"last year");
            }
            other => panic!("unexpected {:?}", other),
        }

        p.alice.shutdown().await;
        p.bob.shutdown().await;
    }

    #[tokio::test]
    async fn download_needs_advertised_target() {
        let p = pair().await;
        let stranger = Identifier::parse("carol@pc-c").unwrap();
        assert!(matches!(
            p.alice.download(&stranger, "x").await,
            Err(NodeError::Request(RequestError::UnknownPeer(_)))
        ));
        p.alice.shutdown().await;
        p.bob.shutdown().await;
    }
}
