//! Long-running node tasks. Each one owns a queue or a timer and stops when the
//! node's cancellation token fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use treeshare_core::{
    DownloadPlan, Identifier, IncomingRequest, Match, MatchFinder, Message, Report, ShareCore,
};

use crate::dispatcher::{Outbound, Received};
use crate::transfer::{Fetched, TransferError, TransferPool};

/// What the node tells its owner.
#[derive(Debug)]
pub enum NodeEvent {
    /// A reply to one of our searches or downloads.
    Report(Report),
    /// Download written to disk.
    Fetched { from: Identifier, file: Fetched },
    FetchFailed { from: Identifier, error: TransferError },
}

async fn next<T>(rx: &mut UnboundedReceiver<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

async fn send_logged(out: &Outbound, msg: &Message) {
    if let Err(e) = out.send(msg).await {
        warn!(kind = %msg.kind(), error = %e, "send failed");
    }
}

/// Filesystem walks block; keep them off the runtime threads.
async fn find(finder: Arc<dyn MatchFinder>, query: String) -> Vec<Match> {
    match tokio::task::spawn_blocking(move || finder.find_matches(&query)).await {
        Ok(found) => found,
        Err(e) => {
            warn!(error = %e, "search task failed");
            Vec::new()
        }
    }
}

/// Advertise immediately, then every `interval`.
pub async fn advertise_loop(
    core: Arc<ShareCore>,
    out: Outbound,
    server_port: u16,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticks.tick() => send_logged(&out, &core.advertisement(server_port)).await,
        }
    }
}

/// Expire silent peers and stale outstanding requests.
pub async fn sweep_loop(
    core: Arc<ShareCore>,
    interval: Duration,
    max_age: Duration,
    request_ttl: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }
        let now = std::time::Instant::now();
        for id in core.registry().sweep_expired(now, max_age) {
            info!(peer = %id, "peer expired");
        }
        let dropped = core.expire_requests(now, request_ttl);
        if dropped > 0 {
            debug!(dropped, "forgot expired requests");
        }
    }
}

pub async fn search_request_worker(
    mut rx: UnboundedReceiver<Received<IncomingRequest>>,
    core: Arc<ShareCore>,
    finder: Arc<dyn MatchFinder>,
    out: Outbound,
    cancel: CancellationToken,
) {
    while let Some(Received { item, .. }) = next(&mut rx, &cancel).await {
        let found = find(finder.clone(), item.query.clone()).await;
        debug!(query = %item.query, hits = found.len(), "answering search");
        for reply in core.answer_search(&item, &found) {
            send_logged(&out, &reply).await;
        }
    }
}

/// Exactly one match opens a transfer listener for the requester's address and answers
/// with its port; anything else is refused with the match count.
pub async fn download_request_worker(
    mut rx: UnboundedReceiver<Received<IncomingRequest>>,
    core: Arc<ShareCore>,
    finder: Arc<dyn MatchFinder>,
    out: Outbound,
    transfers: TransferPool,
    cancel: CancellationToken,
) {
    while let Some(Received { item, from }) = next(&mut rx, &cancel).await {
        let found = find(finder.clone(), item.query.clone()).await;
        let reply = match core.plan_download(item, found) {
            DownloadPlan::Refuse(msg) => msg,
            DownloadPlan::Serve { file, request } => {
                match transfers.serve(&file, from.ip()).await {
                    Ok(port) => {
                        info!(file = %file.display(), to = %request.reply_to.identifier, port, "serving download");
                        core.download_result(&request, port)
                    }
                    Err(e) => {
                        warn!(file = %file.display(), error = %e, "cannot open transfer");
                        match core.plan_download(request, Vec::new()) {
                            DownloadPlan::Refuse(msg) => msg,
                            DownloadPlan::Serve { .. } => continue,
                        }
                    }
                }
            }
        };
        send_logged(&out, &reply).await;
    }
}

pub async fn search_response_worker(
    mut rx: UnboundedReceiver<Received<Report>>,
    events: UnboundedSender<NodeEvent>,
    cancel: CancellationToken,
) {
    while let Some(Received { item, .. }) = next(&mut rx, &cancel).await {
        let _ = events.send(NodeEvent::Report(item));
    }
}

/// Where the file server for a reply from `from` listens. Keeps the IPv6 scope id:
/// link-local peers cannot be reached without it.
fn transfer_addr(from: SocketAddr, port: u16) -> SocketAddr {
    let mut addr = from;
    addr.set_port(port);
    addr
}

/// Reports every download reply; a ready one also starts the fetch from the address the
/// reply came from.
pub async fn download_response_worker(
    mut rx: UnboundedReceiver<Received<Report>>,
    events: UnboundedSender<NodeEvent>,
    transfers: TransferPool,
    cancel: CancellationToken,
) {
    while let Some(Received { item, from }) = next(&mut rx, &cancel).await {
        let ready = match &item {
            Report::DownloadReady { from: peer, port, .. } => Some((peer.clone(), *port)),
            _ => None,
        };
        let _ = events.send(NodeEvent::Report(item));
        let Some((peer, port)) = ready else { continue };
        let session = transfers.fetch(transfer_addr(from, port), peer.host().to_string());
        let events = events.clone();
        tokio::spawn(async move {
            let outcome = match session.await {
                Ok(r) => r,
                Err(e) => Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                ))),
            };
            let event = match outcome {
                Ok(file) => {
                    info!(from = %peer, path = %file.path.display(), bytes = file.bytes, "download complete");
                    NodeEvent::Fetched { from: peer, file }
                }
                Err(error) => {
                    warn!(from = %peer, error = %error, "download failed");
                    NodeEvent::FetchFailed { from: peer, error }
                }
            };
            let _ = events.send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::TreeFinder;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use treeshare_core::{decode_message, Body, Capabilities, ReplyTo};

    struct Rig {
        core: Arc<ShareCore>,
        out: Outbound,
        sink: UdpSocket,
        share: tempfile::TempDir,
        downloads: tempfile::TempDir,
    }

    async fn rig() -> Rig {
        let share = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(share.path().join("reports")).unwrap();
        std::fs::write(share.path().join("reports/old.txt"), b"old numbers").unwrap();
        std::fs::write(share.path().join("reports/new.txt"), b"new numbers").unwrap();
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Rig {
            core: Arc::new(ShareCore::new(
                Identifier::parse("bob@pc-b").unwrap(),
                Capabilities {
                    search: true,
                    download: true,
                },
            )),
            out: Outbound::new(sock, sink.local_addr().unwrap(), 500),
            sink,
            share,
            downloads: tempfile::tempdir().unwrap(),
        }
    }

    fn request(query: &str) -> Received<IncomingRequest> {
        Received {
            item: IncomingRequest {
                reply_to: ReplyTo {
                    identifier: Identifier::parse("alice@pc-a").unwrap(),
                    serial: 7,
                },
                query: query.to_string(),
            },
            from: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4105),
        }
    }

    async fn reply(sink: &UdpSocket) -> Message {
        let mut buf = [0u8; 600];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), sink.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        decode_message(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn search_worker_answers_each_match() {
        let r = rig().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let finder: Arc<dyn MatchFinder> = Arc::new(TreeFinder::new(r.share.path()));
        let task = tokio::spawn(search_request_worker(
            rx,
            r.core.clone(),
            finder,
            r.out.clone(),
            cancel.clone(),
        ));
        tx.send(request("old")).unwrap();
        let msg = reply(&r.sink).await;
        assert_eq!(
            msg.body,
            Body::SearchResult {
                reply_to: request("old").item.reply_to,
                path: "/reports/old.txt".into(),
            }
        );
        tx.send(request("missing")).unwrap();
        assert!(matches!(reply(&r.sink).await.body, Body::SearchError { .. }));
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn download_worker_serves_single_match() {
        let r = rig().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let finder: Arc<dyn MatchFinder> = Arc::new(TreeFinder::new(r.share.path()));
        let pool = TransferPool::new(4, Duration::from_secs(5), r.downloads.path().to_path_buf());
        let task = tokio::spawn(download_request_worker(
            rx,
            r.core.clone(),
            finder,
            r.out.clone(),
            pool.clone(),
            cancel.clone(),
        ));

        tx.send(request("txt")).unwrap();
        match reply(&r.sink).await.body {
            Body::DownloadError { match_count, .. } => assert_eq!(match_count, 2),
            other => panic!("unexpected {:?}", other),
        }

        tx.send(request("old.txt")).unwrap();
        let port = match reply(&r.sink).await.body {
            Body::DownloadResult { port, query, .. } => {
                assert_eq!(query, "old.txt");
                port
            }
            other => panic!("unexpected {:?}", other),
        };
        let got = crate::transfer::fetch_file(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            "pc-b",
            r.downloads.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(got.path, r.downloads.path().join("pc-b/old.txt"));
        assert_eq!(std::fs::read(got.path).unwrap(), b"old numbers");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn download_reply_starts_fetch() {
        let r = rig().await;
        let pool = TransferPool::new(4, Duration::from_secs(5), r.downloads.path().to_path_buf());
        let port = pool
            .serve(
                &r.share.path().join("reports/new.txt"),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
            )
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(download_response_worker(rx, ev_tx, pool, cancel.clone()));
        let bob = Identifier::parse("bob@pc-b").unwrap();
        tx.send(Received {
            item: Report::DownloadReady {
                from: bob.clone(),
                query: "new.txt".into(),
                port,
            },
            from: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4105),
        })
        .unwrap();

        assert!(matches!(
            ev_rx.recv().await,
            Some(NodeEvent::Report(Report::DownloadReady { .. }))
        ));
        match tokio::time::timeout(Duration::from_secs(5), ev_rx.recv())
            .await
            .unwrap()
        {
            Some(NodeEvent::Fetched { from, file }) => {
                assert_eq!(from, bob);
                assert_eq!(file.path, r.downloads.path().join("pc-b/new.txt"));
                assert_eq!(std::fs::read(file.path).unwrap(), b"new numbers");
            }
            other => panic!("unexpected {:?}", other),
        }
        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn transfer_addr_keeps_link_local_scope() {
        let link_local: std::net::Ipv6Addr = "fe80::1".parse().unwrap();
        let from = SocketAddr::V6(std::net::SocketAddrV6::new(link_local, 4105, 0, 3));
        match transfer_addr(from, 40000) {
            SocketAddr::V6(v6) => {
                assert_eq!(v6.scope_id(), 3);
                assert_eq!(v6.port(), 40000);
                assert_eq!(*v6.ip(), link_local);
            }
            other => panic!("unexpected {:?}", other),
        }
        let v4: SocketAddr = "192.168.1.7:4105".parse().unwrap();
        assert_eq!(transfer_addr(v4, 5), "192.168.1.7:5".parse().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_forgets_silent_peers() {
        let core = Arc::new(ShareCore::new(
            Identifier::parse("bob@pc-b").unwrap(),
            Capabilities::default(),
        ));
        let alice = ShareCore::new(
            Identifier::parse("alice@pc-a").unwrap(),
            Capabilities::default(),
        );
        core.on_message(alice.advertisement(4105), std::time::Instant::now());
        assert_eq!(core.registry().len(), 1);
        // Registry ages use std Instants, which pausing the tokio clock does not stop.
        std::thread::sleep(Duration::from_millis(30));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sweep_loop(
            core.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(30),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(core.registry().is_empty());
        cancel.cancel();
        task.await.unwrap();
    }
}
