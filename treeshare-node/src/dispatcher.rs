//! Group traffic: decode every datagram, route it through the core, queue work for the
//! workers. Also the single send path back onto the group.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use treeshare_core::{
    encode_message, IncomingRequest, Message, MessageEncodeError, Report, Route, ShareCore, Upsert,
};

/// Largest UDP payload; anything over the configured budget is dropped after reading.
const RECV_BUFFER: usize = 65_536;

/// A queued item plus the address of the datagram that produced it.
#[derive(Debug, Clone)]
pub struct Received<T> {
    pub item: T,
    pub from: SocketAddr,
}

/// Producer side of the worker queues.
#[derive(Clone)]
pub struct Queues {
    pub search_requests: UnboundedSender<Received<IncomingRequest>>,
    pub download_requests: UnboundedSender<Received<IncomingRequest>>,
    pub search_responses: UnboundedSender<Received<Report>>,
    pub download_responses: UnboundedSender<Received<Report>>,
}

/// Consumer side, one receiver per worker.
pub struct QueueReceivers {
    pub search_requests: UnboundedReceiver<Received<IncomingRequest>>,
    pub download_requests: UnboundedReceiver<Received<IncomingRequest>>,
    pub search_responses: UnboundedReceiver<Received<Report>>,
    pub download_responses: UnboundedReceiver<Received<Report>>,
}

pub fn queues() -> (Queues, QueueReceivers) {
    let (sq_tx, sq_rx) = mpsc::unbounded_channel();
    let (dq_tx, dq_rx) = mpsc::unbounded_channel();
    let (sr_tx, sr_rx) = mpsc::unbounded_channel();
    let (dr_tx, dr_rx) = mpsc::unbounded_channel();
    (
        Queues {
            search_requests: sq_tx,
            download_requests: dq_tx,
            search_responses: sr_tx,
            download_responses: dr_tx,
        },
        QueueReceivers {
            search_requests: sq_rx,
            download_requests: dq_rx,
            search_responses: sr_rx,
            download_responses: dr_rx,
        },
    )
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] MessageEncodeError),
    #[error("sending to group: {0}")]
    Io(#[from] io::Error),
}

/// Encodes and sends messages to the group. Cheap to clone; sends may run concurrently.
#[derive(Clone)]
pub struct Outbound {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    max_len: usize,
}

impl Outbound {
    pub fn new(socket: Arc<UdpSocket>, dest: SocketAddr, max_len: usize) -> Self {
        Self {
            socket,
            dest,
            max_len,
        }
    }

    pub async fn send(&self, msg: &Message) -> Result<(), SendError> {
        let bytes = encode_message(msg, self.max_len)?;
        self.socket.send_to(&bytes, self.dest).await?;
        trace!(kind = %msg.kind(), serial = msg.header.serial, "sent");
        Ok(())
    }
}

/// Receive until cancelled. Malformed or oversized datagrams are logged and skipped.
pub async fn run_receive_loop(
    socket: Arc<UdpSocket>,
    core: Arc<ShareCore>,
    queues: Queues,
    max_len: usize,
    cancel: CancellationToken,
) -> io::Result<()> {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = socket.recv_from(&mut buf) => r,
        };
        match received {
            Ok((n, from)) if n > max_len => {
                debug!(%from, len = n, max = max_len, "dropping oversized datagram");
            }
            Ok((n, from)) => dispatch(&core, &queues, &buf[..n], from),
            // ICMP errors from earlier sends surface here on some platforms.
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::Interrupted
                ) =>
            {
                debug!(error = %e, "transient receive error");
            }
            Err(e) => return Err(e),
        }
    }
}

fn dispatch(core: &ShareCore, queues: &Queues, bytes: &[u8], from: SocketAddr) {
    let route = match core.on_datagram(bytes, Instant::now()) {
        Ok(route) => route,
        Err(e) => {
            debug!(%from, error = %e, "dropping malformed datagram");
            return;
        }
    };
    // Send failures only mean the worker already stopped during shutdown.
    let queued = match route {
        Route::Peer(id, Upsert::New) => {
            info!(peer = %id, %from, "peer joined");
            Ok(())
        }
        Route::Peer(id, outcome) => {
            trace!(peer = %id, ?outcome, "advertisement");
            Ok(())
        }
        Route::SearchRequest(item) => {
            debug!(from = %item.reply_to.identifier, query = %item.query, "search request");
            queues
                .search_requests
                .send(Received { item, from })
                .map_err(|_| ())
        }
        Route::DownloadRequest(item) => {
            debug!(from = %item.reply_to.identifier, query = %item.query, "download request");
            queues
                .download_requests
                .send(Received { item, from })
                .map_err(|_| ())
        }
        Route::SearchResponse(item) => queues
            .search_responses
            .send(Received { item, from })
            .map_err(|_| ()),
        Route::DownloadResponse(item) => queues
            .download_responses
            .send(Received { item, from })
            .map_err(|_| ()),
        Route::Dropped(reason) => {
            trace!(?reason, %from, "dropped");
            Ok(())
        }
    };
    if queued.is_err() {
        warn!(%from, "worker queue closed; message discarded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use treeshare_core::{Capabilities, Identifier};

    fn core(name: &str) -> Arc<ShareCore> {
        Arc::new(ShareCore::new(
            Identifier::new(name, "lab").unwrap(),
            Capabilities {
                search: true,
                download: true,
            },
        ))
    }

    async fn loopback() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn routes_requests_and_skips_garbage() {
        let node = core("bob");
        let peer = core("alice");
        let rx_sock = loopback().await;
        let tx_sock = loopback().await;
        let out = Outbound::new(tx_sock, rx_sock.local_addr().unwrap(), 500);

        let (q, mut r) = queues();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_receive_loop(
            rx_sock.clone(),
            node.clone(),
            q,
            500,
            cancel.clone(),
        ));

        out.send(&peer.advertisement(4105)).await.unwrap();
        let raw = out.socket.clone();
        raw.send_to(b"not a message", out.dest).await.unwrap();
        raw.send_to(&[b'x'; 600], out.dest).await.unwrap();
        out.send(&peer.search_request("report", Instant::now()))
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), r.search_requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.item.query, "report");
        assert_eq!(got.item.reply_to.identifier.as_str(), "alice@lab");
        assert_eq!(got.from.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert!(node
            .registry()
            .lookup(&Identifier::parse("alice@lab").unwrap())
            .is_some());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_message_is_refused_on_send() {
        let sock = loopback().await;
        let out = Outbound::new(sock.clone(), sock.local_addr().unwrap(), 60);
        let long = "q".repeat(100);
        let err = out
            .send(&core("alice").search_request(&long, Instant::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Encode(_)));
    }
}
