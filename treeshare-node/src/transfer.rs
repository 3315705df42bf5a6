//! One-shot TCP file transfer: the server side listens for exactly one connection from the
//! requester and streams one file; the client side writes it under the download directory.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use treeshare_core::{FileHeader, HeaderError, TRANSFER_CHUNK_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("timed out after {0:?} while {1}")]
    Timeout(Duration, &'static str),
    #[error("bad transfer header: {0}")]
    Header(#[from] HeaderError),
    #[error("connection closed after {received} of {expected} bytes; partial file left at {}", path.display())]
    ShortRead {
        path: PathBuf,
        expected: u64,
        received: u64,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A file fully written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub path: PathBuf,
    pub bytes: u64,
}

async fn timed<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, TransferError> {
    Ok(timeout(limit, fut)
        .await
        .map_err(|_| TransferError::Timeout(limit, what))??)
}

/// Server half: a bound listener waiting for the one requester it was opened for.
pub struct FileServer {
    listener: TcpListener,
    file: File,
    header: FileHeader,
    requester: IpAddr,
    timeout: Duration,
}

impl FileServer {
    /// Open `path` and bind an ephemeral port of the requester's address family.
    pub async fn bind(path: &Path, requester: IpAddr, timeout: Duration) -> Result<Self, TransferError> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = FileHeader::new(name, size)?;
        let any: IpAddr = match requester.to_canonical() {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let listener = TcpListener::bind(SocketAddr::new(any, 0)).await?;
        Ok(Self {
            listener,
            file,
            header,
            requester: requester.to_canonical(),
            timeout,
        })
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept until the requester connects or the accept deadline passes, then send the file.
    /// Connections from any other host are closed unanswered.
    pub async fn run(self) -> Result<u64, TransferError> {
        let deadline = Instant::now() + self.timeout;
        let stream = loop {
            let (stream, peer) = timeout_at(deadline, self.listener.accept())
                .await
                .map_err(|_| TransferError::Timeout(self.timeout, "waiting for the requester"))??;
            if peer.ip().to_canonical() == self.requester {
                break stream;
            }
            warn!(%peer, expected = %self.requester, "rejecting transfer connection from unexpected host");
        };
        send_file(stream, self.file, &self.header, self.timeout).await
    }
}

async fn send_file(
    mut stream: TcpStream,
    file: File,
    header: &FileHeader,
    limit: Duration,
) -> Result<u64, TransferError> {
    timed(limit, "sending header", stream.write_all(&header.encode())).await?;
    let mut body = file.take(header.size);
    let mut buf = [0u8; TRANSFER_CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        timed(limit, "sending file", stream.write_all(&buf[..n])).await?;
        sent += n as u64;
    }
    timed(limit, "flushing", stream.flush()).await?;
    let _ = stream.shutdown().await;
    if sent < header.size {
        // File shrank underneath us; the client will report the short read.
        warn!(name = %header.name, sent, size = header.size, "file shorter than advertised");
    }
    Ok(sent)
}

/// Client half: connect to `server`, read the header and stream the file to
/// `<download_dir>/<server_host>/<name>`. A short read leaves the partial file in place.
pub async fn fetch_file(
    server: SocketAddr,
    server_host: &str,
    download_dir: &Path,
    limit: Duration,
) -> Result<Fetched, TransferError> {
    let mut stream = timed(limit, "connecting", TcpStream::connect(server)).await?;

    let mut head = vec![0u8; 2];
    timed(limit, "reading header", stream.read_exact(&mut head)).await?;
    let name_len = u16::from_be_bytes([head[0], head[1]]) as usize;
    head.resize(2 + name_len + 8, 0);
    timed(limit, "reading header", stream.read_exact(&mut head[2..])).await?;
    let (header, _) = FileHeader::decode(&head)?;

    let path = header.destination(download_dir, server_host)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = File::create(&path).await?;
    let mut buf = [0u8; TRANSFER_CHUNK_SIZE];
    let mut received = 0u64;
    while received < header.size {
        let want = (header.size - received).min(buf.len() as u64) as usize;
        let n = timed(limit, "reading file", stream.read(&mut buf[..want])).await?;
        if n == 0 {
            out.flush().await?;
            return Err(TransferError::ShortRead {
                path,
                expected: header.size,
                received,
            });
        }
        out.write_all(&buf[..n]).await?;
        received += n as u64;
    }
    out.flush().await?;
    Ok(Fetched {
        path,
        bytes: received,
    })
}

/// Bounds concurrent transfer sessions, `max` served and `max` fetched. The two sides
/// have separate slots so that two nodes downloading from each other at capacity cannot
/// wait on one another. Clones share the same limits.
#[derive(Clone)]
pub struct TransferPool {
    serving: Arc<Semaphore>,
    fetching: Arc<Semaphore>,
    max: usize,
    timeout: Duration,
    download_dir: PathBuf,
}

async fn slot(permits: &Arc<Semaphore>) -> io::Result<OwnedSemaphorePermit> {
    permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "transfer pool closed"))
}

impl TransferPool {
    pub fn new(max: usize, timeout: Duration, download_dir: PathBuf) -> Self {
        let max = max.max(1);
        Self {
            serving: Arc::new(Semaphore::new(max)),
            fetching: Arc::new(Semaphore::new(max)),
            max,
            timeout,
            download_dir,
        }
    }

    /// Open a listener serving `file` to `requester` and return its port. The session
    /// runs detached and holds a serving slot until it completes or times out.
    pub async fn serve(&self, file: &Path, requester: IpAddr) -> Result<u16, TransferError> {
        let permit = slot(&self.serving).await?;
        let server = FileServer::bind(file, requester, self.timeout).await?;
        let port = server.port()?;
        let name = server.header.name.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match server.run().await {
                Ok(bytes) => info!(%name, bytes, %requester, "file sent"),
                Err(e) => warn!(%name, %requester, error = %e, "transfer not completed"),
            }
        });
        debug!(port, "transfer listener open");
        Ok(port)
    }

    /// Download from `server` in a detached session holding a fetching slot. Waiting for
    /// the slot counts against the socket timeout; the server stops accepting after it.
    pub fn fetch(
        &self,
        server: SocketAddr,
        server_host: String,
    ) -> tokio::task::JoinHandle<Result<Fetched, TransferError>> {
        tokio::spawn(fetch_pooled(self.clone(), server, server_host))
    }

    /// Wait for in-flight sessions on both sides to finish, up to `limit`. Returns false
    /// on timeout.
    pub async fn drain(&self, limit: Duration) -> bool {
        let all = self.max.min(u32::MAX as usize) as u32;
        let both = async {
            let served = self.serving.acquire_many(all).await;
            let fetched = self.fetching.acquire_many(all).await;
            served.is_ok() && fetched.is_ok()
        };
        matches!(timeout(limit, both).await, Ok(true))
    }
}

async fn fetch_pooled(
    pool: TransferPool,
    server: SocketAddr,
    server_host: String,
) -> Result<Fetched, TransferError> {
    let _permit = timed(pool.timeout, "waiting for a transfer slot", slot(&pool.fetching)).await?;
    fetch_file(server, &server_host, &pool.download_dir, pool.timeout).await
}
