/**
 * This file is part of devsandbox-proxy.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::protocol::{AskFrame, AskRequest, AskResponse};

#[derive(Debug, Error)]
pub enum AskError {
    #[error("no monitor connected to the ask channel")]
    NoMonitor,

    #[error("ask request timed out")]
    Timeout,

    #[error("ask channel io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ask channel closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// bound the socket and accepts (possibly several) monitor connections.
    Server,
    /// the socket was already bound by a peer; we connected to it.
    Client,
}

type PendingMap = scc::HashMap<u64, oneshot::Sender<AskResponse>>;
type MonitorList = Arc<RwLock<Vec<mpsc::UnboundedSender<AskFrame>>>>;

/// A newline-delimited-JSON channel over a Unix domain socket connecting
/// the proxy to one or more interactive monitors (e.g. a sandbox TUI).
/// Whichever side starts first binds the socket and becomes
/// [`Role::Server`] (accepting any number of monitor connections); the
/// other connects as [`Role::Client`]. Either role may originate an
/// [`AskRequest`] and either may answer one from the peer, so the
/// negotiation only decides socket ownership, not who gets to ask.
pub struct AskChannel {
    role: Role,
    socket_path: PathBuf,
    timeout: Duration,
    pending: Arc<PendingMap>,
    monitors: MonitorList,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<(AskRequest, oneshot::Sender<AskResponse>)>>,
    incoming_tx: mpsc::UnboundedSender<(AskRequest, oneshot::Sender<AskResponse>)>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl AskChannel {
    /// Negotiate a role for `socket_path` per the component's startup
    /// algorithm: if the socket already exists, try connecting to it with
    /// a short timeout; on success we're the client. On any failure
    /// (including no socket at all) the path is unlinked if present and
    /// we bind it ourselves, becoming the server.
    pub async fn connect(socket_path: &Path, timeout: Duration) -> Result<AskChannel, AskError> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
            set_dir_mode(parent);
        }

        let connect_timeout = Duration::from_millis(500);

        if socket_path.exists() {
            match tokio::time::timeout(connect_timeout, UnixStream::connect(socket_path)).await {
                Ok(Ok(stream)) => return Ok(Self::new_client(stream, timeout)),
                _ => {
                    // stale socket file with no live listener behind it.
                    let _ = std::fs::remove_file(socket_path);
                }
            }
        }

        Self::bind_server(socket_path, timeout).await
    }

    fn new_client(stream: UnixStream, timeout: Duration) -> AskChannel {
        let channel = Self::new(Role::Client, PathBuf::new(), timeout);
        adopt_monitor(stream, channel.pending.clone(), channel.monitors.clone(), channel.incoming_tx.clone());
        channel
    }

    async fn bind_server(socket_path: &Path, timeout: Duration) -> Result<AskChannel, AskError> {
        let listener = UnixListener::bind(socket_path)?;
        set_socket_mode(socket_path);

        let channel = Self::new(Role::Server, socket_path.to_path_buf(), timeout);
        let pending = channel.pending.clone();
        let monitors = channel.monitors.clone();
        let incoming_tx = channel.incoming_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        adopt_monitor(stream, pending.clone(), monitors.clone(), incoming_tx.clone())
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(channel)
    }

    fn new(role: Role, socket_path: PathBuf, timeout: Duration) -> AskChannel {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        AskChannel {
            role,
            socket_path,
            timeout,
            pending: Arc::new(scc::HashMap::new()),
            monitors: Arc::new(RwLock::new(Vec::new())),
            incoming_rx: Mutex::new(incoming_rx),
            incoming_tx,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Wire up a freshly accepted (or dialed) stream as a monitor connection:
/// a writer queue feeding its socket half, and a reader loop decoding
/// frames until EOF/error, at which point the monitor is dropped from
/// the shared set. A free function (rather than a method) so both the
/// client-dial path and the server's acceptor loop can call it against
/// cloned `Arc` state without needing a live `&AskChannel` to hold onto.
fn adopt_monitor(
    stream: UnixStream,
    pending: Arc<PendingMap>,
    monitors: MonitorList,
    incoming_tx: mpsc::UnboundedSender<(AskRequest, oneshot::Sender<AskResponse>)>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<AskFrame>();

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&frame) else {
                continue;
            };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    monitors.write().unwrap().push(outbound_tx.clone());

    let reply_tx = outbound_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => break,
            };
            let Ok(frame) = serde_json::from_str::<AskFrame>(&line) else {
                continue;
            };
            match frame {
                AskFrame::Response(response) => {
                    if let Some((_, sender)) = pending.remove_async(&response.id).await {
                        let _ = sender.send(response);
                    }
                }
                AskFrame::Request(request) => {
                    let (tx, rx) = oneshot::channel();
                    if incoming_tx.send((request.clone(), tx)).is_err() {
                        continue;
                    }
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        if let Ok(response) = rx.await {
                            let _ = reply_tx.send(AskFrame::Response(response));
                        }
                    });
                }
            }
        }
        monitors.write().unwrap().retain(|m| !m.same_channel(&outbound_tx));
    });
}

impl AskChannel {
    /// Send a request to the peer(s) and wait up to the configured
    /// timeout for an answer. In server role the request is broadcast to
    /// every currently-connected monitor (dead sends are tolerated; dead
    /// monitors get reaped by their own reader task); the first response
    /// whose `id` matches wins. `request.id` is overwritten with the next
    /// value from this channel's monotonic per-process counter, so
    /// callers may pass any placeholder (e.g. `0`).
    pub async fn ask(&self, mut request: AskRequest) -> Result<AskResponse, AskError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(AskError::Closed);
        }
        request.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if request.timeout_secs.is_none() {
            request.timeout_secs = Some(self.timeout.as_secs());
        }

        let targets: Vec<_> = self.monitors.read().unwrap().clone();
        if targets.is_empty() {
            return Err(AskError::NoMonitor);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert_async(request.id, tx).await.ok();

        let frame = AskFrame::Request(request.clone());
        let mut any_sent = false;
        for target in &targets {
            if target.send(frame.clone()).is_ok() {
                any_sent = true;
            }
        }
        if !any_sent {
            self.pending.remove_async(&request.id).await;
            return Err(AskError::NoMonitor);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.remove_async(&request.id).await;
                Err(AskError::Closed)
            }
            Err(_) => {
                self.pending.remove_async(&request.id).await;
                Err(AskError::Timeout)
            }
        }
    }

    /// Receive the next request from a peer, paired with a one-shot
    /// sender used to answer it.
    pub async fn next_incoming(&self) -> Option<(AskRequest, oneshot::Sender<AskResponse>)> {
        self.incoming_rx.lock().await.recv().await
    }

    /// In server role: close every monitor connection, stop accepting new
    /// ones, and unlink the socket. In client role: just mark closed (the
    /// socket is owned by the peer). Either way every pending slot is
    /// dropped, which completes the corresponding `ask` calls with
    /// [`AskError::Closed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.monitors.write().unwrap().clear();
        self.pending.clear_async().await;
        if self.role == Role::Server && !self.socket_path.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) {
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) {}

#[cfg(unix)]
fn set_socket_mode(path: &Path) {
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn set_socket_mode(_path: &Path) {}

pub fn default_socket_path(sandbox_root: &Path) -> PathBuf {
    sandbox_root.join("logs").join("proxy").join(".ask").join("ask.sock")
}

pub fn default_lock_path(sandbox_root: &Path) -> PathBuf {
    sandbox_root.join("logs").join("proxy").join(".ask").join("ask.lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn server_and_client_negotiate_distinct_roles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ask.sock");

        let server = AskChannel::connect(&path, Duration::from_secs(5)).await.unwrap();
        assert_eq!(server.role(), Role::Server);

        let client = AskChannel::connect(&path, Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.role(), Role::Client);
    }

    #[tokio::test]
    async fn client_joins_a_socket_the_server_already_bound() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ask.sock");
        let _server = AskChannel::connect(&path, Duration::from_secs(5)).await.unwrap();
        // give the acceptor loop a moment to start listening.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let client = AskChannel::connect(&path, Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.role(), Role::Client);
    }

    #[tokio::test]
    async fn stale_socket_file_is_reclaimed_by_a_new_server() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ask.sock");
        {
            let _listener = UnixListener::bind(&path).unwrap();
            // dropped without anyone accepting: the path is now stale.
        }
        let server = AskChannel::connect(&path, Duration::from_secs(5)).await.unwrap();
        assert_eq!(server.role(), Role::Server);
    }

    #[tokio::test]
    async fn ask_round_trips_through_the_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ask.sock");

        let server = AskChannel::connect(&path, Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let client = AskChannel::connect(&path, Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let responder = tokio::spawn(async move {
            let (request, tx) = server.next_incoming().await.unwrap();
            tx.send(AskResponse {
                id: request.id,
                action: super::super::protocol::AskAction::Allow,
                remember: false,
                permanent: false,
            })
            .unwrap();
        });

        let request = AskRequest {
            id: 0,
            method: "GET".to_string(),
            url: "https://example.com/".to_string(),
            host: "example.com".to_string(),
            path: "/".to_string(),
            headers: None,
            body_preview: None,
            timeout_secs: None,
        };
        let response = client.ask(request).await.unwrap();
        assert!(response.allow());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn ask_fails_immediately_with_no_monitor_connected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ask.sock");
        let server = AskChannel::connect(&path, Duration::from_millis(100)).await.unwrap();

        let request = AskRequest {
            id: 0,
            method: "GET".to_string(),
            url: "https://example.com/".to_string(),
            host: "example.com".to_string(),
            path: "/".to_string(),
            headers: None,
            body_preview: None,
            timeout_secs: None,
        };
        let result = server.ask(request).await;
        assert!(matches!(result, Err(AskError::NoMonitor)));
    }

    #[tokio::test]
    async fn ask_times_out_without_a_peer_reply() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ask.sock");

        let _server = AskChannel::connect(&path, Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let client = AskChannel::connect(&path, Duration::from_millis(100)).await.unwrap();

        let request = AskRequest {
            id: 0,
            method: "GET".to_string(),
            url: "https://example.com/".to_string(),
            host: "example.com".to_string(),
            path: "/".to_string(),
            headers: None,
            body_preview: None,
            timeout_secs: None,
        };
        let result = client.ask(request).await;
        assert!(matches!(result, Err(AskError::Timeout)));
    }

    #[tokio::test]
    async fn close_wakes_every_pending_ask_call() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ask.sock");
        let server = Arc::new(AskChannel::connect(&path, Duration::from_secs(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _client = AskChannel::connect(&path, Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let server_for_ask = server.clone();
        let pending = tokio::spawn(async move {
            let request = AskRequest {
                id: 0,
                method: "GET".to_string(),
                url: "https://example.com/".to_string(),
                host: "example.com".to_string(),
                path: "/".to_string(),
                headers: None,
                body_preview: None,
                timeout_secs: None,
            };
            server_for_ask.ask(request).await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        server.close().await;

        let result = pending.await.unwrap();
        assert!(result.is_err());
    }
}
