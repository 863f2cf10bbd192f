use super::{client::Transport, ClientFrame, ServerFrame, MAX_FRAME_BYTES};
use crate::{config::IntercomConfig, errors::IntercomError, paths::IntercomPaths};
use eyre::Context as _;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, warn};

type Reply = eyre::Result<Value>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

fn lock_pending(p: &Mutex<Pending>) -> std::sync::MutexGuard<'_, Pending> {
    p.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frame-multiplexing client over any byte stream (Unix socket in practice).
///
/// Requests may be in flight concurrently; replies are matched back by frame id. When the
/// stream closes, every outstanding request fails with [`IntercomError::ConnectionClosed`].
pub struct SocketTransport {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    auth: String,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl SocketTransport {
    pub fn new<S>(stream: S, auth: String) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = tokio::spawn(read_replies(r, Arc::clone(&pending)));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(w)),
            pending,
            next_id: AtomicU64::new(1),
            auth,
            reader,
        }
    }

    async fn write_frame(&self, frame: &ClientFrame) -> eyre::Result<()> {
        let mut line = serde_json::to_vec(frame).context("encode frame")?;
        line.push(b'\n');
        let mut w = self.writer.lock().await;
        w.write_all(&line).await?;
        w.flush().await?;
        Ok(())
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Transport for SocketTransport {
    async fn send(&self, payload: Value) -> eyre::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut p = lock_pending(&self.pending);
            if p.closed {
                return Err(IntercomError::ConnectionClosed.into());
            }
            p.waiters.insert(id, tx);
        }

        let frame = ClientFrame {
            id,
            auth: Some(self.auth.clone()),
            request: payload,
        };
        if let Err(e) = self.write_frame(&frame).await {
            lock_pending(&self.pending).waiters.remove(&id);
            return Err(e.wrap_err("send request to background"));
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_closed) => Err(IntercomError::ConnectionClosed.into()),
        }
    }
}

fn spawn_daemon(idle_exit_seconds: u64) -> eyre::Result<()> {
    let exe = std::env::current_exe().context("resolve current exe")?;
    // Detached; the daemon's idle exit reaps it once no client is connected.
    let _child = std::process::Command::new(exe)
        .arg("daemon")
        .arg("--idle-exit-seconds")
        .arg(idle_exit_seconds.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("spawn intercom daemon")?;
    Ok(())
}

async fn try_connect(paths: &IntercomPaths) -> eyre::Result<SocketTransport> {
    let auth = paths.ensure_auth_token()?;
    #[cfg(unix)]
    {
        let p = paths.socket_path();
        let s = tokio::net::UnixStream::connect(&p)
            .await
            .with_context(|| format!("connect unix socket at {}", p.display()))?;
        Ok(SocketTransport::new(s, auth))
    }
    #[cfg(not(unix))]
    {
        let s = tokio::net::TcpStream::connect(super::server::DAEMON_TCP_ADDR)
            .await
            .context("connect tcp daemon")?;
        Ok(SocketTransport::new(s, auth))
    }
}

/// Connect to the running daemon, starting one in the background if none answers.
pub async fn connect(paths: &IntercomPaths, cfg: &IntercomConfig) -> eyre::Result<SocketTransport> {
    if let Ok(t) = try_connect(paths).await {
        return Ok(t);
    }
    spawn_daemon(cfg.daemon.spawn_idle_exit_seconds)?;
    let mut last = None;
    for _ in 0_i32..50_i32 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        match try_connect(paths).await {
            Ok(t) => return Ok(t),
            Err(e) => last = Some(e),
        }
    }
    let err = last.unwrap_or_else(|| eyre::eyre!("daemon never came up"));
    Err(err.wrap_err("connect to intercom daemon"))
}

fn reply_from_frame(frame: ServerFrame) -> Reply {
    match (frame.response, frame.error) {
        (_, Some(err)) => Err(IntercomError::from_wire(&err.code, err.message, err.detail).into()),
        (Some(v), None) => Ok(v),
        (None, None) => Err(IntercomError::InvalidResponse(
            "frame carries neither response nor error".into(),
        )
        .into()),
    }
}

async fn read_replies<R>(r: R, pending: Arc<Mutex<Pending>>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(r).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "read from background failed");
                break;
            }
        };
        if line.len() > MAX_FRAME_BYTES {
            warn!(bytes = line.len(), "oversized frame from background");
            break;
        }
        let frame: ServerFrame = match serde_json::from_str(&line) {
            Ok(f) => f,
            Err(e) => {
                // Without an id there is no telling which request this answered.
                warn!(error = %e, "unparseable frame from background; dropping connection");
                let mut p = lock_pending(&pending);
                p.closed = true;
                for (_, waiter) in p.waiters.drain() {
                    drop(waiter.send(Err(IntercomError::InvalidResponse(format!(
                        "unparseable frame: {e}"
                    ))
                    .into())));
                }
                return;
            }
        };
        let id = frame.id;
        let Some(waiter) = lock_pending(&pending).waiters.remove(&id) else {
            debug!(id, "reply for unknown request id");
            continue;
        };
        drop(waiter.send(reply_from_frame(frame)));
    }

    // Dropping the senders fails every outstanding request.
    let mut p = lock_pending(&pending);
    p.closed = true;
    p.waiters.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::ContextCompat as _;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn replies_are_matched_by_id_even_out_of_order() -> eyre::Result<()> {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let transport = Arc::new(SocketTransport::new(client_end, "tok".into()));

        let t1 = Arc::clone(&transport);
        let first = tokio::spawn(async move { t1.send(json!({"n": 1})).await });
        let t2 = Arc::clone(&transport);
        let second = tokio::spawn(async move { t2.send(json!({"n": 2})).await });

        let (r, mut w) = tokio::io::split(server_end);
        let mut lines = BufReader::new(r).lines();
        let mut frames = Vec::new();
        for _ in 0_u8..2 {
            let line = lines.next_line().await?.context("frame")?;
            frames.push(serde_json::from_str::<ClientFrame>(&line)?);
        }
        // Answer in reverse order, echoing the payload.
        for f in frames.iter().rev() {
            assert_eq!(f.auth.as_deref(), Some("tok"));
            let reply = ServerFrame::ok(f.id, f.request.clone());
            w.write_all(format!("{}\n", serde_json::to_string(&reply)?).as_bytes())
                .await?;
        }
        w.flush().await?;

        assert_eq!(first.await??, json!({"n": 1}));
        assert_eq!(second.await??, json!({"n": 2}));
        Ok(())
    }

    #[tokio::test]
    async fn closed_stream_fails_pending_and_later_requests() -> eyre::Result<()> {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let transport = Arc::new(SocketTransport::new(client_end, "tok".into()));

        let t1 = Arc::clone(&transport);
        let inflight = tokio::spawn(async move { t1.send(json!({})).await });

        let (r, w) = tokio::io::split(server_end);
        let mut lines = BufReader::new(r).lines();
        lines.next_line().await?.context("frame")?;
        drop(lines);
        drop(w);

        let err = inflight.await?.err().context("must fail")?;
        assert_eq!(
            err.downcast_ref::<IntercomError>(),
            Some(&IntercomError::ConnectionClosed)
        );
        let later = transport.send(json!({})).await.err().context("must fail")?;
        assert_eq!(
            later.downcast_ref::<IntercomError>(),
            Some(&IntercomError::ConnectionClosed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn reply_without_id_fails_pending_requests() -> eyre::Result<()> {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let transport = Arc::new(SocketTransport::new(client_end, "tok".into()));

        let t1 = Arc::clone(&transport);
        let inflight = tokio::spawn(async move { t1.send(json!({"type": "LockRequest"})).await });

        let (r, mut w) = tokio::io::split(server_end);
        let mut lines = BufReader::new(r).lines();
        lines.next_line().await?.context("frame")?;
        w.write_all(b"{\"response\":{\"type\":\"LockResponse\"}}\n")
            .await?;
        w.flush().await?;

        let err = tokio::time::timeout(std::time::Duration::from_secs(2), inflight)
            .await??
            .err()
            .context("must fail")?;
        assert!(matches!(
            err.downcast_ref::<IntercomError>(),
            Some(IntercomError::InvalidResponse(_))
        ));
        let later = transport.send(json!({})).await.err().context("must fail")?;
        assert_eq!(
            later.downcast_ref::<IntercomError>(),
            Some(&IntercomError::ConnectionClosed)
        );
        Ok(())
    }

    fn error_frame(code: &str, message: &str) -> ServerFrame {
        ServerFrame {
            id: 1,
            response: None,
            error: Some(super::super::FrameError {
                code: code.into(),
                message: message.into(),
                detail: None,
            }),
        }
    }

    #[test]
    fn error_frame_keeps_its_structured_kind() {
        let err = reply_from_frame(error_frame("invalid_password", "invalid password")).err();
        assert_eq!(
            err.as_ref().and_then(|e| e.downcast_ref::<IntercomError>()),
            Some(&IntercomError::InvalidPassword)
        );
    }

    #[test]
    fn unknown_error_code_becomes_background_error() {
        let err = reply_from_frame(error_frame("internal_error", "encode response")).err();
        assert_eq!(
            err.as_ref().and_then(|e| e.downcast_ref::<IntercomError>()),
            Some(&IntercomError::Background("encode response".into()))
        );
    }
}
