use super::{ClientFrame, ServerFrame, MAX_FRAME_BYTES};
use crate::{
    background::Background,
    config::ConfigStore,
    errors::IntercomError,
    paths::IntercomPaths,
    storage::{FileStore, KvStore, Storage},
};
use eyre::Context as _;
use fs2::FileExt as _;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader},
    sync::Mutex,
    task::JoinSet,
};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::{UnixListener as Listener, UnixStream as Stream};

#[cfg(not(unix))]
use tokio::net::{TcpListener as Listener, TcpStream as Stream};

/// Loopback endpoint used where Unix sockets are unavailable.
#[cfg(not(unix))]
pub const DAEMON_TCP_ADDR: &str = "127.0.0.1:41778";

struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn write_frame<W>(out: &Mutex<W>, frame: &ServerFrame) -> eyre::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut line = serde_json::to_vec(frame).context("encode frame")?;
    line.push(b'\n');
    let mut w = out.lock().await;
    w.write_all(&line).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(unix)]
fn bind_listener(paths: &IntercomPaths) -> eyre::Result<Listener> {
    let p = paths.socket_path();
    if p.exists() {
        let md = std::fs::symlink_metadata(&p).context("stat existing socket path")?;
        if md.file_type().is_symlink() {
            eyre::bail!("refusing to remove symlink at {}", p.display());
        }
        std::fs::remove_file(&p)
            .with_context(|| format!("remove stale socket at {}", p.display()))?;
    }
    let l = Listener::bind(&p).with_context(|| format!("bind unix socket at {}", p.display()))?;

    use std::os::unix::fs::PermissionsExt as _;
    if let Err(e) = std::fs::set_permissions(
        &p,
        std::fs::Permissions::from_mode(crate::fsutil::MODE_FILE_PRIVATE),
    ) {
        warn!(error = %e, "failed to set unix socket permissions");
    }
    Ok(l)
}

#[cfg(not(unix))]
fn bind_listener(_paths: &IntercomPaths) -> eyre::Result<Listener> {
    let std_listener =
        std::net::TcpListener::bind(DAEMON_TCP_ADDR).context("bind tcp listener (loopback)")?;
    std_listener.set_nonblocking(true)?;
    Listener::from_std(std_listener).context("register tcp listener")
}

/// Serve one client until it disconnects.
///
/// The first frame must carry the daemon's auth token. Each request is queued on the
/// background as soon as its frame is read, so one connection's requests keep their order;
/// replies are written back as they complete.
pub async fn serve_connection<St, S>(
    stream: St,
    background: Background<S>,
    active: Arc<AtomicUsize>,
    auth_token: Arc<str>,
) -> eyre::Result<()>
where
    St: AsyncRead + AsyncWrite + Send + 'static,
    S: KvStore,
{
    active.fetch_add(1, Ordering::SeqCst);
    let _guard = ActiveGuard {
        active: Arc::clone(&active),
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();
    let mut authed = false;
    let mut inflight = JoinSet::new();

    while let Some(line) = lines.next_line().await? {
        if line.len() > MAX_FRAME_BYTES {
            warn!(bytes = line.len(), "oversized frame; closing connection");
            break;
        }
        let frame: ClientFrame = match serde_json::from_str(&line) {
            Ok(f) => f,
            Err(e) => {
                let id = serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_u64));
                let Some(id) = id else {
                    warn!(error = %e, "unparseable frame from client; closing connection");
                    break;
                };
                warn!(id, error = %e, "malformed frame from client");
                let reply =
                    ServerFrame::err(id, &IntercomError::InvalidRequest(e.to_string()).into());
                if let Err(we) = write_frame(&writer, &reply).await {
                    warn!(error = %we, "failed to write error reply");
                    break;
                }
                if !authed {
                    break;
                }
                continue;
            }
        };

        if !authed {
            if frame.auth.as_deref() != Some(auth_token.as_ref()) {
                let denied = ServerFrame::err(frame.id, &IntercomError::Unauthorized.into());
                if let Err(e) = write_frame(&writer, &denied).await {
                    warn!(error = %e, "failed to write unauthorized response");
                }
                break;
            }
            authed = true;
        }

        let id = frame.id;
        let reply = background.dispatch(frame.request);
        let writer2 = Arc::clone(&writer);
        inflight.spawn(async move {
            let out = match reply.await {
                Ok(v) => ServerFrame::ok(id, v),
                Err(e) => {
                    debug!(id, error = %format!("{e:#}"), "request failed");
                    ServerFrame::err(id, &e)
                }
            };
            if let Err(e) = write_frame(&writer2, &out).await {
                warn!(error = %e, "failed to write reply");
            }
        });
        while inflight.try_join_next().is_some() {}
    }

    while inflight.join_next().await.is_some() {}
    Ok(())
}

async fn accept(listener: &Listener, tick: Option<Duration>) -> eyre::Result<Option<Stream>> {
    let fut = async {
        let (stream, _addr) = listener.accept().await?;
        Ok::<_, eyre::Report>(stream)
    };
    match tick {
        Some(t) => match tokio::time::timeout(t, fut).await {
            Ok(res) => res.map(Some),
            Err(_elapsed) => Ok(None),
        },
        None => fut.await.map(Some),
    }
}

pub async fn run_daemon(idle_exit_seconds: Option<u64>) -> eyre::Result<()> {
    let paths = IntercomPaths::discover()?;
    paths.ensure_private_dirs()?;
    let auth: Arc<str> = Arc::from(paths.ensure_auth_token()?);

    // Single-instance lock: only one daemon may own the storage file and session.
    let lock_path = paths.daemon_lock_path();
    let lock_file = crate::fsutil::open_lock_file(&lock_path)?;
    lock_file
        .try_lock_exclusive()
        .with_context(|| format!("lock already held at {}", lock_path.display()))?;
    let _lock_file = lock_file;

    let cfg = ConfigStore::new(&paths).load_or_init_default()?;
    let store = FileStore::open(&paths.storage_file())?;
    let background = Background::open(Storage::new(store), &cfg).await?;
    let active = Arc::new(AtomicUsize::new(0));
    let listener = bind_listener(&paths)?;
    info!(idle_exit_seconds, "daemon listening");

    let idle = idle_exit_seconds.map(Duration::from_secs);
    let tick = idle.map(|_| Duration::from_millis(250));
    let mut last_busy = Instant::now();

    loop {
        if active.load(Ordering::SeqCst) == 0 {
            if let Some(idle_dur) = idle {
                if last_busy.elapsed() >= idle_dur {
                    info!("idle timeout reached; exiting");
                    break;
                }
            }
        } else {
            last_busy = Instant::now();
        }

        let accepted = tokio::select! {
            res = accept(&listener, tick) => res?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; exiting");
                break;
            }
        };
        let Some(stream) = accepted else {
            continue;
        };
        last_busy = Instant::now();

        let bg = background.clone();
        let active2 = Arc::clone(&active);
        let auth2 = Arc::clone(&auth);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, bg, active2, auth2).await {
                warn!(error = %e, "connection handler failed");
            }
        });
    }

    #[cfg(unix)]
    drop(std::fs::remove_file(paths.socket_path()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{IntercomConfig, KdfConfig},
        intercom::{client::IntercomClient, transport::SocketTransport, WalletStatus},
        storage::MemoryStore,
    };
    use eyre::ContextCompat as _;
    use serde_json::json;

    async fn background() -> eyre::Result<Background<MemoryStore>> {
        let cfg = IntercomConfig {
            kdf: KdfConfig {
                memory_kib: 64,
                iterations: 1,
            },
            ..IntercomConfig::default()
        };
        Background::open(Storage::new(MemoryStore::default()), &cfg).await
    }

    #[tokio::test]
    async fn client_and_server_round_trip_over_a_stream() -> eyre::Result<()> {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let active = Arc::new(AtomicUsize::new(0));
        let server = tokio::spawn(serve_connection(
            server_end,
            background().await?,
            Arc::clone(&active),
            Arc::from("secret"),
        ));

        let client = IntercomClient::new(SocketTransport::new(client_end, "secret".into()));
        assert_eq!(client.state().await?.status, WalletStatus::Idle);

        let shown = client.new_wallet("pw".into(), None).await?;
        assert!(shown.is_some());
        let account = client.create_account(Some("Second".into())).await?;
        assert_eq!(account.index, 1);

        client.lock().await?;
        let err = client
            .sign(account.address.clone(), "00".into())
            .await
            .err()
            .context("locked signing must fail")?;
        assert_eq!(
            err.downcast_ref::<IntercomError>(),
            Some(&IntercomError::Locked),
            "got: {err:#}"
        );

        let wrong = client
            .unlock("not-pw".into())
            .await
            .err()
            .context("wrong password must fail")?;
        assert_eq!(
            wrong.downcast_ref::<IntercomError>(),
            Some(&IntercomError::InvalidPassword)
        );

        client.unlock("pw".into()).await?;
        let sig = client.sign(account.address, "00".into()).await?;
        assert_eq!(sig.len(), 128);

        drop(client);
        server.await??;
        assert_eq!(active.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_token_is_refused_and_connection_closed() -> eyre::Result<()> {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve_connection(
            server_end,
            background().await?,
            Arc::new(AtomicUsize::new(0)),
            Arc::from("secret"),
        ));

        let (r, mut w) = tokio::io::split(client_end);
        let hello = ClientFrame {
            id: 1,
            auth: Some("guess".into()),
            request: json!({"type": "GetStateRequest"}),
        };
        w.write_all(format!("{}\n", serde_json::to_string(&hello)?).as_bytes())
            .await?;
        w.flush().await?;

        let mut lines = BufReader::new(r).lines();
        let line = lines.next_line().await?.context("reply")?;
        let reply: ServerFrame = serde_json::from_str(&line)?;
        assert_eq!(reply.error.map(|e| e.code), Some("unauthorized".to_owned()));
        assert!(lines.next_line().await?.is_none());
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_frames_get_an_error_or_a_closed_connection() -> eyre::Result<()> {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve_connection(
            server_end,
            background().await?,
            Arc::new(AtomicUsize::new(0)),
            Arc::from("secret"),
        ));

        let (r, mut w) = tokio::io::split(client_end);
        let mut lines = BufReader::new(r).lines();
        let hello = ClientFrame {
            id: 1,
            auth: Some("secret".into()),
            request: json!({"type": "GetStateRequest"}),
        };
        w.write_all(format!("{}\n", serde_json::to_string(&hello)?).as_bytes())
            .await?;
        w.flush().await?;
        let first: ServerFrame =
            serde_json::from_str(&lines.next_line().await?.context("reply")?)?;
        assert!(first.error.is_none());

        // Readable id, no request body.
        w.write_all(b"{\"id\": 7}\n").await?;
        w.flush().await?;
        let reply: ServerFrame =
            serde_json::from_str(&lines.next_line().await?.context("reply")?)?;
        assert_eq!(reply.id, 7);
        assert_eq!(
            reply.error.map(|e| e.code),
            Some("invalid_request".to_owned())
        );

        w.write_all(b"not json at all\n").await?;
        w.flush().await?;
        assert!(lines.next_line().await?.is_none());
        server.await??;
        Ok(())
    }
}
