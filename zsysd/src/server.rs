use crate::commands;
use crate::logsink::ChannelDrain;
use crate::rpc::{Request, Response, ResultRecord};
use crate::state::AppState;
use libzsys::authz::{Authorizer, PeerCredential};
use slog::{o, Drain, Logger};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::Instant;

/// Bind the request socket: reuse a systemd-activated descriptor if one was
/// handed to us, otherwise bind fresh at `socket_path`, removing a stale
/// socket file left behind by an unclean exit.
pub fn bind(socket_path: &str) -> anyhow::Result<UnixListener> {
    if let Ok(mut descriptors) = libsystemd::activation::receive_descriptors(true) {
        if let Some(descriptor) = descriptors.pop() {
            let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(descriptor.into_raw_fd()) };
            std_listener.set_nonblocking(true)?;
            return Ok(UnixListener::from_std(std_listener)?);
        }
    }

    if std::path::Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }
    Ok(UnixListener::bind(socket_path)?)
}

/// Accept connections until idle for `idle_exit` past the first request (or
/// `startup_grace` if none ever arrives), per request fanning out to
/// [`handle_connection`].
pub async fn serve(state: Arc<AppState>, authorizer: Arc<dyn Authorizer>, listener: UnixListener) -> anyhow::Result<()> {
    let mut deadline = Instant::now() + state.config.startup_grace;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                deadline = Instant::now() + state.config.idle_exit;

                let state = Arc::clone(&state);
                let authorizer = Arc::clone(&authorizer);
                tokio::spawn(async move {
                    state.stream_opened();
                    if let Err(err) = handle_connection(&state, authorizer.as_ref(), stream).await {
                        slog_scope::warn!("connection error: {}", err);
                    }
                    state.stream_closed();
                });
            }
            _ = tokio::time::sleep_until(deadline) => {
                if state.has_open_streams() {
                    deadline = Instant::now() + state.config.idle_exit;
                    continue;
                }
                slog_scope::info!("idle timeout reached, exiting");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(state: &AppState, authorizer: &dyn Authorizer, stream: UnixStream) -> anyhow::Result<()> {
    let peer = peer_credential(&stream)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let read = tokio::time::timeout(state.config.request_timeout, reader.read_line(&mut line)).await??;
    if read == 0 {
        return Ok(());
    }
    let request: Request = serde_json::from_str(line.trim_end())?;

    let (log_tx, mut log_rx) = tokio::sync::mpsc::channel(64);
    let scoped_log = Logger::root(ChannelDrain::new(log_tx).fuse(), o!());

    let result = commands::dispatch(state, authorizer, peer, &scoped_log, request).await;
    drop(scoped_log);

    while let Ok(record) = log_rx.try_recv() {
        write_response(&mut write_half, &Response::Log(record)).await?;
    }
    write_response(&mut write_half, &Response::Result(ResultRecord::from_result(result))).await?;
    write_half.shutdown().await?;
    Ok(())
}

async fn write_response(write_half: &mut tokio::net::unix::OwnedWriteHalf, response: &Response) -> anyhow::Result<()> {
    let mut encoded = serde_json::to_vec(response)?;
    encoded.push(b'\n');
    write_half.write_all(&encoded).await?;
    Ok(())
}

fn peer_credential(stream: &UnixStream) -> anyhow::Result<PeerCredential> {
    let creds = stream.peer_cred()?;
    Ok(PeerCredential {
        uid: creds.uid(),
        pid: creds.pid().unwrap_or(0),
    })
}
