//! TCP acceptor and per-session reader loops.
//!
//! Each accepted connection gets a session id, a statistics registration,
//! and its own reader task. Reads land in pooled buffers and are enqueued as
//! frames into the pipeline intake; the enqueue await is where channel
//! back-pressure stalls the session.
//!
//! The session's device id is latched from the first frame's `$` talker+type
//! tag (a known limitation carried from the source contract: the tag is not
//! a real device identity), falling back to the session id's string form.
//! Accepts are refused with an immediate close once the active-session count
//! reaches the configured maximum.

use crate::buffer_pool::BufferPool;
use crate::config::TelemetryServerConfig;
use crate::error::{GatewayError, Result};
use crate::frame::{infer_device_tag, FrameSource, RawFrame, SessionId};
use crate::pipeline::PipelineIntake;
use crate::sessions::SessionTracker;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs the TCP acceptor until cancelled.
pub async fn run(
    config: TelemetryServerConfig,
    intake: PipelineIntake,
    tracker: Arc<SessionTracker>,
    pool: Arc<BufferPool>,
    token: CancellationToken,
) -> Result<()> {
    let address = format!("0.0.0.0:{}", config.tcp_port);
    let listener = bind_listener(&address)?;
    info!("TCP server listening on {}", address);

    let mut join_set = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("TCP acceptor shutting down");
                break;
            }
            accept_res = listener.accept() => {
                match accept_res {
                    Ok((stream, peer)) => {
                        if tracker.active_sessions() >= config.max_connections {
                            // Immediate close, no banner
                            warn!(
                                %peer,
                                limit = config.max_connections,
                                "Connection refused: session limit reached"
                            );
                            drop(stream);
                            continue;
                        }

                        if let Err(e) = tune_socket(&stream) {
                            debug!(%peer, "Socket tuning failed: {}", e);
                        }

                        let session_id = tracker.allocate();
                        tracker.register(session_id, peer);
                        info!(%session_id, %peer, "Accepted TCP connection");

                        let intake = intake.clone();
                        let tracker = tracker.clone();
                        let pool = pool.clone();
                        let session_token = token.clone();
                        join_set.spawn(async move {
                            session_loop(
                                stream,
                                session_id,
                                peer,
                                intake,
                                tracker,
                                pool,
                                session_token,
                            )
                            .await;
                        });
                    }
                    Err(e) => error!("TCP accept error: {}", e),
                }
            }
            _ = join_set.join_next(), if !join_set.is_empty() => {}
        }
    }

    // Session readers observe the same token; wait for them to finish
    // draining their pending buffers into the pipeline
    while join_set.join_next().await.is_some() {}
    Ok(())
}

fn bind_listener(address: &str) -> Result<TcpListener> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid TCP address {}: {}", address, e)))?;

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| GatewayError::network(address, e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| GatewayError::network(address, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| GatewayError::network(address, e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| GatewayError::network(address, e))?;
    socket
        .listen(1024)
        .map_err(|e| GatewayError::network(address, e))?;

    TcpListener::from_std(socket.into()).map_err(|e| GatewayError::network(address, e))
}

fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(60)))?;
    Ok(())
}

async fn session_loop(
    mut stream: TcpStream,
    session_id: SessionId,
    peer: SocketAddr,
    intake: PipelineIntake,
    tracker: Arc<SessionTracker>,
    pool: Arc<BufferPool>,
    token: CancellationToken,
) {
    let mut device_id: Option<String> = None;

    loop {
        let mut buf = pool.rent();

        tokio::select! {
            _ = token.cancelled() => break,
            read_res = stream.read_buf(&mut *buf) => {
                match read_res {
                    Ok(0) => {
                        debug!(%session_id, "Session EOF");
                        break;
                    }
                    Ok(_) => {
                        let id = match &device_id {
                            Some(id) => id.clone(),
                            None => {
                                let inferred = infer_device_tag(buf.as_slice())
                                    .unwrap_or_else(|| session_id.to_string());
                                tracker.latch_device_id(session_id, &inferred);
                                debug!(%session_id, device_id = %inferred, "Device id latched");
                                device_id = Some(inferred.clone());
                                inferred
                            }
                        };

                        let frame =
                            RawFrame::new(buf, FrameSource::Tcp { session_id, peer }, id);
                        // Back-pressure point: blocks while the shard is full
                        if intake.submit(frame).await.is_err() {
                            warn!(%session_id, "Pipeline intake closed; ending session");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%session_id, "Session read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    tracker.unregister(session_id);
    debug!(%session_id, %peer, "Session closed");
}
