//! Stateless UDP datagram receiver.
//!
//! A single loop reads datagrams into pooled buffers and enqueues frames.
//! With no session to latch onto, the device id is synthesized as
//! `<talker+type>_<peer-address>` with colons replaced by underscores for
//! topic-key safety (`UNKNOWN` when no tag can be inferred). A NAT rebind
//! therefore mints a new device id; the synthetic id is the only affinity
//! mechanism. UDP gives no ordering guarantee.

use crate::buffer_pool::BufferPool;
use crate::config::TelemetryServerConfig;
use crate::error::{GatewayError, Result};
use crate::frame::{infer_device_tag, FrameSource, RawFrame};
use crate::pipeline::PipelineIntake;
use crate::sessions::SessionTracker;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs the UDP receiver until cancelled.
pub async fn run(
    config: TelemetryServerConfig,
    intake: PipelineIntake,
    tracker: Arc<SessionTracker>,
    pool: Arc<BufferPool>,
    token: CancellationToken,
) -> Result<()> {
    let address = format!("0.0.0.0:{}", config.udp_port);
    let socket = bind_socket(&address)?;
    info!("UDP endpoint listening on {}", address);
    tracker.set_udp_active(true);

    loop {
        let mut buf = pool.rent();

        tokio::select! {
            _ = token.cancelled() => {
                info!("UDP receiver shutting down");
                break;
            }
            recv_res = socket.recv_buf_from(&mut *buf) => {
                match recv_res {
                    Ok((n, peer)) if n > 0 => {
                        let device_id = synthesize_device_id(buf.as_slice(), peer);
                        let frame = RawFrame::new(buf, FrameSource::Udp { peer }, device_id);
                        if intake.submit(frame).await.is_err() {
                            error!("Pipeline intake closed; stopping UDP receiver");
                            break;
                        }
                    }
                    Ok(_) => {} // empty datagram
                    Err(e) => error!("UDP recv error: {}", e),
                }
            }
        }
    }

    tracker.set_udp_active(false);
    Ok(())
}

fn bind_socket(address: &str) -> Result<UdpSocket> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid UDP address {}: {}", address, e)))?;

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
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

    UdpSocket::from_std(socket.into()).map_err(|e| GatewayError::network(address, e))
}

/// `<talker+type>_<peer>` with `:` replaced by `_`, e.g.
/// `GPGGA_10.0.0.5_40000`.
fn synthesize_device_id(payload: &[u8], peer: SocketAddr) -> String {
    let tag = infer_device_tag(payload).unwrap_or_else(|| "UNKNOWN".to_string());
    format!("{}_{}", tag, peer).replace(':', "_")
}
