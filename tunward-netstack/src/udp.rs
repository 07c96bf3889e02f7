//! Stateless UDP forwarding.
//!
//! UDP keeps no flow identity here: each inbound datagram gets one
//! ephemeral upstream socket, one expected reply within a bounded
//! timeout, one synthetic reply frame, then the socket is dropped.
//! UDP is never proxied through SOCKS5; verdicts are Block or Direct.

use crate::error::{NetStackError, Result};
use crate::packet::build_ipv4_udp;
use bytes::BytesMut;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use tunward_core::{
    bind_protected_udp, log_event, EventCategory, RouteAction, RouteTable, TrafficStats,
};

const REPLY_BUFFER_SIZE: usize = 4096;

pub struct UdpForwarder {
    routes: Arc<RouteTable>,
    stats: Arc<TrafficStats>,
    frame_tx: mpsc::Sender<BytesMut>,
    running: Arc<AtomicBool>,
    block_all: AtomicBool,
    reply_timeout: Duration,
}

impl UdpForwarder {
    pub fn new(
        routes: Arc<RouteTable>,
        stats: Arc<TrafficStats>,
        frame_tx: mpsc::Sender<BytesMut>,
        running: Arc<AtomicBool>,
        block_all: bool,
        reply_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            routes,
            stats,
            frame_tx,
            running,
            block_all: AtomicBool::new(block_all),
            reply_timeout,
        })
    }

    /// Flip the block-all override at runtime
    pub fn set_block_all(&self, block: bool) {
        self.block_all.store(block, Ordering::Relaxed);
        log_event(EventCategory::Info, "UDP", &format!("Block all UDP: {}", block));
    }

    pub fn block_all(&self) -> bool {
        self.block_all.load(Ordering::Relaxed)
    }

    /// Handle one inbound datagram
    pub fn handle_datagram(
        self: &Arc<Self>,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: &[u8],
    ) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }

        if self.block_all() {
            self.stats.add_blocked_connection();
            log_event(
                EventCategory::Blocked,
                "UDP",
                &format!("{} ({}B) - all UDP blocked", dst, payload.len()),
            );
            return Ok(());
        }

        if self.routes.action_for_ip(*dst.ip()) == RouteAction::Block {
            self.stats.add_blocked_connection();
            log_event(
                EventCategory::Blocked,
                "UDP",
                &format!("{} ({}B)", dst, payload.len()),
            );
            return Ok(());
        }

        log_event(
            EventCategory::Direct,
            "UDP",
            &format!("{} ({}B)", dst, payload.len()),
        );

        let forwarder = self.clone();
        let payload = payload.to_vec();
        tokio::spawn(async move {
            if let Err(e) = forwarder.forward(src, dst, &payload).await {
                // no reliability contract to uphold: log and drop
                log_event(
                    EventCategory::Warning,
                    "UDP",
                    &format!("{} - {}", dst, e),
                );
            }
        });

        Ok(())
    }

    async fn forward(&self, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<()> {
        let socket = bind_protected_udp().await?;
        socket.send_to(payload, std::net::SocketAddr::V4(dst)).await?;

        let mut buf = vec![0u8; REPLY_BUFFER_SIZE];
        let received = tokio::time::timeout(self.reply_timeout, socket.recv_from(&mut buf)).await;

        let (n, _from) = match received {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(NetStackError::Io(e)),
            Err(_) => return Err(NetStackError::Timeout),
        };

        if !self.running.load(Ordering::Relaxed) {
            return Ok(());
        }

        self.stats.add_bytes_in(n as u64);
        self.stats.add_packet_in();
        self.stats.add_direct_connection();
        debug!("UDP reply: {} ({}B)", dst, n);

        // reply travels dst -> src from the local stack's point of view
        let pkt = build_ipv4_udp(
            *dst.ip(),
            *src.ip(),
            dst.port(),
            src.port(),
            &buf[..n],
        );
        self.frame_tx
            .send(BytesMut::from(&pkt[..]))
            .await
            .map_err(|_| NetStackError::ChannelClosed)
    }
}
