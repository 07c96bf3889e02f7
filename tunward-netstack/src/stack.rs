//! Tunnel stack: the thin orchestrator between the virtual device and
//! the TCP/UDP engines.
//!
//! One dispatch task pulls frames off the device channel, classifies
//! the IPv4 payload and hands it to the right engine; malformed frames
//! are dropped without a reply. All synthetic frames flow back through
//! a single mpsc consumer, so device writes stay serialized.

use crate::error::{NetStackError, Result};
use crate::packet::{parse_packet, TransportInfo};
use crate::tcp::{TcpConfig, TcpEngine};
use crate::udp::UdpForwarder;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tunward_core::{
    connect_protected_timeout, log_event, Config, EventCategory, RouteTable, Socks5Client,
    TrafficStats,
};

pub struct TunnelStack {
    config: Arc<Config>,
    tcp: Arc<TcpEngine>,
    udp: Arc<UdpForwarder>,
    stats: Arc<TrafficStats>,
    running: Arc<AtomicBool>,
}

impl TunnelStack {
    /// `frame_tx` is the device-bound side of the single-writer
    /// channel; whoever owns the device drains it.
    pub fn new(
        config: Arc<Config>,
        routes: Arc<RouteTable>,
        stats: Arc<TrafficStats>,
        frame_tx: mpsc::Sender<BytesMut>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(false));
        let socks5 = Arc::new(Socks5Client::new(&config.server));

        let tcp = TcpEngine::new(
            routes.clone(),
            stats.clone(),
            socks5,
            frame_tx.clone(),
            running.clone(),
            TcpConfig::from_tunnel(&config.tunnel),
        );

        let udp = UdpForwarder::new(
            routes,
            stats.clone(),
            frame_tx,
            running.clone(),
            config.tunnel.block_udp,
            config.tunnel.udp_timeout(),
        );

        Self {
            config,
            tcp,
            udp,
            stats,
            running,
        }
    }

    pub fn tcp_engine(&self) -> &Arc<TcpEngine> {
        &self.tcp
    }

    pub fn udp_forwarder(&self) -> &Arc<UdpForwarder> {
        &self.udp
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Reachability probe of the SOCKS5 server, run before the tunnel
    /// starts carrying traffic.
    pub async fn probe_server(&self) -> Result<()> {
        let endpoint = self.config.server.endpoint();
        let stream =
            connect_protected_timeout(&endpoint, self.config.tunnel.connect_timeout()).await?;
        drop(stream);
        log_event(EventCategory::Info, "VPN", &format!("SOCKS5 server {} OK", endpoint));
        Ok(())
    }

    pub fn start(&self) {
        self.stats.reset();
        self.running.store(true, Ordering::Relaxed);
        if self.config.tunnel.block_udp {
            log_event(EventCategory::Warning, "VPN", "UDP traffic will be blocked");
        }
        info!("Tunnel stack started");
    }

    /// Classify and dispatch one raw frame read from the device
    pub async fn process_frame(self: &Arc<Self>, frame: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        self.stats.add_packet_out();
        self.stats.add_bytes_out(frame.len() as u64);

        let parsed = match parse_packet(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                // malformed frame: drop, no reply
                debug!("Frame parse error: {}", e);
                return Ok(());
            }
        };

        let payload = parsed.payload(frame);

        match &parsed.transport {
            TransportInfo::Tcp(tcp) => {
                let (src, dst) = match (parsed.src_socket(), parsed.dst_socket()) {
                    (Some(src), Some(dst)) => (src, dst),
                    _ => return Ok(()),
                };
                self.tcp.handle_segment(src, dst, tcp, payload).await
            }
            TransportInfo::Udp(_) => {
                let (src, dst) = match (parsed.src_socket(), parsed.dst_socket()) {
                    (Some(src), Some(dst)) => (src, dst),
                    _ => return Ok(()),
                };
                self.udp.handle_datagram(src, dst, payload)
            }
            TransportInfo::Other(proto) => {
                debug!("Ignoring protocol {} frame", proto);
                Ok(())
            }
        }
    }

    /// Drive the dispatch loop until shutdown or device closure. A
    /// closed device channel is fatal to the whole tunnel.
    pub async fn run(self: &Arc<Self>, mut device_rx: mpsc::Receiver<BytesMut>) -> Result<()> {
        while self.is_running() {
            match device_rx.recv().await {
                Some(frame) => {
                    if let Err(e) = self.process_frame(&frame).await {
                        debug!("Dispatch error: {}", e);
                    }
                }
                None => {
                    if self.is_running() {
                        log_event(EventCategory::Error, "VPN", "Device channel closed");
                        self.shutdown();
                        return Err(NetStackError::ChannelClosed);
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Flip the running flag, close every flow and clear the table.
    /// Upstream sockets unblock as their flow tasks observe closure.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.tcp.close_all();
        info!("Tunnel stack stopped: {}", self.stats.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_ipv4_tcp, build_ipv4_udp, TcpFlags};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_stack() -> (Arc<TunnelStack>, mpsc::Receiver<BytesMut>, Arc<RouteTable>) {
        let mut config = Config::default();
        config.server.address = "127.0.0.1".to_string();
        config.tunnel.connect_timeout_secs = 2;
        let routes = Arc::new(RouteTable::new());
        let stats = Arc::new(TrafficStats::new());
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let stack = Arc::new(TunnelStack::new(
            Arc::new(config),
            routes.clone(),
            stats,
            frame_tx,
        ));
        stack.start();
        (stack, frame_rx, routes)
    }

    #[tokio::test]
    async fn test_malformed_frames_dropped() {
        let (stack, mut frame_rx, _) = test_stack();

        stack.process_frame(&[]).await.unwrap();
        stack.process_frame(&[0x60, 0, 0, 0]).await.unwrap();
        stack.process_frame(&[0x45; 10]).await.unwrap();

        assert!(frame_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tcp_frame_dispatched_to_engine() {
        let (stack, mut frame_rx, routes) = test_stack();
        routes.add_block_cidr("9.9.9.9/32");

        let syn = build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(9, 9, 9, 9),
            40000,
            443,
            123,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
        );
        stack.process_frame(&syn).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed = parse_packet(&reply).unwrap();
        match parsed.transport {
            TransportInfo::Tcp(info) => {
                assert!(info.flags.rst && info.flags.ack);
                assert_eq!(info.ack, 124);
            }
            other => panic!("expected TCP, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_udp_frame_blocked_by_toggle() {
        let (stack, mut frame_rx, _) = test_stack();
        stack.udp_forwarder().set_block_all(true);

        let datagram = build_ipv4_udp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(8, 8, 8, 8),
            50000,
            53,
            b"query",
        );
        stack.process_frame(&datagram).await.unwrap();

        assert!(frame_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch() {
        let (stack, _frame_rx, routes) = test_stack();
        routes.add_block_cidr("9.9.9.9/32");

        stack.shutdown();
        assert!(!stack.is_running());

        // frames after shutdown are ignored outright
        let syn = build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(9, 9, 9, 9),
            40000,
            443,
            123,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
        );
        stack.process_frame(&syn).await.unwrap();
        assert_eq!(stack.tcp_engine().flow_count(), 0);
    }

    #[tokio::test]
    async fn test_run_exits_when_device_closes() {
        let (stack, _frame_rx, _) = test_stack();
        let (device_tx, device_rx) = mpsc::channel::<BytesMut>(4);
        drop(device_tx);

        let result = stack.run(device_rx).await;
        assert!(matches!(result, Err(NetStackError::ChannelClosed)));
        assert!(!stack.is_running());
    }
}
