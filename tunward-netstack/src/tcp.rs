//! TCP flow engine.
//!
//! Answers the local stack's TCP handshakes itself and relays each flow
//! to the real destination, directly or through the SOCKS5 proxy. One
//! tokio task per flow handles upstream establishment and the
//! upstream-to-device forwarding loop; inbound segments are applied to
//! the flow from the dispatch task without blocking on flow lifetime.

use crate::error::{NetStackError, Result};
use crate::packet::{build_ipv4_tcp, TcpFlags, TcpInfo};
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tunward_core::{
    connect_protected_timeout, log_event, EventCategory, RouteAction, RouteTable, Socks5Client,
    TrafficStats,
};

const UPSTREAM_CHANNEL_CAPACITY: usize = 512;
const SEND_WINDOW: u16 = 65535;

/// 4-tuple identifying one flow observed through the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Flow lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Created on SYN, upstream not yet established
    New,
    /// SYN-ACK emitted, waiting for the completing ACK
    SynAckSent,
    Established,
    /// We sent FIN after upstream EOF
    Closing,
    Closed,
}

/// One tracked TCP flow. Sequence counters use wrap-around arithmetic;
/// `local_seq` is the next byte we will send, `local_ack` the next
/// remote byte we expect.
pub struct TcpFlow {
    pub key: FlowKey,
    id: u64,
    verdict: RouteAction,
    state: Mutex<FlowState>,
    local_seq: AtomicU32,
    local_ack: AtomicU32,
    upstream_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    closed: AtomicBool,
}

impl TcpFlow {
    fn new(key: FlowKey, id: u64, verdict: RouteAction, remote_seq: u32) -> Self {
        // Pseudo-random initial sequence number: avoids collisions
        // across reused ports, not meant to resist an adversary.
        let iss: u32 = rand::random();
        Self {
            key,
            id,
            verdict,
            state: Mutex::new(FlowState::New),
            local_seq: AtomicU32::new(iss),
            local_ack: AtomicU32::new(remote_seq.wrapping_add(1)),
            upstream_tx: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Mark closed and drop the upstream sender so the writer task and
    /// its socket wind down.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            *self.state.lock() = FlowState::Closed;
            self.upstream_tx.lock().take();
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub connect_timeout: Duration,
    /// Upstream reads poll at this interval so shutdown and flow
    /// closure are observed promptly
    pub poll_interval: Duration,
    /// Upstream read chunk, sized so one read fits one MTU-bounded
    /// reply segment
    pub mss: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            mss: 1460,
        }
    }
}

impl TcpConfig {
    pub fn from_tunnel(tunnel: &tunward_core::TunnelConfig) -> Self {
        Self {
            connect_timeout: tunnel.connect_timeout(),
            mss: (tunnel.mtu as usize).saturating_sub(40).max(536),
            ..Default::default()
        }
    }
}

/// Concurrent TCP flow table and segment handler
pub struct TcpEngine {
    flows: DashMap<FlowKey, Arc<TcpFlow>>,
    routes: Arc<RouteTable>,
    stats: Arc<TrafficStats>,
    socks5: Arc<Socks5Client>,
    frame_tx: mpsc::Sender<BytesMut>,
    running: Arc<AtomicBool>,
    config: TcpConfig,
    flow_counter: AtomicU64,
}

impl TcpEngine {
    pub fn new(
        routes: Arc<RouteTable>,
        stats: Arc<TrafficStats>,
        socks5: Arc<Socks5Client>,
        frame_tx: mpsc::Sender<BytesMut>,
        running: Arc<AtomicBool>,
        config: TcpConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            flows: DashMap::new(),
            routes,
            stats,
            socks5,
            frame_tx,
            running,
            config,
            flow_counter: AtomicU64::new(0),
        })
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Apply one inbound segment
    pub async fn handle_segment(
        self: &Arc<Self>,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        tcp: &TcpInfo,
        payload: &[u8],
    ) -> Result<()> {
        let key = FlowKey { src, dst };

        if tcp.flags.syn && !tcp.flags.ack {
            return self.handle_syn(key, tcp).await;
        }

        let existing = self.flows.get(&key).map(|entry| entry.clone());
        match existing {
            Some(flow) => self.process_segment(&flow, tcp, payload).await,
            None if tcp.flags.rst => Ok(()),
            None => {
                // No flow for this segment: tell the local stack so it
                // stops retrying
                debug!("Orphan TCP segment, sending RST: {}", key);
                self.send_rst_ack(key, tcp.seq).await
            }
        }
    }

    async fn handle_syn(self: &Arc<Self>, key: FlowKey, tcp: &TcpInfo) -> Result<()> {
        // A new SYN supersedes whatever was tracked under this key
        if let Some((_, old)) = self.flows.remove(&key) {
            debug!("Duplicate SYN, tearing down old flow: {}", key);
            old.close();
        }

        let verdict = self.routes.action_for_ip(*key.dst.ip());

        if verdict == RouteAction::Block {
            self.stats.add_blocked_connection();
            log_event(EventCategory::Blocked, "TCP", &key.dst.to_string());
            return self.send_rst_ack(key, tcp.seq).await;
        }

        let id = self.flow_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let flow = Arc::new(TcpFlow::new(key, id, verdict, tcp.seq));
        // single map operation: at most one live flow per key
        if let Some(old) = self.flows.insert(key, flow.clone()) {
            old.close();
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_flow(flow).await;
        });

        Ok(())
    }

    async fn process_segment(
        &self,
        flow: &Arc<TcpFlow>,
        tcp: &TcpInfo,
        payload: &[u8],
    ) -> Result<()> {
        if flow.is_closed() {
            return Ok(());
        }

        if tcp.flags.rst {
            debug!("TCP RST received: {}", flow.key);
            self.remove_flow(flow);
            return Ok(());
        }

        if tcp.flags.fin {
            flow.local_ack
                .store(tcp.seq.wrapping_add(1), Ordering::Relaxed);
            self.send_flow_segment(flow, TcpFlags::fin_ack(), &[]).await?;
            flow.local_seq.fetch_add(1, Ordering::Relaxed);
            self.remove_flow(flow);
            return Ok(());
        }

        if tcp.flags.ack {
            let mut state = flow.state.lock();
            if *state == FlowState::SynAckSent {
                *state = FlowState::Established;
                debug!("TCP established: #{} {}", flow.id, flow.key);
            }
        }

        if !payload.is_empty() {
            let tx = flow.upstream_tx.lock().clone();
            match tx {
                Some(tx) => {
                    // keep the dispatch task unblocked: overflow is
                    // handed to a send task, closure closes the flow
                    match tx.try_send(payload.to_vec()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(data)) => {
                            let flow = flow.clone();
                            tokio::spawn(async move {
                                if tx.send(data).await.is_err() {
                                    flow.close();
                                }
                            });
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            warn!("Upstream writer gone: #{} {}", flow.id, flow.key);
                            self.remove_flow(flow);
                            return Ok(());
                        }
                    }
                }
                None => {
                    debug!(
                        "Payload before upstream ready, dropping {} bytes: {}",
                        payload.len(),
                        flow.key
                    );
                    return Ok(());
                }
            }

            flow.local_ack
                .store(tcp.seq.wrapping_add(payload.len() as u32), Ordering::Relaxed);
            self.send_flow_segment(flow, TcpFlags::ack_only(), &[]).await?;
        }

        Ok(())
    }

    /// Per-flow task: establish upstream, emit SYN-ACK (or RST), then
    /// forward upstream bytes to the device until EOF or closure.
    async fn run_flow(self: Arc<Self>, flow: Arc<TcpFlow>) {
        let key = flow.key;
        let dest = key.dst;

        let connect = match flow.verdict {
            RouteAction::Proxy => {
                self.socks5
                    .connect(dest, self.config.connect_timeout)
                    .await
                    .map_err(NetStackError::Upstream)
            }
            _ => connect_protected_timeout(&dest.to_string(), self.config.connect_timeout)
                .await
                .map_err(NetStackError::Io),
        };

        let stream = match connect {
            Ok(stream) => stream,
            Err(e) => {
                log_event(
                    EventCategory::Error,
                    "TCP",
                    &format!("#{} {} - {}", flow.id, dest, e),
                );
                // no reply was sent yet, so answer the SYN with RST
                let _ = self.send_rst(&flow).await;
                self.remove_flow(&flow);
                return;
            }
        };

        let _ = stream.set_nodelay(true);

        match flow.verdict {
            RouteAction::Proxy => {
                self.stats.add_proxy_connection();
                log_event(
                    EventCategory::Proxied,
                    "TCP",
                    &format!("#{} {}", flow.id, dest),
                );
            }
            _ => {
                self.stats.add_direct_connection();
                log_event(
                    EventCategory::Direct,
                    "TCP",
                    &format!("#{} {}", flow.id, dest),
                );
            }
        }

        let (mut read_half, mut write_half) = stream.into_split();

        // local-to-upstream writer, fed from the dispatch task
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(UPSTREAM_CHANNEL_CAPACITY);
        *flow.upstream_tx.lock() = Some(tx);

        let writer_flow = flow.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    warn!(
                        "Upstream write error: #{} {} - {}",
                        writer_flow.id, writer_flow.key, e
                    );
                    writer_flow.close();
                    break;
                }
            }
        });

        // handshake reply: SYN-ACK consumes one sequence number
        if self
            .send_flow_segment(&flow, TcpFlags::syn_ack(), &[])
            .await
            .is_err()
        {
            self.remove_flow(&flow);
            return;
        }
        flow.local_seq.fetch_add(1, Ordering::Relaxed);
        *flow.state.lock() = FlowState::SynAckSent;

        // upstream-to-device loop; short poll timeout so the running
        // flag and flow closure are observed between reads
        let mut buf = vec![0u8; self.config.mss];
        loop {
            if !self.running.load(Ordering::Relaxed) || flow.is_closed() {
                break;
            }

            match tokio::time::timeout(self.config.poll_interval, read_half.read(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    debug!("Upstream EOF: #{} {}", flow.id, key);
                    *flow.state.lock() = FlowState::Closing;
                    let _ = self.send_flow_segment(&flow, TcpFlags::fin_ack(), &[]).await;
                    flow.local_seq.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Ok(Ok(n)) => {
                    self.stats.add_bytes_in(n as u64);
                    self.stats.add_packet_in();
                    if self
                        .send_flow_segment(&flow, TcpFlags::psh_ack(), &buf[..n])
                        .await
                        .is_err()
                    {
                        break;
                    }
                    flow.local_seq.fetch_add(n as u32, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    if !flow.is_closed() {
                        log_event(
                            EventCategory::Error,
                            "TCP",
                            &format!("#{} {} read error: {}", flow.id, key, e),
                        );
                    }
                    break;
                }
            }
        }

        self.remove_flow(&flow);
    }

    /// Close a flow and drop it from the table. Guarded so a flow that
    /// has already been replaced under the same key is left alone.
    fn remove_flow(&self, flow: &Arc<TcpFlow>) {
        flow.close();
        self.flows
            .remove_if(&flow.key, |_, tracked| Arc::ptr_eq(tracked, flow));
    }

    /// Close every flow and clear the table (shutdown path)
    pub fn close_all(&self) {
        let snapshot: Vec<Arc<TcpFlow>> = self.flows.iter().map(|e| e.clone()).collect();
        for flow in &snapshot {
            flow.close();
        }
        self.flows.clear();
        if !snapshot.is_empty() {
            debug!("Closed {} TCP flows", snapshot.len());
        }
    }

    /// Emit a segment from the flow's current counters (device-bound
    /// segments travel dst -> src)
    async fn send_flow_segment(
        &self,
        flow: &Arc<TcpFlow>,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Result<()> {
        let pkt = build_ipv4_tcp(
            *flow.key.dst.ip(),
            *flow.key.src.ip(),
            flow.key.dst.port(),
            flow.key.src.port(),
            flow.local_seq.load(Ordering::Relaxed),
            flow.local_ack.load(Ordering::Relaxed),
            flags,
            SEND_WINDOW,
            payload,
        );
        self.emit(pkt).await
    }

    /// RST answering a connection we refused or failed to establish
    async fn send_rst(&self, flow: &Arc<TcpFlow>) -> Result<()> {
        let pkt = build_ipv4_tcp(
            *flow.key.dst.ip(),
            *flow.key.src.ip(),
            flow.key.dst.port(),
            flow.key.src.port(),
            flow.local_seq.load(Ordering::Relaxed),
            0,
            TcpFlags::rst_only(),
            SEND_WINDOW,
            &[],
        );
        self.emit(pkt).await
    }

    /// RST+ACK for blocked or orphan segments (no flow state to draw on)
    async fn send_rst_ack(&self, key: FlowKey, remote_seq: u32) -> Result<()> {
        let pkt = build_ipv4_tcp(
            *key.dst.ip(),
            *key.src.ip(),
            key.dst.port(),
            key.src.port(),
            0,
            remote_seq.wrapping_add(1),
            TcpFlags::rst_ack(),
            SEND_WINDOW,
            &[],
        );
        self.emit(pkt).await
    }

    async fn emit(&self, pkt: Vec<u8>) -> Result<()> {
        self.frame_tx
            .send(BytesMut::from(&pkt[..]))
            .await
            .map_err(|_| NetStackError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse_packet, TransportInfo};
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn test_tcp_info(seq: u32, flags: TcpFlags, payload_len: usize) -> TcpInfo {
        TcpInfo {
            src_port: 0,
            dst_port: 0,
            seq,
            ack: 0,
            header_len: 20,
            flags,
            window: 65535,
            payload_len,
        }
    }

    struct Harness {
        engine: Arc<TcpEngine>,
        frame_rx: mpsc::Receiver<BytesMut>,
        routes: Arc<RouteTable>,
        stats: Arc<TrafficStats>,
    }

    fn harness() -> Harness {
        let routes = Arc::new(RouteTable::new());
        let stats = Arc::new(TrafficStats::new());
        let socks5 = Arc::new(Socks5Client::with_credentials("127.0.0.1", 1, None, None));
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let running = Arc::new(AtomicBool::new(true));
        let config = TcpConfig {
            connect_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(20),
            mss: 1460,
        };
        let engine = TcpEngine::new(
            routes.clone(),
            stats.clone(),
            socks5,
            frame_tx,
            running,
            config,
        );
        Harness {
            engine,
            frame_rx,
            routes,
            stats,
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<BytesMut>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("frame channel closed")
            .to_vec()
    }

    fn tcp_of(frame: &[u8]) -> (TcpInfo, Vec<u8>) {
        let parsed = parse_packet(frame).unwrap();
        let payload = parsed.payload(frame).to_vec();
        match parsed.transport {
            TransportInfo::Tcp(info) => (info, payload),
            other => panic!("expected TCP frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocked_syn_gets_single_rst_ack() {
        let mut h = harness();
        h.routes.add_block_cidr("10.1.0.0/16");

        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000);
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 443);
        let syn = test_tcp_info(5000, TcpFlags { syn: true, ..Default::default() }, 0);

        h.engine.handle_segment(src, dst, &syn, &[]).await.unwrap();

        let frame = next_frame(&mut h.frame_rx).await;
        let (info, _) = tcp_of(&frame);
        assert!(info.flags.rst && info.flags.ack);
        assert_eq!(info.ack, 5001);

        assert_eq!(h.engine.flow_count(), 0);
        assert_eq!(h.stats.connections_blocked(), 1);
        // exactly one reply segment
        assert!(h.frame_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_direct_flow_handshake_and_forwarding() {
        let mut h = harness();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let dst = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), upstream_addr.port());
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40001);

        let upstream = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"GET");
            // reply 5 bytes then EOF
            stream.write_all(b"hello").await.unwrap();
        });

        let syn = test_tcp_info(1000, TcpFlags { syn: true, ..Default::default() }, 0);
        h.engine.handle_segment(src, dst, &syn, &[]).await.unwrap();

        let (syn_ack, _) = tcp_of(&next_frame(&mut h.frame_rx).await);
        assert!(syn_ack.flags.syn && syn_ack.flags.ack);
        assert_eq!(syn_ack.ack, 1001);
        let iss = syn_ack.seq;
        assert_eq!(h.engine.flow_count(), 1);

        // complete the handshake, then push "GET"
        let ack = test_tcp_info(1001, TcpFlags::ack_only(), 0);
        h.engine.handle_segment(src, dst, &ack, &[]).await.unwrap();

        let push = test_tcp_info(1001, TcpFlags::psh_ack(), 3);
        h.engine.handle_segment(src, dst, &push, b"GET").await.unwrap();

        let (ack_frame, _) = tcp_of(&next_frame(&mut h.frame_rx).await);
        assert!(ack_frame.flags.ack && !ack_frame.flags.psh);
        assert_eq!(ack_frame.ack, 1004);

        // upstream reply becomes one PSH+ACK, then EOF becomes FIN+ACK
        let (data_frame, payload) = tcp_of(&next_frame(&mut h.frame_rx).await);
        assert!(data_frame.flags.psh && data_frame.flags.ack);
        assert_eq!(payload, b"hello");
        assert_eq!(data_frame.seq, iss.wrapping_add(1));

        let (fin_frame, _) = tcp_of(&next_frame(&mut h.frame_rx).await);
        assert!(fin_frame.flags.fin && fin_frame.flags.ack);
        assert_eq!(fin_frame.seq, iss.wrapping_add(6));

        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_syn_keeps_single_flow() {
        let mut h = harness();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let dst = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), upstream_addr.port());
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40002);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                // hold the connection open
                tokio::spawn(async move {
                    let mut stream = stream;
                    let mut buf = [0u8; 1];
                    let _ = stream.read(&mut buf).await;
                });
            }
        });

        let syn = test_tcp_info(1000, TcpFlags { syn: true, ..Default::default() }, 0);
        h.engine.handle_segment(src, dst, &syn, &[]).await.unwrap();
        let _ = next_frame(&mut h.frame_rx).await; // first SYN-ACK

        let syn2 = test_tcp_info(2000, TcpFlags { syn: true, ..Default::default() }, 0);
        h.engine.handle_segment(src, dst, &syn2, &[]).await.unwrap();
        let (second, _) = tcp_of(&next_frame(&mut h.frame_rx).await);
        assert!(second.flags.syn && second.flags.ack);
        assert_eq!(second.ack, 2001);

        assert_eq!(h.engine.flow_count(), 1);
    }

    #[tokio::test]
    async fn test_inbound_fin_answered_and_flow_removed() {
        let mut h = harness();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let dst = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), upstream_addr.port());
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40003);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = stream;
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
        });

        let syn = test_tcp_info(1000, TcpFlags { syn: true, ..Default::default() }, 0);
        h.engine.handle_segment(src, dst, &syn, &[]).await.unwrap();
        let _ = next_frame(&mut h.frame_rx).await;

        let fin = test_tcp_info(
            1001,
            TcpFlags { fin: true, ack: true, ..Default::default() },
            0,
        );
        h.engine.handle_segment(src, dst, &fin, &[]).await.unwrap();

        let (fin_ack, _) = tcp_of(&next_frame(&mut h.frame_rx).await);
        assert!(fin_ack.flags.fin && fin_ack.flags.ack);
        assert_eq!(fin_ack.ack, 1002);

        // table drains once the flow task notices closure
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.engine.flow_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_orphan_segment_gets_rst() {
        let mut h = harness();

        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40004);
        let dst = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 80);
        let stray = test_tcp_info(7777, TcpFlags::ack_only(), 0);

        h.engine.handle_segment(src, dst, &stray, &[]).await.unwrap();

        let (info, _) = tcp_of(&next_frame(&mut h.frame_rx).await);
        assert!(info.flags.rst);
        assert_eq!(info.ack, 7778);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_gets_rst() {
        let mut h = harness();

        // reserve a port and close it so the dial is refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40005);
        let dst = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port);
        let syn = test_tcp_info(3000, TcpFlags { syn: true, ..Default::default() }, 0);

        h.engine.handle_segment(src, dst, &syn, &[]).await.unwrap();

        let (info, _) = tcp_of(&next_frame(&mut h.frame_rx).await);
        assert!(info.flags.rst);
        assert!(!info.flags.syn);
        assert_eq!(h.engine.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_clears_table() {
        let h = harness();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let dst = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), upstream_addr.port());

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut stream = stream;
                    let mut buf = [0u8; 1];
                    let _ = stream.read(&mut buf).await;
                });
            }
        });

        for port in 41000..41003u16 {
            let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), port);
            let syn = test_tcp_info(100, TcpFlags { syn: true, ..Default::default() }, 0);
            h.engine.handle_segment(src, dst, &syn, &[]).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.engine.flow_count() != 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        h.engine.close_all();
        assert_eq!(h.engine.flow_count(), 0);
    }
}
