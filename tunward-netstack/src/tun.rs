//! TUN device wrapper (unix).
//!
//! One I/O task owns the device: frames read from it are pushed to the
//! stack, frames queued by the stack are written back. The write side
//! is the single mpsc consumer, which keeps device writes serialized.

use crate::error::{NetStackError, Result};
use bytes::BytesMut;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tunward_core::TunnelConfig;

const CHANNEL_CAPACITY: usize = 4096;

pub struct TunDevice {
    config: TunnelConfig,
    tx: Option<mpsc::Sender<BytesMut>>,
    rx: Option<mpsc::Receiver<BytesMut>>,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl TunDevice {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            tx: None,
            rx: None,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Sender for frames headed to the device (the stack's frame_tx)
    pub fn frame_sender(&self) -> Result<mpsc::Sender<BytesMut>> {
        self.tx.clone().ok_or(NetStackError::DeviceNotReady)
    }

    /// Receiver of frames read from the device (the stack's input)
    pub fn take_frame_receiver(&mut self) -> Option<mpsc::Receiver<BytesMut>> {
        self.rx.take()
    }

    #[cfg(all(unix, not(target_os = "android")))]
    pub async fn start(&mut self) -> Result<()> {
        use tun_rs::DeviceBuilder;

        if self.is_running() {
            return Ok(());
        }

        let prefix_len = netmask_to_prefix(self.config.tun_netmask);

        let device = DeviceBuilder::new()
            .name(&self.config.tun_name)
            .ipv4(self.config.tun_address, prefix_len, None::<Ipv4Addr>)
            .mtu(self.config.mtu)
            .build_async()
            .map_err(|e| NetStackError::TunError(format!("Failed to create TUN: {}", e)))?;

        info!(
            "TUN device created: {} with address {}/{}",
            self.config.tun_name, self.config.tun_address, prefix_len
        );

        let (tx_to_tun, mut rx_from_stack) = mpsc::channel::<BytesMut>(CHANNEL_CAPACITY);
        let (tx_to_stack, rx_from_tun) = mpsc::channel::<BytesMut>(CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        self.tx = Some(tx_to_tun);
        self.rx = Some(rx_from_tun);
        self.shutdown_tx = Some(shutdown_tx);

        let running = self.running.clone();
        running.store(true, Ordering::Relaxed);

        let mtu = self.config.mtu as usize;
        tokio::spawn(async move {
            let mut read_buf = vec![0u8; mtu.max(1500)];

            loop {
                tokio::select! {
                    result = device.recv(&mut read_buf) => {
                        match result {
                            Ok(n) => {
                                let frame = BytesMut::from(&read_buf[..n]);
                                if tx_to_stack.send(frame).await.is_err() {
                                    debug!("Stack receiver dropped");
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("TUN read error: {}", e);
                                break;
                            }
                        }
                    }
                    Some(frame) = rx_from_stack.recv() => {
                        if let Err(e) = device.send(&frame).await {
                            error!("TUN write error: {}", e);
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("TUN shutdown requested");
                        break;
                    }
                }
            }

            running.store(false, Ordering::Relaxed);
            info!("TUN I/O task stopped");
        });

        Ok(())
    }

    #[cfg(not(all(unix, not(target_os = "android"))))]
    pub async fn start(&mut self) -> Result<()> {
        Err(NetStackError::Unsupported(
            "TUN device creation is only supported on unix targets; \
             hosts on other platforms supply the device themselves"
                .to_string(),
        ))
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.running.store(false, Ordering::Relaxed);
    }
}

pub fn netmask_to_prefix(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}
