use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration, MissedTickBehavior};

use super::SignalBuffer;
use crate::device::DeviceManager;

/// Electrogram poll loop over the device manager's connection
pub struct SignalMonitor {
    task_handle: tokio::task::JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
    snapshot_rx: watch::Receiver<SignalBuffer>,
}

impl SignalMonitor {
    /// Poll `get_signals` every `interval`, keeping `capacity` samples per channel
    pub fn start(device_manager: Arc<DeviceManager>, interval: Duration, capacity: usize) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (snapshot_tx, snapshot_rx) = watch::channel(SignalBuffer::new(capacity));

        let task_handle = tokio::spawn(async move {
            Self::polling_loop(device_manager, interval, capacity, snapshot_tx, stop_rx).await;
        });

        Self {
            task_handle,
            stop_tx,
            snapshot_rx,
        }
    }

    /// Receiver that sees every published buffer
    pub fn subscribe(&self) -> watch::Receiver<SignalBuffer> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> SignalBuffer {
        self.snapshot_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Signal the loop and wait up to 2 s for it; returns the final buffer
    pub async fn stop(self) -> SignalBuffer {
        let _ = self.stop_tx.send(()).await;

        if timeout(Duration::from_secs(2), self.task_handle).await.is_err() {
            log::warn!("Signal monitor did not stop within 2s");
        }

        let buffer = self.snapshot_rx.borrow().clone();
        buffer
    }

    async fn polling_loop(
        device_manager: Arc<DeviceManager>,
        interval: Duration,
        capacity: usize,
        snapshot_tx: watch::Sender<SignalBuffer>,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        let start_time = Instant::now();
        let mut buffer = SignalBuffer::new(capacity);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!("Starting EGM polling every {:?}", interval);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    log::info!("Received stop signal for EGM polling");
                    break;
                }

                _ = ticker.tick() => {
                    match device_manager.get_signals().await {
                        Ok(frame) => {
                            buffer.push_frame(&frame);
                            snapshot_tx.send_replace(buffer.clone());
                        }
                        Err(crate::device::DeviceError::NotConnected) => {
                            log::warn!("Device disconnected, stopping EGM polling");
                            break;
                        }
                        Err(e) => {
                            buffer.failed_polls += 1;
                            log::warn!("EGM poll failed ({} so far): {}", buffer.failed_polls, e);
                            snapshot_tx.send_replace(buffer.clone());
                        }
                    }
                }
            }
        }

        log::info!(
            "Stopped EGM polling (ran for {:?}, {} frames, {} failed polls)",
            start_time.elapsed(),
            buffer.frames_received,
            buffer.failed_polls
        );
    }
}
