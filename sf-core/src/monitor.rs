//! Background monitoring loop
//!
//! Polls every temperature and fan at a fixed interval and publishes the
//! results on a channel until stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants;
use crate::service::{FanReading, SmcService, TemperatureReading};

#[derive(Debug, Clone)]
pub struct MonitorSample {
    /// Poll number, starting at 1
    pub sequence: u64,
    pub temperatures: Vec<TemperatureReading>,
    pub fans: Vec<FanReading>,
}

pub struct Monitor {
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Monitor {
    /// Start polling `service` every `interval`.
    pub fn spawn(service: SmcService, interval: Duration) -> (Self, mpsc::Receiver<MonitorSample>) {
        let (tx, rx) = mpsc::channel(constants::monitor::CHANNEL_CAPACITY);
        let cancelled = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let handle = tokio::spawn(run(service, interval, tx, cancelled.clone(), wake.clone()));
        (
            Self {
                cancelled,
                wake,
                handle,
            },
            rx,
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel and wait for the loop to exit.
    ///
    /// A poll already in flight finishes first; no further poll starts.
    pub async fn stop(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        if let Err(e) = self.handle.await {
            warn!("Monitor task ended abnormally: {}", e);
        }
    }
}

async fn run(
    service: SmcService,
    interval: Duration,
    tx: mpsc::Sender<MonitorSample>,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    info!("Monitor started (every {:?})", interval);
    let mut sequence = 0u64;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        sequence += 1;
        let temperatures = match service.all_temperatures().await {
            Ok(t) => t,
            Err(e) => {
                warn!("Temperature poll failed: {}", e);
                Vec::new()
            }
        };
        let fans = match service.all_fans().await {
            Ok(f) => f,
            Err(e) => {
                warn!("Fan poll failed: {}", e);
                Vec::new()
            }
        };

        let sample = MonitorSample {
            sequence,
            temperatures,
            fans,
        };
        // a receiver that stops draining must not block cancellation
        tokio::select! {
            sent = tx.send(sample) => {
                if sent.is_err() {
                    debug!("Monitor receiver dropped");
                    break;
                }
            }
            _ = wake.notified() => {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => {}
        }
    }

    info!("Monitor stopped after {} polls", sequence);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FixedLoad;
    use crate::helper_client::MockHelperTransport;
    use crate::settings::SmcSettings;

    fn simulated_service() -> SmcService {
        SmcService::with_transport(
            Arc::new(MockHelperTransport::new()),
            SmcSettings::default(),
            Arc::new(FixedLoad(0.4)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_until_stopped() {
        let (monitor, mut rx) = Monitor::spawn(simulated_service(), Duration::from_secs(2));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert!(!first.temperatures.is_empty());
        assert_eq!(first.fans.len(), 2);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence, 2);

        monitor.stop().await;
        // the loop exits before its next poll; the channel drains then closes
        while rx.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_sleep() {
        let (monitor, mut rx) = Monitor::spawn(simulated_service(), Duration::from_secs(3600));
        rx.recv().await.unwrap();
        assert!(!monitor.is_cancelled());

        let started = tokio::time::Instant::now();
        monitor.stop().await;
        assert!(started.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_stop_with_undrained_receiver() {
        let (monitor, _rx) = Monitor::spawn(simulated_service(), Duration::from_millis(1));
        // long enough for the channel to fill up
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(3), monitor.stop()).await;
        assert!(stopped.is_ok(), "stop blocked behind a full channel");
    }
}
