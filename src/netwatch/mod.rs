//! Debounced network-change watcher.
//!
//! Reachability events tend to arrive in storms (several interfaces
//! coming up at once). The monitor coalesces every burst into a single
//! fire so the provider broadcasts once per burst instead of once per
//! event.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long the single-shot stays armed before it fires. Events
/// arriving while armed are absorbed into the same fire.
const COALESCE_DELAY: Duration = Duration::from_millis(100);

/// Handle feeding reachability events into the debouncer.
#[derive(Clone)]
pub(crate) struct NetworkMonitor {
    notify_tx: mpsc::UnboundedSender<()>,
}

impl NetworkMonitor {
    /// Spawns the debouncing task. Each coalesced burst produces one
    /// `()` on `fire_tx`.
    pub fn new(fire_tx: mpsc::UnboundedSender<()>, cancel: CancellationToken) -> Self {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = notify_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        tokio::time::sleep(COALESCE_DELAY).await;
                        let mut absorbed = 0usize;
                        while notify_rx.try_recv().is_ok() {
                            absorbed += 1;
                        }
                        if absorbed > 0 {
                            debug!("absorbed {} duplicate network-change events", absorbed);
                        }
                        if fire_tx.send(()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { notify_tx }
    }

    /// Reports a reachability event. Cheap and callable from any task.
    pub fn notify(&self) {
        let _ = self.notify_tx.send(());
    }
}
