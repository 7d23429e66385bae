//! Background refresh scheduler
//!
//! Periodically asks the coordinator to refresh the latest entry and reports
//! what happened over a tokio channel. The coordinator decides whether a
//! refresh is due and whether anyone has been active recently.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::coordinator::{BackgroundRefresh, RefreshCoordinator};

/// Messages sent from the scheduler to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshMessage {
    /// A latest refresh was started
    RefreshStarted,
    /// A refresh of the latest entry was already running
    RefreshInProgress,
    /// The latest entry is still fresh
    UpToDate,
    /// Skipped because nobody was active recently
    Suspended,
}

impl From<BackgroundRefresh> for RefreshMessage {
    fn from(outcome: BackgroundRefresh) -> Self {
        match outcome {
            BackgroundRefresh::Started => RefreshMessage::RefreshStarted,
            BackgroundRefresh::AlreadyRunning => RefreshMessage::RefreshInProgress,
            BackgroundRefresh::UpToDate => RefreshMessage::UpToDate,
            BackgroundRefresh::Suspended => RefreshMessage::Suspended,
        }
    }
}

/// Configuration for the refresh schedule
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// How often the latest entry is checked
    pub latest_interval: Duration,
    /// Whether the scheduler runs at all
    pub enabled: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            latest_interval: Duration::from_secs(300), // 5 minutes
            enabled: true,
        }
    }
}

/// Handle for controlling the background refresh scheduler
pub struct RefreshHandle {
    /// Channel for receiving refresh messages
    pub receiver: mpsc::Receiver<RefreshMessage>,
    /// Asks the loop for an immediate check
    trigger_tx: mpsc::Sender<()>,
    /// Flag to signal shutdown
    shutdown_tx: mpsc::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    /// Spawns the scheduler loop for `coordinator`
    ///
    /// With `config.enabled == false` no task is spawned and no messages arrive.
    pub fn spawn(coordinator: RefreshCoordinator, config: RefreshConfig) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = config.enabled.then(|| {
            let interval = config.latest_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // Skip the first tick (immediate)
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        Some(()) = trigger_rx.recv() => {}
                        _ = shutdown_rx.recv() => break,
                    }

                    let message = RefreshMessage::from(coordinator.refresh_latest_if_due());
                    debug!(?message, "Scheduled refresh check");
                    if msg_tx.send(message).await.is_err() {
                        break;
                    }
                }
            })
        });

        Self {
            receiver: msg_rx,
            trigger_tx,
            shutdown_tx,
            task,
        }
    }

    /// Requests an immediate refresh check
    pub fn request_refresh(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Stops the scheduler loop and waits for it to exit
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
