//! Background token renewal.

use crate::client::{TokenLease, TransitApi};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a running renewal task.
///
/// The task renews the token at two thirds of each lease and exits when the
/// token stops being renewable, a renewal fails, or [`Renewer::stop`] is
/// called.
pub struct Renewer {
    shutdown: watch::Sender<bool>,
    renewed: watch::Receiver<u64>,
    handle: JoinHandle<()>,
}

impl Renewer {
    /// Spawns the task on the current runtime, starting from `lease`.
    #[must_use]
    pub fn spawn(api: Arc<dyn TransitApi>, lease: TokenLease) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (renewed_tx, renewed) = watch::channel(0);
        tracing::info!(lease_secs = lease.lease_duration.as_secs(), "transit token renewer started");
        let handle = tokio::spawn(run(api, lease, shutdown_rx, renewed_tx));
        Self { shutdown, renewed, handle }
    }

    /// Number of successful renewals so far.
    #[must_use]
    pub fn renewals(&self) -> u64 {
        *self.renewed.borrow()
    }

    /// Returns a receiver notified after every renewal.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.renewed.clone()
    }

    /// Returns true once the task has exited on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the task to stop and waits for it to exit.
    pub async fn stop(self) {
        // Fails only if the task already exited.
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            tracing::warn!(error = %err, "transit token renewer panicked");
        }
    }
}

fn renew_after(lease: TokenLease) -> Option<Duration> {
    if !lease.renewable || lease.lease_duration.is_zero() {
        return None;
    }
    // Divide first: a server may grant a lease near `Duration::MAX`.
    Some(lease.lease_duration / 3 * 2)
}

async fn run(
    api: Arc<dyn TransitApi>,
    mut lease: TokenLease,
    mut shutdown: watch::Receiver<bool>,
    renewed: watch::Sender<u64>,
) {
    loop {
        let Some(wait) = renew_after(lease) else {
            tracing::info!("transit token is not renewable, renewer exiting");
            return;
        };
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                tracing::info!("transit token renewer stopped");
                return;
            }
            () = tokio::time::sleep(wait) => {}
        }

        match api.renew_self().await {
            Ok(next) => {
                tracing::trace!(lease_secs = next.lease_duration.as_secs(), "transit token renewed");
                renewed.send_modify(|count| *count += 1);
                lease = next;
            }
            Err(err) => {
                tracing::warn!(error = %err, "transit token renewal failed, renewer exiting");
                return;
            }
        }
    }
}
