//! Peer liveness monitoring.
//!
//! One monitoring task per watched peer repeatedly issues a bounded liveness
//! probe and sleeps in between. A single probe timeout is retried; sustained
//! unresponsiveness (several consecutive timeouts) or a hard transport error
//! ends the episode. The episode is reported through a oneshot completion
//! signal, so a watcher is notified exactly once and never needs to
//! unregister itself.

use std::future::Future;
use std::time::Duration;

use log::warn;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use crate::peers::LinkError;

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Pause between probes.
    pub probe_interval: Duration,
    /// Upper bound on a single probe.
    pub probe_timeout: Duration,
    /// Consecutive probe timeouts tolerated before the peer counts as down.
    pub max_missed_probes: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(3),
            max_missed_probes: 3,
        }
    }
}

/// Why a probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// No answer in time; retried until the miss budget runs out.
    Timeout,
    /// The connection itself is gone; fatal immediately.
    Transport,
}

impl From<LinkError> for ProbeError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout => ProbeError::Timeout,
            LinkError::Closed => ProbeError::Transport,
        }
    }
}

/// Starts watching a peer. The returned receiver resolves with `peer` exactly
/// once, when the peer is declared down; dropping the receiver cancels
/// nothing but discards the notification.
pub fn watch<T, P, F>(peer: T, config: MonitorConfig, mut probe: P) -> oneshot::Receiver<T>
where
    T: std::fmt::Display + Send + 'static,
    P: FnMut() -> F + Send + 'static,
    F: Future<Output = Result<(), ProbeError>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut missed = 0;
        loop {
            match timeout(config.probe_timeout, probe()).await {
                Ok(Ok(())) => missed = 0,
                Ok(Err(ProbeError::Transport)) => {
                    warn!("{} down: transport failure", peer);
                    break;
                }
                Ok(Err(ProbeError::Timeout)) | Err(_) => {
                    missed += 1;
                    if missed >= config.max_missed_probes {
                        warn!("{} down: {} consecutive probe timeouts", peer, missed);
                        break;
                    }
                }
            }
            sleep(config.probe_interval).await;
        }
        let _ = tx.send(peer);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_missed_probes: u32) -> MonitorConfig {
        MonitorConfig {
            probe_interval: Duration::from_millis(5),
            probe_timeout: Duration::from_millis(50),
            max_missed_probes,
        }
    }

    #[tokio::test]
    async fn transport_error_fires_immediately() {
        let rx = watch("peer-1".to_string(), fast_config(3), || async {
            Err(ProbeError::Transport)
        });
        assert_eq!(rx.await.unwrap(), "peer-1");
    }

    #[tokio::test]
    async fn single_timeout_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe_calls = Arc::clone(&calls);
        let mut rx = watch("peer-2".to_string(), fast_config(3), move || {
            let calls = Arc::clone(&probe_calls);
            async move {
                // One miss, then healthy forever.
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProbeError::Timeout)
                } else {
                    Ok(())
                }
            }
        });

        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(calls.load(Ordering::SeqCst) > 2);
    }

    #[tokio::test]
    async fn sustained_timeouts_fire_once() {
        let rx = watch("peer-3".to_string(), fast_config(2), || async {
            Err(ProbeError::Timeout)
        });
        assert_eq!(rx.await.unwrap(), "peer-3");
    }

    #[tokio::test]
    async fn recovery_resets_the_miss_counter() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe_calls = Arc::clone(&calls);
        // Alternating miss/success never accumulates two misses in a row.
        let mut rx = watch("peer-4".to_string(), fast_config(2), move || {
            let calls = Arc::clone(&probe_calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                    Err(ProbeError::Timeout)
                } else {
                    Ok(())
                }
            }
        });

        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hung_probe_counts_as_timeout() {
        let rx = watch("peer-5".to_string(), fast_config(1), || async {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        assert_eq!(rx.await.unwrap(), "peer-5");
    }
}
