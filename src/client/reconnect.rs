//! Reconnection with exponential backoff
//!
//! The policy waits `2^retry_count` seconds between attempts and resets after
//! every successful connect. Sessions bound to the connection resume on their
//! own once it is back, so reconnecting is only about the socket.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::net::{Connection, ConnectionEvent};

/// Retry budget and backoff schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_retry_count: u32,
    retry_count: u32,
}

impl ReconnectPolicy {
    pub fn new(max_retry_count: u32) -> Self {
        Self {
            max_retry_count,
            retry_count: 0,
        }
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Connect attempts allowed between two successes
    pub fn max_attempts(&self) -> u32 {
        self.max_retry_count + 1
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    /// Wait before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retry_count >= self.max_retry_count {
            return None;
        }
        let delay = Duration::from_secs(1u64 << self.retry_count.min(32));
        self.retry_count += 1;
        Some(delay)
    }
}

/// Keeps a [`Connection`] open until stopped or out of retries
pub struct Reconnector {
    connection: Connection,
    policy: ReconnectPolicy,
}

impl Reconnector {
    pub fn new(connection: Connection) -> Self {
        let policy = ReconnectPolicy::new(connection.config().max_retry_count);
        Self { connection, policy }
    }

    pub fn with_policy(connection: Connection, policy: ReconnectPolicy) -> Self {
        Self { connection, policy }
    }

    /// Run in a task; the returned handle stops it
    pub fn spawn(self, uri: impl Into<String>) -> ReconnectHandle {
        let uri = uri.into();
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(self.run(uri, stopped));
        ReconnectHandle { stop, task }
    }

    /// Connect to `uri` and reconnect after every failure or drop
    ///
    /// Returns `Ok` once `stop` flips (or its sender is dropped) and
    /// [`Error::RetriesExhausted`] when the budget runs out.
    pub async fn run(mut self, uri: String, mut stop: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *stop.borrow() {
                break;
            }

            let mut events = self.connection.subscribe();
            let opened = tokio::select! {
                result = self.connection.open(&uri) => result,
                _ = stop.changed() => break,
            };

            match opened {
                Ok(()) => {
                    self.policy.reset();
                    tokio::select! {
                        _ = closed(&mut events) => {
                            tracing::info!(uri = %uri, "Connection dropped, reconnecting");
                        }
                        _ = stop.changed() => break,
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        uri = %uri,
                        attempt = self.policy.retry_count() + 1,
                        error = %error,
                        "Connect attempt failed"
                    );
                }
            }

            let Some(delay) = self.policy.next_delay() else {
                let attempts = self.policy.max_attempts();
                tracing::error!(uri = %uri, attempts, "Giving up reconnecting");
                return Err(Error::RetriesExhausted { attempts });
            };
            tracing::debug!(delay = ?delay, retry = self.policy.retry_count(), "Waiting to reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }

        self.connection.close().await;
        Ok(())
    }
}

async fn closed(events: &mut broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Connection events lagged");
            }
        }
    }
}

/// Handle to a spawned [`Reconnector`]; dropping it stops reconnection
pub struct ReconnectHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ReconnectHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop reconnecting, close the connection and return how the task ended
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.join().await
    }

    /// Wait for the task to end on its own
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(()),
        }
    }
}
