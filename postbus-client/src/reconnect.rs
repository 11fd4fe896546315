//! Background reconnect with bounded exponential backoff.

use crate::client::Client;
use crate::error::ClientError;
use postbus_core::Gate;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// The backoff ladder, clamped at its maximum rung.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReconnectBackoff {
    #[default]
    None,
    Wait1s,
    Wait3s,
    Wait5s,
    Wait10s,
    Wait20s,
    Wait30s,
    Wait60s,
    Wait300s,
    Wait600s,
    Wait1800s,
}

impl ReconnectBackoff {
    pub fn delay(self) -> Duration {
        let secs = match self {
            ReconnectBackoff::None => 0,
            ReconnectBackoff::Wait1s => 1,
            ReconnectBackoff::Wait3s => 3,
            ReconnectBackoff::Wait5s => 5,
            ReconnectBackoff::Wait10s => 10,
            ReconnectBackoff::Wait20s => 20,
            ReconnectBackoff::Wait30s => 30,
            ReconnectBackoff::Wait60s => 60,
            ReconnectBackoff::Wait300s => 300,
            ReconnectBackoff::Wait600s => 600,
            ReconnectBackoff::Wait1800s => 1800,
        };
        Duration::from_secs(secs)
    }

    /// The next rung; the top of the ladder clamps.
    pub fn next(self) -> Self {
        match self {
            ReconnectBackoff::None => ReconnectBackoff::Wait1s,
            ReconnectBackoff::Wait1s => ReconnectBackoff::Wait3s,
            ReconnectBackoff::Wait3s => ReconnectBackoff::Wait5s,
            ReconnectBackoff::Wait5s => ReconnectBackoff::Wait10s,
            ReconnectBackoff::Wait10s => ReconnectBackoff::Wait20s,
            ReconnectBackoff::Wait20s => ReconnectBackoff::Wait30s,
            ReconnectBackoff::Wait30s => ReconnectBackoff::Wait60s,
            ReconnectBackoff::Wait60s => ReconnectBackoff::Wait300s,
            ReconnectBackoff::Wait300s => ReconnectBackoff::Wait600s,
            ReconnectBackoff::Wait600s => ReconnectBackoff::Wait1800s,
            ReconnectBackoff::Wait1800s => ReconnectBackoff::Wait1800s,
        }
    }
}

/// Decorates a [`Client`] with background retry on connect failure.
///
/// Retries advance the backoff ladder and add 0-100ms of jitter; the first
/// success resets the ladder. All retry activity runs inside a gate: after
/// [`ReconnectClient::stop`] pending retries never start and in-flight
/// ones finish without blocking shutdown.
#[derive(Clone)]
pub struct ReconnectClient {
    inner: Arc<ReconnectInner>,
}

struct ReconnectInner {
    client: Arc<Client>,
    backoff: parking_lot::Mutex<ReconnectBackoff>,
    gate: Gate,
}

impl ReconnectClient {
    pub fn new(client: Client) -> Self {
        Self {
            inner: Arc::new(ReconnectInner {
                client: Arc::new(client),
                backoff: parking_lot::Mutex::new(ReconnectBackoff::None),
                gate: Gate::new(),
            }),
        }
    }

    /// The wrapped client, for sending requests.
    pub fn client(&self) -> Arc<Client> {
        self.inner.client.clone()
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        *self.inner.backoff.lock()
    }

    /// Connects; a no-op when the connection is already valid. On failure,
    /// schedules a background retry and returns the error.
    pub fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send>> {
        let this = self.clone();
        Box::pin(async move { this.connect_inner().await })
    }

    async fn connect_inner(self) -> Result<(), ClientError> {
        if self.inner.client.is_conn_valid() {
            return Ok(());
        }
        let Some(_guard) = self.inner.gate.enter() else {
            return Ok(());
        };

        match self.inner.client.reconnect().await {
            Ok(()) => {
                *self.inner.backoff.lock() = ReconnectBackoff::None;
                Ok(())
            }
            Err(e) => {
                let delay = {
                    let mut backoff = self.inner.backoff.lock();
                    *backoff = backoff.next();
                    backoff.delay()
                } + jitter();
                tracing::info!(
                    addr = %self.inner.client.server_addr(),
                    "connect failed ({}); retrying in {:?}",
                    e,
                    delay
                );
                // the sleep itself stays outside the gate so stop() never
                // waits out a backoff; the retry re-enters (or bails) on wake
                let this = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if this.inner.gate.is_closed() {
                        return;
                    }
                    let _ = this.connect().await;
                });
                Err(e)
            }
        }
    }

    /// Cancels future retries and stops the wrapped client.
    pub async fn stop(&self) {
        self.inner.gate.close().await;
        self.inner.client.stop().await;
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;

    #[test]
    fn test_ladder_is_monotone_and_clamped() {
        let mut backoff = ReconnectBackoff::None;
        let mut previous = backoff.delay();
        for _ in 0..16 {
            backoff = backoff.next();
            assert!(backoff.delay() >= previous);
            previous = backoff.delay();
        }
        assert_eq!(backoff, ReconnectBackoff::Wait1800s);
        assert_eq!(backoff.delay(), Duration::from_secs(1800));
    }

    #[test]
    fn test_ladder_rungs() {
        let expected = [0u64, 1, 3, 5, 10, 20, 30, 60, 300, 600, 1800];
        let mut backoff = ReconnectBackoff::None;
        for secs in expected {
            assert_eq!(backoff.delay(), Duration::from_secs(secs));
            backoff = backoff.next();
        }
    }

    #[tokio::test]
    async fn test_failed_connect_advances_backoff() {
        // nothing listens on this port
        let client = Client::new(
            ClientConfig::new("127.0.0.1:1".parse().unwrap())
                .with_connect_timeout(Duration::from_millis(200)),
        );
        let reconnect = ReconnectClient::new(client);
        assert_eq!(reconnect.backoff(), ReconnectBackoff::None);

        let result = reconnect.connect().await;
        assert!(result.is_err());
        assert_eq!(reconnect.backoff(), ReconnectBackoff::Wait1s);

        reconnect.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_retries() {
        let client = Client::new(
            ClientConfig::new("127.0.0.1:1".parse().unwrap())
                .with_connect_timeout(Duration::from_millis(200)),
        );
        let reconnect = ReconnectClient::new(client);
        let _ = reconnect.connect().await;
        // a retry is sleeping in the background; stop must not wait it out
        tokio::time::timeout(Duration::from_millis(500), reconnect.stop())
            .await
            .expect("stop() must not block on the pending retry");
        assert!(reconnect.inner.gate.is_closed());
    }
}
