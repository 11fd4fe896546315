//! A shutdown gate: counts in-flight work and drains on close.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    active: u64,
}

#[derive(Debug, Default)]
struct GateInner {
    state: Mutex<GateState>,
    drained: Notify,
}

/// Tracks in-flight continuations so shutdown can wait for them.
///
/// Clones share the same gate. Once closed, no new work may enter; close
/// resolves after every guard has dropped. A gate cannot reopen.
#[derive(Debug, Default, Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one unit of in-flight work, or refuses if closed.
    pub fn enter(&self) -> Option<GateGuard> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        state.active += 1;
        Some(GateGuard {
            inner: self.inner.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Closes the gate and waits until all in-flight work has drained.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            if state.active == 0 {
                return;
            }
        }
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            // register before re-checking so a concurrent drain cannot slip
            // between the check and the await
            notified.as_mut().enable();
            if self.inner.state.lock().active == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// In-flight marker; dropping it lets the gate drain.
#[derive(Debug)]
pub struct GateGuard {
    inner: Arc<GateInner>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let remaining = {
            let mut state = self.inner.state.lock();
            state.active -= 1;
            state.active
        };
        if remaining == 0 {
            self.inner.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_waits_for_guards() {
        let gate = Gate::new();
        let guard = gate.enter().unwrap();

        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());
        assert!(gate.is_closed());

        drop(guard);
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_enter_refused_after_close() {
        let gate = Gate::new();
        gate.close().await;
        assert!(gate.enter().is_none());
    }

    #[tokio::test]
    async fn test_close_with_no_work_returns_immediately() {
        let gate = Gate::new();
        gate.close().await;
        assert!(gate.is_closed());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let gate = Gate::new();
        let clone = gate.clone();
        let guard = clone.enter().unwrap();

        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(clone.is_closed());
        assert!(!closer.is_finished());
        drop(guard);
        closer.await.unwrap();
    }
}
