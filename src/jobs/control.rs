// src/jobs/control.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Cooperative pause/cancel token threaded through a job's work loop.
///
/// The loop consults it only at its defined suspension points, so cancel and
/// pause take effect within one polling interval rather than preempting a
/// unit mid-flight.
#[derive(Debug, Default)]
pub struct ControlToken {
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl ControlToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Pre-unit suspension point. Sleeps while paused; returns `false` once
    /// cancelled, `true` when the loop may run the next unit.
    pub async fn checkpoint(&self, poll: Duration) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            sleep(poll).await;
        }
    }

    /// Sleeps `total`, waking at least every `poll` to honor cancellation.
    /// Returns `false` if cancelled before the interval elapsed.
    pub async fn interruptible_sleep(&self, total: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep(poll.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn checkpoint_passes_when_running() {
        let token = ControlToken::new();
        assert!(token.checkpoint(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn checkpoint_blocks_while_paused_until_resume() {
        let token = Arc::new(ControlToken::new());
        token.pause();

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.checkpoint(Duration::from_millis(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        token.resume();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn cancel_wins_over_pause() {
        let token = Arc::new(ControlToken::new());
        token.pause();

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.checkpoint(Duration::from_millis(1)).await })
        };
        token.cancel();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn interruptible_sleep_breaks_within_poll_interval() {
        let token = Arc::new(ControlToken::new());
        let started = Instant::now();

        let sleeper = {
            let token = token.clone();
            tokio::spawn(async move {
                token
                    .interruptible_sleep(Duration::from_secs(30), Duration::from_millis(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert!(!sleeper.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
