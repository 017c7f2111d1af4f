use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use super::ProgressEvent;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("all transports exhausted")]
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Push,
    Fallback,
    Error,
}

/// Preferred low-latency delivery channel (e.g. a WebSocket).
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn send(&self, event: &ProgressEvent) -> Result<(), TransportError>;
}

/// Secondary delivery channel used when the push channel cannot be
/// established (e.g. an SSE stream).
#[async_trait]
pub trait FallbackStream: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn send(&self, event: &ProgressEvent) -> Result<(), TransportError>;
}

/// Reconnect behavior. The two backoff curves intentionally differ:
/// the push channel backs off harder because its failures usually mean
/// the endpoint is down, while the fallback stream retries more eagerly
/// since it is the last resort.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    pub push_base_delay: Duration,
    pub push_backoff_multiplier: f64,
    pub fallback_base_delay: Duration,
    pub fallback_backoff_multiplier: f64,
    pub max_connect_attempts: u32,
    pub allow_fallback: bool,
    pub switch_delay: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            push_base_delay: Duration::from_secs(1),
            push_backoff_multiplier: 2.0,
            fallback_base_delay: Duration::from_secs(1),
            fallback_backoff_multiplier: 1.5,
            max_connect_attempts: 5,
            allow_fallback: true,
            switch_delay: Duration::from_millis(250),
        }
    }
}

/// Delay before retrying after the `attempt`-th failure (1-based).
fn backoff_delay(base: Duration, multiplier: f64, attempt: u32) -> Duration {
    base.mul_f64(multiplier.powi(attempt.saturating_sub(1) as i32))
}

/// Owns channel selection: push first, fallback after the push channel
/// exhausts its connect attempts, `Error` once both are spent.
pub struct TransportManager {
    push: Arc<dyn PushChannel>,
    fallback: Option<Arc<dyn FallbackStream>>,
    policy: TransportPolicy,
    state: Mutex<ChannelState>,
}

impl TransportManager {
    pub fn new(
        push: Arc<dyn PushChannel>,
        fallback: Option<Arc<dyn FallbackStream>>,
        policy: TransportPolicy,
    ) -> Self {
        Self {
            push,
            fallback,
            policy,
            state: Mutex::new(ChannelState::Disconnected),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Establish a channel, preferring push. Every connect failure
    /// waits out its backoff before the next attempt.
    pub async fn connect(&self) -> Result<ChannelState, TransportError> {
        for attempt in 1..=self.policy.max_connect_attempts {
            match self.push.connect().await {
                Ok(()) => {
                    info!(attempt, "Push channel connected");
                    self.set_state(ChannelState::Push);
                    return Ok(ChannelState::Push);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Push channel connect failed");
                    if attempt < self.policy.max_connect_attempts {
                        tokio::time::sleep(backoff_delay(
                            self.policy.push_base_delay,
                            self.policy.push_backoff_multiplier,
                            attempt,
                        ))
                        .await;
                    }
                }
            }
        }

        let Some(fallback) = self
            .fallback
            .as_ref()
            .filter(|_| self.policy.allow_fallback)
        else {
            warn!("Push channel exhausted and no fallback available");
            self.set_state(ChannelState::Error);
            return Err(TransportError::Exhausted);
        };

        tokio::time::sleep(self.policy.switch_delay).await;
        info!("Switching to fallback stream");

        for attempt in 1..=self.policy.max_connect_attempts {
            match fallback.connect().await {
                Ok(()) => {
                    info!(attempt, "Fallback stream connected");
                    self.set_state(ChannelState::Fallback);
                    return Ok(ChannelState::Fallback);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Fallback stream connect failed");
                    if attempt < self.policy.max_connect_attempts {
                        tokio::time::sleep(backoff_delay(
                            self.policy.fallback_base_delay,
                            self.policy.fallback_backoff_multiplier,
                            attempt,
                        ))
                        .await;
                    }
                }
            }
        }

        self.set_state(ChannelState::Error);
        Err(TransportError::Exhausted)
    }

    /// Deliver over whichever channel is active. A send failure drops
    /// the connection back to `Disconnected`; the caller decides
    /// whether to `connect()` again.
    pub async fn send(&self, event: &ProgressEvent) -> Result<(), TransportError> {
        let result = match self.state() {
            ChannelState::Push => self.push.send(event).await,
            ChannelState::Fallback => match &self.fallback {
                Some(fallback) => fallback.send(event).await,
                None => Err(TransportError::NotConnected),
            },
            ChannelState::Disconnected | ChannelState::Error => {
                return Err(TransportError::NotConnected)
            }
        };

        if result.is_err() {
            self.set_state(ChannelState::Disconnected);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Fails the first `failures` connects, succeeds afterwards.
    /// Records when each connect attempt happened.
    struct Scripted {
        failures: usize,
        connects: Mutex<Vec<Instant>>,
        sent: AtomicUsize,
    }

    impl Scripted {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                connects: Mutex::new(Vec::new()),
                sent: AtomicUsize::new(0),
            })
        }

        fn try_connect(&self) -> Result<(), TransportError> {
            let mut connects = self.connects.lock().unwrap();
            connects.push(Instant::now());
            if connects.len() <= self.failures {
                Err(TransportError::Connect("scripted failure".into()))
            } else {
                Ok(())
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let connects = self.connects.lock().unwrap();
            connects.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl PushChannel for Scripted {
        async fn connect(&self) -> Result<(), TransportError> {
            self.try_connect()
        }
        async fn send(&self, _event: &ProgressEvent) -> Result<(), TransportError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl FallbackStream for Scripted {
        async fn connect(&self) -> Result<(), TransportError> {
            self.try_connect()
        }
        async fn send(&self, _event: &ProgressEvent) -> Result<(), TransportError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event() -> ProgressEvent {
        ProgressEvent::JobProgress {
            job_id: "j1".into(),
            session_id: "s1".into(),
            snapshot: super::super::ProgressSnapshot {
                percentage: 50.0,
                current_step: "converting".into(),
                eta_seconds: None,
                updated_at: chrono::Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn push_connects_first_try() {
        let push = Scripted::new(0);
        let manager = TransportManager::new(push.clone(), None, TransportPolicy::default());

        assert_eq!(manager.connect().await.unwrap(), ChannelState::Push);
        manager.send(&event()).await.unwrap();
        assert_eq!(push.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn push_retries_double_the_delay() {
        let push = Scripted::new(2);
        let manager = TransportManager::new(push.clone(), None, TransportPolicy::default());

        assert_eq!(manager.connect().await.unwrap(), ChannelState::Push);
        // Failures at t=0 and t=1s, success at t=3s.
        let gaps = push.gaps();
        assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_takes_over_with_gentler_backoff() {
        let push = Scripted::new(usize::MAX);
        let fallback = Scripted::new(2);
        let policy = TransportPolicy {
            max_connect_attempts: 3,
            ..Default::default()
        };
        let manager = TransportManager::new(push.clone(), Some(fallback.clone()), policy);

        assert_eq!(manager.connect().await.unwrap(), ChannelState::Fallback);
        assert_eq!(push.connects.lock().unwrap().len(), 3);

        // Fallback reconnects at 1.5x, not 2x.
        let gaps = fallback.gaps();
        assert_eq!(
            gaps,
            vec![Duration::from_secs(1), Duration::from_millis(1500)]
        );

        manager.send(&event()).await.unwrap();
        assert_eq!(fallback.sent.load(Ordering::SeqCst), 1);
        assert_eq!(push.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_without_fallback_is_an_error() {
        let push = Scripted::new(usize::MAX);
        let policy = TransportPolicy {
            max_connect_attempts: 2,
            ..Default::default()
        };
        let manager = TransportManager::new(push, None, policy);

        assert!(matches!(
            manager.connect().await,
            Err(TransportError::Exhausted)
        ));
        assert_eq!(manager.state(), ChannelState::Error);
        assert!(matches!(
            manager.send(&event()).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_disallowed_by_policy() {
        let push = Scripted::new(usize::MAX);
        let fallback = Scripted::new(0);
        let policy = TransportPolicy {
            max_connect_attempts: 2,
            allow_fallback: false,
            ..Default::default()
        };
        let manager = TransportManager::new(push, Some(fallback.clone()), policy);

        assert!(manager.connect().await.is_err());
        assert!(fallback.connects.lock().unwrap().is_empty());
    }

    #[test]
    fn backoff_curves() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 2.0, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2.0, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 1.5, 2), Duration::from_millis(1500));
        assert_eq!(backoff_delay(base, 1.5, 3), Duration::from_millis(2250));
    }
}
