//! Step sensors.
//!
//! A [`StepSource`] hands out one stream of session-relative readings per
//! subscription. When the stream ends the session is over; the consumer
//! resubscribes and starts counting from a fresh baseline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StepSourceError;

const READING_BUFFER: usize = 64;

pub trait StepSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Start a new sensor session. Readings are cumulative within the
    /// session and start near zero.
    fn subscribe(&self) -> Result<mpsc::Receiver<i64>, StepSourceError>;
}

/// Which sensor backend to run, chosen at startup from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepSourceKind {
    #[default]
    Simulated,
    Channel,
}

impl StepSourceKind {
    /// Builds the configured source. A channel source also returns the
    /// feeder the host pushes readings through.
    #[must_use]
    pub fn build(self) -> (Arc<dyn StepSource>, Option<StepFeeder>) {
        match self {
            Self::Simulated => (Arc::new(SimulatedStepSource::default()), None),
            Self::Channel => {
                let (source, feeder) = ChannelStepSource::new();
                (Arc::new(source), Some(feeder))
            }
        }
    }
}

#[derive(Debug)]
struct ChannelShared {
    sender: Mutex<Option<mpsc::Sender<i64>>>,
    available: AtomicBool,
}

/// Source fed by the host platform through a [`StepFeeder`].
#[derive(Debug, Clone)]
pub struct ChannelStepSource {
    shared: Arc<ChannelShared>,
}

/// Host-side handle of a [`ChannelStepSource`].
#[derive(Debug, Clone)]
pub struct StepFeeder {
    shared: Arc<ChannelShared>,
}

impl ChannelStepSource {
    #[must_use]
    pub fn new() -> (Self, StepFeeder) {
        let shared = Arc::new(ChannelShared {
            sender: Mutex::new(None),
            available: AtomicBool::new(true),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            StepFeeder { shared },
        )
    }
}

impl StepSource for ChannelStepSource {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<i64>, StepSourceError> {
        if !self.is_available() {
            return Err(StepSourceError::Unavailable(self.name()));
        }
        let (tx, rx) = mpsc::channel(READING_BUFFER);
        // Replacing the sender ends any previous session.
        *self
            .shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }
}

impl StepFeeder {
    /// Deliver one session-relative reading.
    pub fn push(&self, reading: i64) -> Result<(), StepSourceError> {
        let guard = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(StepSourceError::Closed("channel"));
        };
        tx.try_send(reading).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => StepSourceError::Unavailable("channel"),
            mpsc::error::TrySendError::Closed(_) => StepSourceError::Closed("channel"),
        })
    }

    /// The platform ended the sensor session, e.g. the OS killed the
    /// background task.
    pub fn end_session(&self) {
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Release);
        if !available {
            self.end_session();
        }
    }

    /// Whether a consumer currently holds an open session.
    #[must_use]
    pub fn has_subscriber(&self) -> bool {
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// Synthetic walker for demos and the CLI. Emits a cumulative reading every
/// `interval`, pausing every fifth tick.
#[derive(Debug, Clone)]
pub struct SimulatedStepSource {
    pub interval: Duration,
    pub steps_per_tick: i64,
}

impl Default for SimulatedStepSource {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            steps_per_tick: 12,
        }
    }
}

impl StepSource for SimulatedStepSource {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_available(&self) -> bool {
        tokio::runtime::Handle::try_current().is_ok()
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<i64>, StepSourceError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| StepSourceError::Unavailable(self.name()))?;
        let (tx, rx) = mpsc::channel(READING_BUFFER);
        let interval = self.interval;
        let per_tick = self.steps_per_tick;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut reading = 0i64;
            let mut tick = 0u64;
            loop {
                ticker.tick().await;
                tick += 1;
                if tick % 5 == 0 {
                    continue;
                }
                reading += per_tick;
                if tx.send(reading).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feeder_delivers_readings() {
        let (source, feeder) = ChannelStepSource::new();
        assert!(feeder.push(5).is_err(), "no session yet");

        let mut rx = source.subscribe().unwrap();
        assert!(feeder.has_subscriber());
        feeder.push(10).unwrap();
        feeder.push(25).unwrap();
        assert_eq!(rx.recv().await, Some(10));
        assert_eq!(rx.recv().await, Some(25));

        feeder.end_session();
        assert_eq!(rx.recv().await, None);
        assert_eq!(feeder.push(30), Err(StepSourceError::Closed("channel")));
    }

    #[tokio::test]
    async fn test_resubscribe_closes_previous_session() {
        let (source, feeder) = ChannelStepSource::new();
        let mut first = source.subscribe().unwrap();
        let mut second = source.subscribe().unwrap();
        assert_eq!(first.recv().await, None);
        feeder.push(7).unwrap();
        assert_eq!(second.recv().await, Some(7));
    }

    #[test]
    fn test_unavailable_source_refuses_subscription() {
        let (source, feeder) = ChannelStepSource::new();
        feeder.set_available(false);
        assert!(!source.is_available());
        assert_eq!(
            source.subscribe().unwrap_err(),
            StepSourceError::Unavailable("channel")
        );
    }

    #[test]
    fn test_simulated_source_needs_runtime() {
        let source = SimulatedStepSource::default();
        assert!(!source.is_available());
        assert!(source.subscribe().is_err());
    }

    #[tokio::test]
    async fn test_simulated_readings_are_cumulative() {
        let source = SimulatedStepSource {
            interval: Duration::from_millis(5),
            steps_per_tick: 10,
        };
        let mut rx = source.subscribe().unwrap();
        let mut last = 0;
        for _ in 0..6 {
            let reading = rx.recv().await.unwrap();
            assert!(reading > last);
            last = reading;
        }
    }

    #[test]
    fn test_source_kind_from_config() {
        let kind: StepSourceKind = serde_json::from_str("\"channel\"").unwrap();
        assert_eq!(kind, StepSourceKind::Channel);
        let (source, feeder) = kind.build();
        assert_eq!(source.name(), "channel");
        assert!(feeder.is_some());
        assert_eq!(StepSourceKind::default().build().0.name(), "simulated");
    }
}
