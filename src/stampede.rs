//! Per-key single-flight guard against cache stampedes
//!
//! The first caller to miss on a key becomes its leader and recomputes; later
//! callers become followers and wait, bounded by a timeout, for the leader to
//! release the key. Release happens in `Drop`, so it fires on success, on
//! error, on panic and when the leader's future is cancelled.

use crate::key::CacheKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// How followers behave while a leader recomputes
#[derive(Debug, Clone, PartialEq)]
pub struct StampedePolicy {
    /// Upper bound on a follower's wait; zero means followers do not wait
    pub follower_timeout: Duration,

    /// Hand the leader's failure to its followers instead of letting them retry
    pub propagate_leader_failure: bool,
}

impl Default for StampedePolicy {
    fn default() -> Self {
        Self {
            follower_timeout: Duration::from_secs(5),
            propagate_leader_failure: false,
        }
    }
}

/// State published by a leader to its followers
#[derive(Debug, Clone, PartialEq)]
enum Flight {
    Computing,
    Succeeded,
    Failed(String),
    Abandoned,
}

/// Marker held while a key is being recomputed
struct InFlightMarker {
    id: Uuid,
    started_at: Instant,
    state: watch::Sender<Flight>,
}

type MarkerSet = Arc<Mutex<HashMap<CacheKey, InFlightMarker>>>;

fn lock(markers: &MarkerSet) -> MutexGuard<'_, HashMap<CacheKey, InFlightMarker>> {
    // A panic while holding the lock cannot leave the map half-updated
    markers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks which keys currently have a recomputation in flight
#[derive(Clone, Default)]
pub struct StampedeGuard {
    markers: MarkerSet,
}

/// Outcome of [`StampedeGuard::acquire`]
pub enum Acquired {
    /// The caller owns the key and must recompute
    Leader(LeaderGuard),
    /// Another caller is recomputing the key
    Follower(FollowerWait),
}

impl StampedeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for recomputation, or join the recomputation already running
    pub fn acquire(&self, key: &CacheKey) -> Acquired {
        let mut markers = lock(&self.markers);

        if let Some(marker) = markers.get(key) {
            debug!("Joining in-flight recomputation as follower: {}", key);
            return Acquired::Follower(FollowerWait {
                key: key.clone(),
                state: marker.state.subscribe(),
            });
        }

        let id = Uuid::new_v4();
        let (state, _) = watch::channel(Flight::Computing);
        markers.insert(
            key.clone(),
            InFlightMarker {
                id,
                started_at: Instant::now(),
                state,
            },
        );

        debug!("Acquired recomputation lease {} for {}", id, key);
        Acquired::Leader(LeaderGuard {
            key: key.clone(),
            id,
            markers: Arc::clone(&self.markers),
            outcome: Flight::Abandoned,
        })
    }

    /// Whether a recomputation of `key` is currently running
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        lock(&self.markers).contains_key(key)
    }

    /// Number of keys currently being recomputed
    pub fn in_flight_count(&self) -> usize {
        lock(&self.markers).len()
    }
}

/// Ownership of a key's recomputation; releases the key when dropped
pub struct LeaderGuard {
    key: CacheKey,
    id: Uuid,
    markers: MarkerSet,
    outcome: Flight,
}

impl LeaderGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Release the key after a successful recomputation
    pub fn succeed(mut self) {
        self.outcome = Flight::Succeeded;
    }

    /// Release the key after a failed recomputation
    pub fn fail(mut self, message: impl Into<String>) {
        self.outcome = Flight::Failed(message.into());
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        let mut markers = lock(&self.markers);

        let owned = markers.get(&self.key).map(|m| m.id) == Some(self.id);
        if !owned {
            return;
        }

        if let Some(marker) = markers.remove(&self.key) {
            debug!(
                "Released recomputation lease {} for {} after {:?} ({:?})",
                self.id,
                self.key,
                marker.started_at.elapsed(),
                self.outcome
            );
            marker
                .state
                .send_replace(std::mem::replace(&mut self.outcome, Flight::Abandoned));
        }
    }
}

/// What a follower observed while waiting
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The leader stored a fresh value
    Completed,
    /// The leader's recomputation failed
    LeaderFailed(String),
    /// The leader went away without finishing (cancelled or panicked)
    LeaderAbandoned,
    /// The wait bound elapsed first
    TimedOut,
}

/// A follower's handle on the leader's progress
pub struct FollowerWait {
    key: CacheKey,
    state: watch::Receiver<Flight>,
}

impl FollowerWait {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Wait up to `timeout` for the leader to release the key
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        if timeout.is_zero() {
            return WaitOutcome::TimedOut;
        }

        let waited = tokio::time::timeout(
            timeout,
            self.state.wait_for(|flight| *flight != Flight::Computing),
        )
        .await;

        let outcome = match waited {
            Err(_) => WaitOutcome::TimedOut,
            Ok(Err(_)) => WaitOutcome::LeaderAbandoned,
            Ok(Ok(flight)) => match &*flight {
                Flight::Succeeded => WaitOutcome::Completed,
                Flight::Failed(message) => WaitOutcome::LeaderFailed(message.clone()),
                Flight::Abandoned | Flight::Computing => WaitOutcome::LeaderAbandoned,
            },
        };
        outcome
    }
}
