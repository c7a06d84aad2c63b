//! Keyed, observable job-state store.
//!
//! One entry per job id: the [`JobState`] the monitor maintains and the
//! newest-first update history. Observers either watch one key
//! ([`JobStore::observe`]) or follow every mutation in order
//! ([`JobStore::changes`]). Notifications go out inside the mutation's
//! critical section, so their relative order always matches mutation order.

use std::collections::HashMap;

use parking_lot::Mutex;
use proplens_core::{JobError, JobRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::debug;

const CHANGE_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Per-job subscription connection state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not subscribed.
    #[default]
    Disconnected,
    /// Subscription requested, no update yet.
    Connecting,
    /// Updates are flowing.
    Connected,
    /// The subscription failed.
    Error,
}

impl ConnectionState {
    /// Whether `self → next` is a legal move.
    ///
    /// Forward: `disconnected → connecting → {connected | error}`, then
    /// `connected → error` and `error → connecting` for a reconnect. Going
    /// back to `disconnected` is always allowed (explicit disconnect).
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Error};
        self == next
            || matches!(
                (self, next),
                (_, Disconnected)
                    | (Disconnected | Error, Connecting)
                    | (Connecting, Connected | Error)
                    | (Connected, Error)
            )
    }
}

/// What observers see for one job.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    /// Latest record.
    pub result: Option<JobRecord>,
    /// Finalized error, if any.
    pub error: Option<JobError>,
    /// Whether the job is still in flight.
    pub loading: bool,
    /// Subscription connection state.
    pub connection_state: ConnectionState,
    /// Reconnect attempts since the last healthy subscription.
    pub reconnect_attempts: u32,
}

/// Partial update merged into a [`JobState`]. `None` leaves a field as is.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobStatePatch {
    /// New latest record.
    pub result: Option<JobRecord>,
    /// `Some(None)` clears the error.
    pub error: Option<Option<JobError>>,
    /// New loading flag.
    pub loading: Option<bool>,
    /// New connection state.
    pub connection_state: Option<ConnectionState>,
    /// New reconnect counter.
    pub reconnect_attempts: Option<u32>,
}

impl JobStatePatch {
    /// Merge into `state`.
    pub fn apply(self, state: &mut JobState) {
        if let Some(result) = self.result {
            state.result = Some(result);
        }
        if let Some(error) = self.error {
            state.error = error;
        }
        if let Some(loading) = self.loading {
            state.loading = loading;
        }
        if let Some(connection_state) = self.connection_state {
            state.connection_state = connection_state;
        }
        if let Some(attempts) = self.reconnect_attempts {
            state.reconnect_attempts = attempts;
        }
    }
}

/// State plus newest-first history.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    /// Current state.
    pub state: JobState,
    /// Updates, newest first.
    pub history: Vec<JobRecord>,
}

/// A mutation, in the order it happened.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreChange {
    /// State replaced wholesale.
    Replaced {
        /// Job id.
        job_id: String,
    },
    /// State patched.
    Patched {
        /// Job id.
        job_id: String,
    },
    /// A record was prepended to the history.
    HistoryAppended {
        /// Job id.
        job_id: String,
        /// The new record.
        record: JobRecord,
    },
    /// Entry moved to a new key.
    Rekeyed {
        /// Old key.
        from: String,
        /// New key.
        to: String,
    },
    /// Entry removed.
    Deleted {
        /// Job id.
        job_id: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

type Slot = watch::Sender<Option<JobSnapshot>>;

/// Keyed job-state map. Share it behind an `Arc`.
pub struct JobStore {
    slots: Mutex<HashMap<String, Slot>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    /// Empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            slots: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }

    fn slot<'a>(slots: &'a mut HashMap<String, Slot>, job_id: &str) -> &'a Slot {
        slots
            .entry(job_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
    }

    /// Replace the state, keeping history.
    pub fn replace(&self, job_id: &str, state: JobState) {
        let mut slots = self.slots.lock();
        Self::slot(&mut slots, job_id).send_modify(|snapshot| {
            snapshot.get_or_insert_with(JobSnapshot::default).state = state;
        });
        self.notify(StoreChange::Replaced {
            job_id: job_id.to_string(),
        });
    }

    /// Merge a partial update, creating the entry if needed.
    pub fn patch(&self, job_id: &str, patch: JobStatePatch) {
        let mut slots = self.slots.lock();
        Self::slot(&mut slots, job_id).send_modify(|snapshot| {
            patch.apply(&mut snapshot.get_or_insert_with(JobSnapshot::default).state);
        });
        self.notify(StoreChange::Patched {
            job_id: job_id.to_string(),
        });
    }

    /// Prepend a record unless one with the same `(id, updatedAt)` is
    /// already there. Records without `updatedAt` are always appended.
    ///
    /// Returns whether the record was added.
    pub fn append_history(&self, job_id: &str, record: JobRecord) -> bool {
        let mut slots = self.slots.lock();
        let added = Self::slot(&mut slots, job_id).send_if_modified(|snapshot| {
            let snapshot = snapshot.get_or_insert_with(JobSnapshot::default);
            let duplicate = record.updated_at.is_some()
                && snapshot
                    .history
                    .iter()
                    .any(|seen| seen.id == record.id && seen.updated_at == record.updated_at);
            if duplicate {
                return false;
            }
            snapshot.history.insert(0, record.clone());
            true
        });
        if added {
            self.notify(StoreChange::HistoryAppended {
                job_id: job_id.to_string(),
                record,
            });
        } else {
            debug!(job_id, "duplicate update skipped");
        }
        added
    }

    /// Remove an entry. Observers see `None`, then the channel closes.
    pub fn delete(&self, job_id: &str) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.remove(job_id) else {
            return false;
        };
        let existed = slot.send_replace(None).is_some();
        self.notify(StoreChange::Deleted {
            job_id: job_id.to_string(),
        });
        existed
    }

    /// Move an entry to a new key (placeholder → real job id). Whatever the
    /// new key already held is overwritten.
    pub fn rekey(&self, from: &str, to: &str) -> bool {
        let mut slots = self.slots.lock();
        let Some(snapshot) = slots.remove(from).and_then(|slot| slot.send_replace(None)) else {
            return false;
        };
        let _ = Self::slot(&mut slots, to).send_replace(Some(snapshot));
        self.notify(StoreChange::Rekeyed {
            from: from.to_string(),
            to: to.to_string(),
        });
        true
    }

    /// Current snapshot.
    pub fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        self.slots
            .lock()
            .get(job_id)
            .and_then(|slot| slot.borrow().clone())
    }

    /// Current state.
    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.get(job_id).map(|snapshot| snapshot.state)
    }

    /// Current history, newest first.
    pub fn history(&self, job_id: &str) -> Vec<JobRecord> {
        self.get(job_id)
            .map(|snapshot| snapshot.history)
            .unwrap_or_default()
    }

    /// Watch one key. Works before the key exists.
    ///
    /// Observing a missing key reserves an empty slot for it. Empty slots
    /// nobody watches any more are dropped on the next call.
    pub fn observe(&self, job_id: &str) -> watch::Receiver<Option<JobSnapshot>> {
        let mut slots = self.slots.lock();
        Self::prune_unobserved(&mut slots);
        Self::slot(&mut slots, job_id).subscribe()
    }

    fn prune_unobserved(slots: &mut HashMap<String, Slot>) {
        let before = slots.len();
        slots.retain(|_, slot| slot.borrow().is_some() || slot.receiver_count() > 0);
        let pruned = before - slots.len();
        if pruned > 0 {
            debug!(pruned, "dropped unobserved empty slots");
        }
    }

    /// Every mutation from now on.
    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Keys with data, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.borrow().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
