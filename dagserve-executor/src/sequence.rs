//! Stateful sequence bookkeeping.
//!
//! Stateful pipelines carry per-sequence memory state between requests. A
//! [`SequenceManager`] owns the sequences of one servable; the
//! [`GlobalSequencesViewer`] registers every manager and sweeps timed-out
//! sequences on a period that follows the smallest registered timeout.

use dagserve_core::error::{PipelineError, Result};
use dagserve_core::tensor::TensorMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Control input value: no sequence control.
pub const NO_CONTROL_INPUT: u32 = 0;
/// Control input value: start a new sequence.
pub const SEQUENCE_START: u32 = 1;
/// Control input value: end the sequence with this request.
pub const SEQUENCE_END: u32 = 2;

/// Default sequence idle timeout.
pub const DEFAULT_SEQUENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// One stateful sequence: its memory state and activity tracking.
#[derive(Debug)]
pub struct Sequence {
    id: u64,
    memory_state: TensorMap,
    last_activity: Instant,
    terminated: bool,
}

impl Sequence {
    fn new(id: u64) -> Self {
        Self {
            id,
            memory_state: TensorMap::new(),
            last_activity: Instant::now(),
            terminated: false,
        }
    }

    /// The sequence id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The memory state carried from the previous request.
    #[must_use]
    pub fn memory_state(&self) -> &TensorMap {
        &self.memory_state
    }

    /// Replace the memory state and refresh the activity timestamp.
    pub fn update_memory_state(&mut self, state: TensorMap) {
        self.memory_state = state;
        self.last_activity = Instant::now();
    }

    /// Whether a SEQUENCE_END request already arrived.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Owns the active sequences of one stateful servable.
pub struct SequenceManager {
    sequences: Mutex<std::collections::HashMap<u64, Sequence>>,
    timeout: Duration,
    max_sequences: u32,
}

impl SequenceManager {
    /// Create a manager with an idle timeout and a sequence-count bound.
    #[must_use]
    pub fn new(timeout: Duration, max_sequences: u32) -> Self {
        Self {
            sequences: Mutex::new(std::collections::HashMap::new()),
            timeout,
            max_sequences,
        }
    }

    /// The idle timeout after which a sequence is swept.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of active sequences.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sequences.lock().len()
    }

    /// Check whether a sequence exists.
    #[must_use]
    pub fn has_sequence(&self, id: u64) -> bool {
        self.sequences.lock().contains_key(&id)
    }

    /// Create a sequence.
    pub fn create_sequence(&self, id: u64) -> Result<()> {
        let mut sequences = self.sequences.lock();
        if sequences.len() >= self.max_sequences as usize {
            return Err(PipelineError::SequenceLimitExceeded {
                limit: self.max_sequences,
            });
        }
        if sequences.contains_key(&id) {
            return Err(PipelineError::SequenceAlreadyExists { sequence: id });
        }
        sequences.insert(id, Sequence::new(id));
        Ok(())
    }

    /// Remove a sequence.
    pub fn remove_sequence(&self, id: u64) -> Result<()> {
        self.sequences
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(PipelineError::SequenceMissing { sequence: id })
    }

    /// Mark a sequence terminated.
    pub fn terminate_sequence(&self, id: u64) -> Result<()> {
        let mut sequences = self.sequences.lock();
        let sequence = sequences
            .get_mut(&id)
            .ok_or(PipelineError::SequenceMissing { sequence: id })?;
        if sequence.terminated {
            return Err(PipelineError::SequenceTerminated { sequence: id });
        }
        sequence.terminated = true;
        Ok(())
    }

    /// Apply one request's control input to the sequence table.
    pub fn process_control_input(&self, id: u64, control: u32) -> Result<()> {
        match control {
            SEQUENCE_START => self.create_sequence(id),
            SEQUENCE_END => self.terminate_sequence(id),
            _ => {
                let mut sequences = self.sequences.lock();
                let sequence = sequences
                    .get_mut(&id)
                    .ok_or(PipelineError::SequenceMissing { sequence: id })?;
                if sequence.terminated {
                    return Err(PipelineError::SequenceTerminated { sequence: id });
                }
                sequence.last_activity = Instant::now();
                Ok(())
            }
        }
    }

    /// Read a copy of a sequence's memory state.
    pub fn memory_state(&self, id: u64) -> Result<TensorMap> {
        let sequences = self.sequences.lock();
        sequences
            .get(&id)
            .map(|sequence| sequence.memory_state().clone())
            .ok_or(PipelineError::SequenceMissing { sequence: id })
    }

    /// Store a sequence's memory state.
    pub fn update_memory_state(&self, id: u64, state: TensorMap) -> Result<()> {
        let mut sequences = self.sequences.lock();
        let sequence = sequences
            .get_mut(&id)
            .ok_or(PipelineError::SequenceMissing { sequence: id })?;
        sequence.update_memory_state(state);
        Ok(())
    }

    /// Drop every sequence idle past the timeout. Returns how many went.
    pub fn remove_timed_out_sequences(&self) -> usize {
        let mut sequences = self.sequences.lock();
        let before = sequences.len();
        sequences.retain(|id, sequence| {
            let keep = sequence.idle_for() < self.timeout;
            if !keep {
                tracing::debug!(sequence = id, "removing timed out sequence");
            }
            keep
        });
        before - sequences.len()
    }
}

/// Registry of every sequence manager in the process, with the periodic
/// timeout sweep.
pub struct GlobalSequencesViewer {
    managers: DashMap<String, Arc<SequenceManager>>,
    sweep_interval: Mutex<Duration>,
    shutdown: Notify,
}

impl Default for GlobalSequencesViewer {
    fn default() -> Self {
        Self {
            managers: DashMap::new(),
            sweep_interval: Mutex::new(DEFAULT_SEQUENCE_TIMEOUT / 2),
            shutdown: Notify::new(),
        }
    }
}

impl GlobalSequencesViewer {
    /// Create an empty viewer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager under a servable id.
    pub fn register_manager(&self, id: impl Into<String>, manager: Arc<SequenceManager>) -> Result<()> {
        let id = id.into();
        if self.managers.contains_key(&id) {
            tracing::debug!(manager = %id, "sequence manager already exists");
            return Err(PipelineError::SequenceAlreadyExists { sequence: 0 });
        }
        self.managers.insert(id, manager);
        self.update_sweep_interval();
        Ok(())
    }

    /// Remove a manager.
    pub fn unregister_manager(&self, id: &str) -> Result<()> {
        if self.managers.remove(id).is_none() {
            return Err(PipelineError::SequenceMissing { sequence: 0 });
        }
        self.update_sweep_interval();
        Ok(())
    }

    /// The current sweep period: half the smallest registered timeout.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        *self.sweep_interval.lock()
    }

    fn update_sweep_interval(&self) {
        let mut interval = DEFAULT_SEQUENCE_TIMEOUT / 2;
        for entry in self.managers.iter() {
            interval = interval.min(entry.value().timeout() / 2);
        }
        *self.sweep_interval.lock() = interval.max(Duration::from_millis(1));
    }

    /// Sweep every registered manager once. Returns how many sequences
    /// were removed.
    pub fn remove_timed_out_sequences(&self) -> usize {
        self.managers
            .iter()
            .map(|entry| entry.value().remove_timed_out_sequences())
            .sum()
    }

    /// Run the sweep loop until [`GlobalSequencesViewer::shutdown`].
    ///
    /// Spawn this on the runtime; the period re-reads the interval every
    /// cycle so newly registered managers take effect.
    pub async fn run_sweeper(self: Arc<Self>) {
        tracing::info!("started sequence timeout watcher");
        loop {
            let interval = self.sweep_interval();
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(interval) => {
                    let removed = self.remove_timed_out_sequences();
                    if removed > 0 {
                        tracing::debug!(removed, "sequence watcher sweep removed sequences");
                    }
                }
            }
        }
        tracing::info!("exited sequence timeout watcher");
    }

    /// Stop a running sweeper.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}
