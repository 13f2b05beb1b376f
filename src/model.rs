//! Storage and fan-out for retrieved telemetry.
//!
//! The engine publishes results through the [`ResultSink`] trait.
//! [`ModelSink`] is the provided implementation: it writes into a shared
//! [`DataModel`] and emits a lightweight [`ModelUpdate`] per change so that
//! observers (a UI, a logger) know when to re-read the model. Raw values are
//! stored in millivolts; conversion to volts and the user calibration offset
//! are applied on the consumer side.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::history::MAX_HISTORY_LEN;
use crate::task::{HistoryBucket, TaskError, TaskKind};

/// Receiver of completed task results, owned by the engine.
pub trait ResultSink: Send {
    /// The current voltage in millivolts was retrieved.
    fn publish_current_value(&mut self, millivolts: i16);

    /// A history transfer completed; `values` are in chronological order.
    fn publish_history(&mut self, bucket: HistoryBucket, values: Vec<i16>);

    /// A history transfer has collected `received` values so far.
    fn history_progress(&mut self, received: usize);

    /// The task ended in an error. Called exactly once per failed task.
    fn task_failed(&mut self, kind: TaskKind, error: TaskError);
}

/// Change notifications emitted by [`ModelSink`]. Deliberately payload-free
/// apart from scalars: observers read the data out of the shared model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelUpdate {
    CurrentValue,
    History(HistoryBucket),
    /// Running count of a history transfer, for a progress indicator scaled
    /// to [`MAX_HISTORY_LEN`]. The count may exceed the ceiling; only the
    /// displayed ratio saturates.
    Progress { received: usize },
    TaskFailed { kind: TaskKind, error: TaskError },
}

/// The latest data retrieved from the monitor. `None` means never retrieved.
#[derive(Debug, Default)]
pub struct DataModel {
    current_voltage_mv: Option<i16>,
    minutely_history: Option<Vec<i16>>,
    hourly_history: Option<Vec<i16>>,
    daily_history: Option<Vec<i16>>,
}

impl DataModel {
    /// The current voltage in millivolts, if ever retrieved.
    pub fn current_voltage_mv(&self) -> Option<i16> {
        self.current_voltage_mv
    }

    /// The current voltage in volts with the user calibration offset applied.
    pub fn current_voltage_v(&self, calibration_offset_v: f64) -> Option<f64> {
        self.current_voltage_mv
            .map(|mv| f64::from(mv) / 1000.0 + calibration_offset_v)
    }

    /// The latest retrieved history for the bucket, oldest value first.
    pub fn history(&self, bucket: HistoryBucket) -> Option<&[i16]> {
        let history = match bucket {
            HistoryBucket::Minute => &self.minutely_history,
            HistoryBucket::Hour => &self.hourly_history,
            HistoryBucket::Day => &self.daily_history,
        };
        history.as_deref()
    }

    fn set_history(&mut self, bucket: HistoryBucket, values: Vec<i16>) {
        let slot = match bucket {
            HistoryBucket::Minute => &mut self.minutely_history,
            HistoryBucket::Hour => &mut self.hourly_history,
            HistoryBucket::Day => &mut self.daily_history,
        };
        *slot = Some(values);
    }
}

/// A [`ResultSink`] writing into a shared [`DataModel`] and notifying
/// observers through an update channel.
pub struct ModelSink {
    model: Arc<Mutex<DataModel>>,
    updates: mpsc::UnboundedSender<ModelUpdate>,
}

impl ModelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ModelUpdate>) {
        let (updates, update_rx) = mpsc::unbounded_channel();
        let sink = Self {
            model: Arc::new(Mutex::new(DataModel::default())),
            updates,
        };
        (sink, update_rx)
    }

    /// The model this sink writes into.
    pub fn model(&self) -> Arc<Mutex<DataModel>> {
        Arc::clone(&self.model)
    }

    fn notify(&self, update: ModelUpdate) {
        // Observers may have gone away; results are still stored.
        let _ = self.updates.send(update);
    }
}

impl ResultSink for ModelSink {
    fn publish_current_value(&mut self, millivolts: i16) {
        self.model.lock().unwrap().current_voltage_mv = Some(millivolts);
        self.notify(ModelUpdate::CurrentValue);
    }

    fn publish_history(&mut self, bucket: HistoryBucket, values: Vec<i16>) {
        self.model.lock().unwrap().set_history(bucket, values);
        self.notify(ModelUpdate::History(bucket));
    }

    fn history_progress(&mut self, received: usize) {
        self.notify(ModelUpdate::Progress { received });
    }

    fn task_failed(&mut self, kind: TaskKind, error: TaskError) {
        tracing::warn!("task '{kind}' failed: {error}");
        self.notify(ModelUpdate::TaskFailed { kind, error });
    }
}

/// Ratio of a progress count against the nominal history length, saturating
/// at 1.0 for transfers longer than [`MAX_HISTORY_LEN`].
pub fn progress_ratio(received: usize) -> f64 {
    (received as f64 / MAX_HISTORY_LEN as f64).min(1.0)
}
