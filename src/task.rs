use thiserror::Error;

/// The three history resolutions offered by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryBucket {
    Minute,
    Hour,
    Day,
}

impl std::fmt::Display for HistoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryBucket::Minute => write!(f, "minutely"),
            HistoryBucket::Hour => write!(f, "hourly"),
            HistoryBucket::Day => write!(f, "daily"),
        }
    }
}

/// A unit of work for the task engine. At most one task is active at a time;
/// requesting another while one is running is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// One-shot read of the instantaneous battery voltage.
    CurrentValue,
    /// Stop-and-wait indication transfer of one voltage history.
    History(HistoryBucket),
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::CurrentValue => write!(f, "current voltage"),
            TaskKind::History(bucket) => write!(f, "{bucket} history"),
        }
    }
}

/// Why a task ended without delivering its result.
///
/// Every variant is terminal for the task that raised it: the engine runs its
/// cleanup path, reports the error once through the result sink and returns
/// to idle. Whether to retry is the caller's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("no suitable Bluetooth device selected")]
    DeviceUnavailable,
    #[error("Bluetooth radio is disabled")]
    RadioDisabled,
    #[error("failed to connect to the device")]
    ConnectionFailed,
    #[error("connection to the device was lost")]
    Disconnected,
    #[error("GATT service discovery failed")]
    DiscoveryFailed,
    #[error("the device does not offer the voltage monitor service")]
    ServiceNotFound,
    #[error("the required characteristic is not available")]
    CharacteristicNotFound,
    #[error("failed to read the characteristic value")]
    ReadFailed,
    #[error("failed to enable indications")]
    SubscribeFailed,
    #[error("the task timed out")]
    Timeout,
    #[error("the task was cancelled")]
    Cancelled,
}
