//! Retrieve current and historic battery voltage from a BLE-V-Monitor device
//! over Bluetooth Low Energy.
//!
//! The monitor exposes one GATT service carrying four characteristics: the
//! instantaneous battery voltage (a little-endian signed 16 bit millivolt
//! value, read on demand) and three voltage histories at minute, hour and
//! day resolution. A history is transferred as a stop-and-wait stream of
//! indications, one value per message, newest first, terminated by the
//! sentinel value -1.
//!
//! Retrieval is organized as tasks driven by the [`Engine`]: request a task
//! through an [`EngineHandle`] and receive the result through a
//! [`ResultSink`] such as the provided [`ModelSink`]. Only one task runs at
//! a time; requests made while busy are dropped, not queued. Each task
//! selects a device if necessary, connects, discovers services, performs its
//! read or history transfer and tears the connection down again, bounded by
//! a 15 second timeout.
//!
//! # Example
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use voltread::{BluestTransport, Engine, EngineConfig, ModelSink, TaskKind};
//!
//! #[tokio::main]
//! pub async fn main() {
//!     let (event_tx, event_rx) = mpsc::unbounded_channel();
//!     let transport = BluestTransport::new(voltread::ble::DEFAULT_DEVICE_NAME, event_tx);
//!     let (sink, mut updates) = ModelSink::new();
//!     let model = sink.model();
//!     let (engine, handle) = Engine::new(transport, sink, event_rx, EngineConfig::default());
//!     tokio::spawn(engine.run());
//!
//!     handle.request_task(TaskKind::CurrentValue);
//!     let _ = updates.recv().await;
//!     println!("{:?} mV", model.lock().unwrap().current_voltage_mv());
//! }
//! ```

pub mod ble;
pub mod engine;
pub mod history;
pub mod model;
pub mod task;
pub mod transport;
pub mod uuid;

pub use ble::BluestTransport;
pub use engine::{Engine, EngineConfig, EngineHandle, TASK_TIMEOUT};
pub use history::{HistoryAccumulator, HISTORY_TERMINATOR, MAX_HISTORY_LEN};
pub use model::{DataModel, ModelSink, ModelUpdate, ResultSink};
pub use task::{HistoryBucket, TaskError, TaskKind};
pub use transport::{Transport, TransportEvent};
