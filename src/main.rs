//! Command line demo: fetch the current battery voltage and the minutely
//! history from a monitor advertising as `BLE_V_Monitor` (or the name given
//! as the first argument) and print them.

use anyhow::anyhow;
use tokio::sync::mpsc;
use voltread::model::progress_ratio;
use voltread::{
    BluestTransport, Engine, EngineConfig, HistoryBucket, ModelSink, ModelUpdate, TaskKind,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let device_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| voltread::ble::DEFAULT_DEVICE_NAME.to_string());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let transport = BluestTransport::new(&device_name, event_tx);
    let (sink, mut updates) = ModelSink::new();
    let model = sink.model();
    let (engine, handle) = Engine::new(transport, sink, event_rx, EngineConfig::default());
    tokio::spawn(engine.run());

    println!("Looking for '{device_name}'...");
    handle.request_task(TaskKind::CurrentValue);

    while let Some(update) = updates.recv().await {
        match update {
            ModelUpdate::CurrentValue => {
                if let Some(volts) = model.lock().unwrap().current_voltage_v(0.0) {
                    println!("Current battery voltage: {volts:.3} V");
                }
                handle.request_task(TaskKind::History(HistoryBucket::Minute));
            }
            ModelUpdate::Progress { received } => {
                println!("Downloading history: {:3.0}%", progress_ratio(received) * 100.0);
            }
            ModelUpdate::History(bucket) => {
                let model = model.lock().unwrap();
                if let Some(history) = model.history(bucket) {
                    println!("{bucket} history, oldest first ({} values):", history.len());
                    for millivolts in history {
                        println!("  {:.3} V", f64::from(*millivolts) / 1000.0);
                    }
                }
                return Ok(());
            }
            ModelUpdate::TaskFailed { kind, error } => {
                return Err(anyhow!("task '{kind}' failed: {error}"));
            }
        }
    }

    Ok(())
}
