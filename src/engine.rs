//! The single-task-at-a-time engine driving the transport through the
//! connect → discover → resolve → operate pipeline.
//!
//! All engine state lives in one owner task. Callers submit work through an
//! [`EngineHandle`]; the transport reports completions as typed
//! [`TransportEvent`]s on a channel. Each event re-enters the same step
//! routine, which checks its preconditions in fixed order and issues the
//! next unmet one, so duplicate or late callbacks re-check instead of
//! assuming progress. Every terminal transition, whether success, failure,
//! timeout or cancellation, runs the one cleanup path that closes the link
//! and disarms the task timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::history::{Accepted, HistoryAccumulator};
use crate::model::ResultSink;
use crate::task::{TaskError, TaskKind};
use crate::transport::{
    decode_sint16_le, CharacteristicHandle, ConnectionEvent, DeviceHandle, DiscoveryEvent,
    ReadEvent, SubscribeEvent, Transport, TransportEvent,
};
use crate::uuid;

/// How long a task may run before it is aborted.
pub const TASK_TIMEOUT: Duration = Duration::from_millis(15_000);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub task_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout: TASK_TIMEOUT,
        }
    }
}

/// The step the active task is currently suspended on. Service and
/// characteristic resolution are synchronous lookups and need no step of
/// their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AwaitingDevice,
    AwaitingRadioEnable,
    Connecting,
    DiscoveringServices,
    Operating,
}

struct ActiveTask {
    kind: TaskKind,
    step: Step,
    accumulator: Option<HistoryAccumulator>,
    deadline: Instant,
}

enum Command {
    Request(TaskKind),
    Cancel,
}

/// Cloneable caller-side handle to a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Ask the engine to run a task. Fire-and-forget: the request is dropped,
    /// not queued, if a task is already active. Results arrive through the
    /// engine's result sink.
    pub fn request_task(&self, kind: TaskKind) {
        let _ = self.commands.send(Command::Request(kind));
    }

    /// Abort the active task, if any, with [`TaskError::Cancelled`].
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }
}

/// The task engine. Owns the transport, the result sink and all session
/// state; run it to completion with [`Engine::run`].
pub struct Engine<T: Transport, S: ResultSink> {
    transport: T,
    sink: S,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    config: EngineConfig,

    // Session state. The device identity persists across tasks; everything
    // else is torn down by cleanup at every terminal transition.
    device: Option<DeviceHandle>,
    link_open: bool,
    services_discovered: bool,
    characteristic: Option<CharacteristicHandle>,

    active: Option<ActiveTask>,
}

impl<T: Transport, S: ResultSink> Engine<T, S> {
    /// Create an engine consuming transport completions from `events`.
    /// The transport must have been constructed with the sending half of
    /// that channel.
    pub fn new(
        transport: T,
        sink: S,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: EngineConfig,
    ) -> (Self, EngineHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let engine = Self {
            transport,
            sink,
            events,
            commands,
            config,
            device: None,
            link_open: false,
            services_discovered: false,
            characteristic: None,
            active: None,
        };
        (engine, EngineHandle { commands: command_tx })
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Process commands, transport events and the task timer until all
    /// handles to the engine are gone.
    pub async fn run(mut self) {
        loop {
            let deadline = self.active.as_ref().map(|task| task.deadline);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() => {
                    self.handle_timeout();
                }
            }
        }
        tracing::debug!("engine channel closed, shutting down");
        self.cleanup();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request(kind) => self.start_task(kind),
            Command::Cancel => {
                if self.active.is_some() {
                    self.fail(TaskError::Cancelled);
                }
            }
        }
    }

    /// Admit a task if the engine is idle, arm the timer and take the first
    /// step.
    fn start_task(&mut self, kind: TaskKind) {
        if self.active.is_some() {
            tracing::debug!("task already active, dropping request for '{kind}'");
            return;
        }
        tracing::info!("starting task '{kind}'");
        self.active = Some(ActiveTask {
            kind,
            step: Step::AwaitingDevice,
            accumulator: matches!(kind, TaskKind::History(_)).then(HistoryAccumulator::new),
            deadline: Instant::now() + self.config.task_timeout,
        });
        self.advance();
    }

    /// The re-entrant step routine. Checks preconditions in fixed order and
    /// performs the first unmet one, returning as soon as it has issued a
    /// request to suspend on. Safe to invoke any number of times for the
    /// same state.
    fn advance(&mut self) {
        let Some(kind) = self.active.as_ref().map(|task| task.kind) else {
            return;
        };

        let Some(device) = self.device.clone() else {
            self.set_step(Step::AwaitingDevice);
            self.transport.request_device_selection();
            return;
        };

        if !self.transport.radio_enabled() {
            self.set_step(Step::AwaitingRadioEnable);
            self.transport.request_radio_enable();
            return;
        }

        if !self.link_open {
            self.set_step(Step::Connecting);
            self.transport.connect(&device);
            return;
        }

        if !self.services_discovered {
            self.set_step(Step::DiscoveringServices);
            self.transport.discover_services();
            return;
        }

        let Some(service) = self.transport.service(uuid::service_uuid()) else {
            self.fail(TaskError::ServiceNotFound);
            return;
        };

        let characteristic_uuid = match kind {
            TaskKind::CurrentValue => uuid::current_voltage_uuid(),
            TaskKind::History(bucket) => uuid::history_uuid(bucket),
        };
        let Some(characteristic) = self.transport.characteristic(service, characteristic_uuid)
        else {
            self.fail(TaskError::CharacteristicNotFound);
            return;
        };
        self.characteristic = Some(characteristic);

        self.set_step(Step::Operating);
        match kind {
            TaskKind::CurrentValue => self.transport.read_characteristic(characteristic),
            TaskKind::History(_) => self.transport.enable_indications(characteristic),
        }
    }

    fn set_step(&mut self, step: Step) {
        if let Some(task) = self.active.as_mut() {
            task.step = step;
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        // A lost link aborts the active task no matter which step was in
        // flight. Once the engine is idle it is a late callback and ignored.
        if event == TransportEvent::Connection(ConnectionEvent::Disconnected) {
            self.link_open = false;
            match self.active.as_ref().map(|task| task.step) {
                Some(Step::Connecting) => self.fail(TaskError::ConnectionFailed),
                Some(_) => self.fail(TaskError::Disconnected),
                None => tracing::debug!("disconnect while idle, ignored"),
            }
            return;
        }

        let Some(task) = self.active.as_ref() else {
            tracing::debug!("stale transport event while idle: {event:?}");
            return;
        };
        let step = task.step;

        match (step, event) {
            (Step::AwaitingDevice, TransportEvent::DeviceSelection(Some(device))) => {
                tracing::info!("device selected: {device}");
                self.device = Some(device);
                self.advance();
            }
            (Step::AwaitingDevice, TransportEvent::DeviceSelection(None)) => {
                self.fail(TaskError::DeviceUnavailable);
            }
            (Step::AwaitingRadioEnable, TransportEvent::RadioEnable(true)) => self.advance(),
            (Step::AwaitingRadioEnable, TransportEvent::RadioEnable(false)) => {
                self.fail(TaskError::RadioDisabled);
            }
            (Step::Connecting, TransportEvent::Connection(ConnectionEvent::Connected)) => {
                tracing::info!("connected");
                self.link_open = true;
                self.advance();
            }
            (Step::DiscoveringServices, TransportEvent::Discovery(DiscoveryEvent::Ok)) => {
                self.services_discovered = true;
                self.advance();
            }
            (Step::DiscoveringServices, TransportEvent::Discovery(DiscoveryEvent::Failed)) => {
                self.fail(TaskError::DiscoveryFailed);
            }
            (Step::Operating, TransportEvent::Read(ReadEvent::Value(data))) => {
                self.handle_read(&data);
            }
            (Step::Operating, TransportEvent::Read(ReadEvent::Failed)) => {
                self.fail(TaskError::ReadFailed);
            }
            (Step::Operating, TransportEvent::Subscribe(SubscribeEvent::Ok)) => {
                // Indications follow on their own; nothing to issue.
            }
            (Step::Operating, TransportEvent::Subscribe(SubscribeEvent::Failed)) => {
                self.fail(TaskError::SubscribeFailed);
            }
            (Step::Operating, TransportEvent::Indication(data)) => {
                self.handle_indication(&data);
            }
            (step, event) => {
                tracing::debug!("stale transport event at step {step:?}: {event:?}");
            }
        }
    }

    fn handle_read(&mut self, data: &[u8]) {
        if self.active.as_ref().map(|task| task.kind) != Some(TaskKind::CurrentValue) {
            tracing::debug!("read completion outside a read task, dropped");
            return;
        }
        match decode_sint16_le(data) {
            Some(value) => {
                tracing::info!("current voltage: {value} mV");
                self.sink.publish_current_value(value);
                self.complete();
            }
            None => {
                tracing::warn!("malformed read payload 0x{}", hex::encode(data));
                self.fail(TaskError::ReadFailed);
            }
        }
    }

    fn handle_indication(&mut self, data: &[u8]) {
        let Some(task) = self.active.as_mut() else {
            return;
        };
        let TaskKind::History(bucket) = task.kind else {
            tracing::debug!("indication outside a history task, dropped");
            return;
        };
        let Some(value) = decode_sint16_le(data) else {
            tracing::warn!("malformed indication payload 0x{}, dropped", hex::encode(data));
            return;
        };
        let Some(accumulator) = task.accumulator.as_mut() else {
            return;
        };
        match accumulator.accept(value) {
            Accepted::Value { received } => {
                tracing::debug!("history value {value} mV ({received} so far)");
                self.sink.history_progress(received);
            }
            Accepted::Complete => {
                let values = self
                    .active
                    .as_mut()
                    .and_then(|task| task.accumulator.take())
                    .map(HistoryAccumulator::into_values)
                    .unwrap_or_default();
                tracing::info!("{bucket} history complete, {} values", values.len());
                self.sink.publish_history(bucket, values);
                self.complete();
            }
        }
    }

    fn handle_timeout(&mut self) {
        if self.active.is_some() {
            self.fail(TaskError::Timeout);
        }
    }

    fn complete(&mut self) {
        if let Some(task) = self.active.as_ref() {
            tracing::info!("task '{}' complete", task.kind);
        }
        self.cleanup();
    }

    fn fail(&mut self, error: TaskError) {
        if let Some(kind) = self.active.as_ref().map(|task| task.kind) {
            tracing::warn!("task '{kind}' aborted: {error}");
            self.sink.task_failed(kind, error);
        }
        self.cleanup();
    }

    /// The single terminal path. Drops the active task (which disarms the
    /// timer and discards any partial history), resets the session state and
    /// closes the transport. Idempotent: running it with no task active and
    /// no link open is a no-op apart from the close call.
    fn cleanup(&mut self) {
        self.active = None;
        self.services_discovered = false;
        self.characteristic = None;
        self.link_open = false;
        self.transport.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::HistoryBucket;
    use crate::transport::ServiceHandle;
    use bluest::Uuid;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        SelectDevice,
        EnableRadio,
        Connect,
        Discover,
        Read,
        Subscribe,
    }

    #[derive(Debug, Default)]
    struct MockState {
        radio_enabled: bool,
        has_service: bool,
        has_characteristic: bool,
        calls: Vec<Call>,
        closes: usize,
    }

    /// Records the requests the engine issues; the test script plays the
    /// platform by injecting completion events directly.
    #[derive(Clone, Default)]
    struct MockTransport(Arc<Mutex<MockState>>);

    impl MockTransport {
        /// Radio on, service and characteristic present.
        fn online() -> Self {
            let mock = Self::default();
            {
                let mut state = mock.0.lock().unwrap();
                state.radio_enabled = true;
                state.has_service = true;
                state.has_characteristic = true;
            }
            mock
        }

        fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().calls.clone()
        }

        fn closes(&self) -> usize {
            self.0.lock().unwrap().closes
        }

        fn set_radio_enabled(&self, enabled: bool) {
            self.0.lock().unwrap().radio_enabled = enabled;
        }
    }

    impl Transport for MockTransport {
        fn request_device_selection(&mut self) {
            self.0.lock().unwrap().calls.push(Call::SelectDevice);
        }

        fn request_radio_enable(&mut self) {
            self.0.lock().unwrap().calls.push(Call::EnableRadio);
        }

        fn radio_enabled(&self) -> bool {
            self.0.lock().unwrap().radio_enabled
        }

        fn connect(&mut self, _device: &DeviceHandle) {
            self.0.lock().unwrap().calls.push(Call::Connect);
        }

        fn discover_services(&mut self) {
            self.0.lock().unwrap().calls.push(Call::Discover);
        }

        fn service(&self, _uuid: Uuid) -> Option<ServiceHandle> {
            self.0.lock().unwrap().has_service.then_some(ServiceHandle(0))
        }

        fn characteristic(
            &self,
            _service: ServiceHandle,
            _uuid: Uuid,
        ) -> Option<CharacteristicHandle> {
            self.0
                .lock()
                .unwrap()
                .has_characteristic
                .then_some(CharacteristicHandle(0))
        }

        fn read_characteristic(&mut self, _characteristic: CharacteristicHandle) {
            self.0.lock().unwrap().calls.push(Call::Read);
        }

        fn enable_indications(&mut self, _characteristic: CharacteristicHandle) {
            self.0.lock().unwrap().calls.push(Call::Subscribe);
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    #[derive(Debug, Default)]
    struct SinkState {
        current: Option<i16>,
        histories: Vec<(HistoryBucket, Vec<i16>)>,
        progress: Vec<usize>,
        failures: Vec<(TaskKind, TaskError)>,
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<SinkState>>);

    impl ResultSink for RecordingSink {
        fn publish_current_value(&mut self, millivolts: i16) {
            self.0.lock().unwrap().current = Some(millivolts);
        }

        fn publish_history(&mut self, bucket: HistoryBucket, values: Vec<i16>) {
            self.0.lock().unwrap().histories.push((bucket, values));
        }

        fn history_progress(&mut self, received: usize) {
            self.0.lock().unwrap().progress.push(received);
        }

        fn task_failed(&mut self, kind: TaskKind, error: TaskError) {
            self.0.lock().unwrap().failures.push((kind, error));
        }
    }

    fn engine_with(
        transport: MockTransport,
        sink: RecordingSink,
    ) -> Engine<MockTransport, RecordingSink> {
        let (_event_tx, events) = mpsc::unbounded_channel();
        let (mut engine, _handle) = Engine::new(transport, sink, events, EngineConfig::default());
        engine.device = Some(DeviceHandle("monitor".into()));
        engine
    }

    fn le(value: i16) -> Vec<u8> {
        value.to_le_bytes().to_vec()
    }

    /// Drive a freshly requested task to the operating step.
    fn run_to_operating(engine: &mut Engine<MockTransport, RecordingSink>, kind: TaskKind) {
        engine.handle_command(Command::Request(kind));
        engine.handle_transport_event(TransportEvent::Connection(ConnectionEvent::Connected));
        engine.handle_transport_event(TransportEvent::Discovery(DiscoveryEvent::Ok));
    }

    fn assert_cleaned_up(engine: &Engine<MockTransport, RecordingSink>) {
        assert!(engine.is_idle());
        assert!(!engine.link_open);
        assert!(!engine.services_discovered);
        assert_eq!(engine.characteristic, None);
    }

    #[test]
    fn test_current_value_happy_path() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport.clone(), sink.clone());

        run_to_operating(&mut engine, TaskKind::CurrentValue);
        assert_eq!(transport.calls(), vec![Call::Connect, Call::Discover, Call::Read]);

        engine.handle_transport_event(TransportEvent::Read(ReadEvent::Value(le(-50))));

        let state = sink.0.lock().unwrap();
        assert_eq!(state.current, Some(-50));
        assert!(state.failures.is_empty());
        drop(state);
        assert_eq!(transport.closes(), 1);
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_second_request_while_busy_is_dropped() {
        let transport = MockTransport::online();
        let mut engine = engine_with(transport.clone(), RecordingSink::default());

        engine.handle_command(Command::Request(TaskKind::CurrentValue));
        let calls_before = transport.calls();

        engine.handle_command(Command::Request(TaskKind::History(HistoryBucket::Day)));

        assert_eq!(transport.calls(), calls_before);
        assert_eq!(
            engine.active.as_ref().map(|task| task.kind),
            Some(TaskKind::CurrentValue)
        );
    }

    #[test]
    fn test_prerequisites_run_in_order() {
        let transport = MockTransport::online();
        transport.set_radio_enabled(false);
        let sink = RecordingSink::default();
        let (_event_tx, events) = mpsc::unbounded_channel();
        let (mut engine, _handle) =
            Engine::new(transport.clone(), sink, events, EngineConfig::default());

        // No device selected yet: the engine must ask for one first.
        engine.handle_command(Command::Request(TaskKind::CurrentValue));
        assert_eq!(transport.calls(), vec![Call::SelectDevice]);

        engine.handle_transport_event(TransportEvent::DeviceSelection(Some(DeviceHandle(
            "monitor".into(),
        ))));
        assert_eq!(transport.calls(), vec![Call::SelectDevice, Call::EnableRadio]);

        transport.set_radio_enabled(true);
        engine.handle_transport_event(TransportEvent::RadioEnable(true));
        assert_eq!(
            transport.calls(),
            vec![Call::SelectDevice, Call::EnableRadio, Call::Connect]
        );
    }

    #[test]
    fn test_device_selection_declined() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let (_event_tx, events) = mpsc::unbounded_channel();
        let (mut engine, _handle) =
            Engine::new(transport.clone(), sink.clone(), events, EngineConfig::default());

        engine.handle_command(Command::Request(TaskKind::CurrentValue));
        engine.handle_transport_event(TransportEvent::DeviceSelection(None));

        assert_eq!(
            sink.0.lock().unwrap().failures,
            vec![(TaskKind::CurrentValue, TaskError::DeviceUnavailable)]
        );
        assert_eq!(transport.closes(), 1);
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_radio_enable_declined() {
        let transport = MockTransport::online();
        transport.set_radio_enabled(false);
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        engine.handle_command(Command::Request(TaskKind::CurrentValue));
        engine.handle_transport_event(TransportEvent::RadioEnable(false));

        assert_eq!(
            sink.0.lock().unwrap().failures,
            vec![(TaskKind::CurrentValue, TaskError::RadioDisabled)]
        );
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_duplicate_connected_does_not_rerun_discovery() {
        let transport = MockTransport::online();
        let mut engine = engine_with(transport.clone(), RecordingSink::default());

        engine.handle_command(Command::Request(TaskKind::CurrentValue));
        engine.handle_transport_event(TransportEvent::Connection(ConnectionEvent::Connected));
        engine.handle_transport_event(TransportEvent::Connection(ConnectionEvent::Connected));

        let discoveries = transport
            .calls()
            .iter()
            .filter(|call| **call == Call::Discover)
            .count();
        assert_eq!(discoveries, 1);
    }

    #[test]
    fn test_connect_failure() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        engine.handle_command(Command::Request(TaskKind::CurrentValue));
        // The platform reports a failed connect attempt as a disconnect.
        engine.handle_transport_event(TransportEvent::Connection(ConnectionEvent::Disconnected));

        assert_eq!(
            sink.0.lock().unwrap().failures,
            vec![(TaskKind::CurrentValue, TaskError::ConnectionFailed)]
        );
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_disconnect_mid_discovery_aborts() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport.clone(), sink.clone());

        engine.handle_command(Command::Request(TaskKind::History(HistoryBucket::Minute)));
        engine.handle_transport_event(TransportEvent::Connection(ConnectionEvent::Connected));
        engine.handle_transport_event(TransportEvent::Connection(ConnectionEvent::Disconnected));

        let state = sink.0.lock().unwrap();
        assert_eq!(
            state.failures,
            vec![(
                TaskKind::History(HistoryBucket::Minute),
                TaskError::Disconnected
            )]
        );
        assert!(state.histories.is_empty());
        drop(state);
        assert_eq!(transport.closes(), 1);
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_discovery_failure() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        engine.handle_command(Command::Request(TaskKind::CurrentValue));
        engine.handle_transport_event(TransportEvent::Connection(ConnectionEvent::Connected));
        engine.handle_transport_event(TransportEvent::Discovery(DiscoveryEvent::Failed));

        assert_eq!(
            sink.0.lock().unwrap().failures,
            vec![(TaskKind::CurrentValue, TaskError::DiscoveryFailed)]
        );
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_service_not_found() {
        let transport = MockTransport::online();
        transport.0.lock().unwrap().has_service = false;
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        run_to_operating(&mut engine, TaskKind::CurrentValue);

        assert_eq!(
            sink.0.lock().unwrap().failures,
            vec![(TaskKind::CurrentValue, TaskError::ServiceNotFound)]
        );
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_characteristic_not_found() {
        let transport = MockTransport::online();
        transport.0.lock().unwrap().has_characteristic = false;
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        run_to_operating(&mut engine, TaskKind::History(HistoryBucket::Hour));

        assert_eq!(
            sink.0.lock().unwrap().failures,
            vec![(
                TaskKind::History(HistoryBucket::Hour),
                TaskError::CharacteristicNotFound
            )]
        );
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_read_failure() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        run_to_operating(&mut engine, TaskKind::CurrentValue);
        engine.handle_transport_event(TransportEvent::Read(ReadEvent::Failed));

        assert_eq!(
            sink.0.lock().unwrap().failures,
            vec![(TaskKind::CurrentValue, TaskError::ReadFailed)]
        );
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_subscribe_failure() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        run_to_operating(&mut engine, TaskKind::History(HistoryBucket::Day));
        engine.handle_transport_event(TransportEvent::Subscribe(SubscribeEvent::Failed));

        assert_eq!(
            sink.0.lock().unwrap().failures,
            vec![(TaskKind::History(HistoryBucket::Day), TaskError::SubscribeFailed)]
        );
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_history_happy_path() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport.clone(), sink.clone());

        run_to_operating(&mut engine, TaskKind::History(HistoryBucket::Minute));
        assert_eq!(
            transport.calls(),
            vec![Call::Connect, Call::Discover, Call::Subscribe]
        );

        engine.handle_transport_event(TransportEvent::Subscribe(SubscribeEvent::Ok));
        for value in [5, 4, 3, -1] {
            engine.handle_transport_event(TransportEvent::Indication(le(value)));
        }

        let state = sink.0.lock().unwrap();
        assert_eq!(
            state.histories,
            vec![(HistoryBucket::Minute, vec![3, 4, 5])]
        );
        assert_eq!(state.progress, vec![1, 2, 3]);
        assert!(state.failures.is_empty());
        drop(state);
        assert_eq!(transport.closes(), 1);
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_empty_history() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        run_to_operating(&mut engine, TaskKind::History(HistoryBucket::Day));
        engine.handle_transport_event(TransportEvent::Indication(le(-1)));

        let state = sink.0.lock().unwrap();
        assert_eq!(state.histories, vec![(HistoryBucket::Day, vec![])]);
        assert!(state.progress.is_empty());
    }

    #[test]
    fn test_history_longer_than_progress_ceiling() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        run_to_operating(&mut engine, TaskKind::History(HistoryBucket::Hour));
        for value in (1..=200).rev() {
            engine.handle_transport_event(TransportEvent::Indication(le(value)));
        }
        engine.handle_transport_event(TransportEvent::Indication(le(-1)));

        let state = sink.0.lock().unwrap();
        let expected: Vec<i16> = (1..=200).collect();
        assert_eq!(state.histories, vec![(HistoryBucket::Hour, expected)]);
        assert_eq!(state.progress.len(), 200);
    }

    #[test]
    fn test_malformed_indication_is_dropped() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        run_to_operating(&mut engine, TaskKind::History(HistoryBucket::Minute));
        engine.handle_transport_event(TransportEvent::Indication(le(7)));
        engine.handle_transport_event(TransportEvent::Indication(vec![0xff]));
        engine.handle_transport_event(TransportEvent::Indication(le(-1)));

        let state = sink.0.lock().unwrap();
        assert_eq!(state.histories, vec![(HistoryBucket::Minute, vec![7])]);
        assert!(state.failures.is_empty());
    }

    #[test]
    fn test_timeout_aborts_and_cleans_up() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport.clone(), sink.clone());

        run_to_operating(&mut engine, TaskKind::CurrentValue);
        engine.handle_timeout();

        let state = sink.0.lock().unwrap();
        assert_eq!(
            state.failures,
            vec![(TaskKind::CurrentValue, TaskError::Timeout)]
        );
        assert_eq!(state.current, None);
        drop(state);
        assert_eq!(transport.closes(), 1);
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_cancel_aborts_active_task() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        run_to_operating(&mut engine, TaskKind::History(HistoryBucket::Minute));
        engine.handle_transport_event(TransportEvent::Indication(le(9)));
        engine.handle_command(Command::Cancel);

        let state = sink.0.lock().unwrap();
        assert_eq!(
            state.failures,
            vec![(
                TaskKind::History(HistoryBucket::Minute),
                TaskError::Cancelled
            )]
        );
        assert!(state.histories.is_empty());
        drop(state);
        assert_cleaned_up(&engine);
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport.clone(), sink.clone());

        engine.handle_command(Command::Cancel);

        assert!(sink.0.lock().unwrap().failures.is_empty());
        assert_eq!(transport.closes(), 0);
    }

    #[test]
    fn test_stale_events_while_idle_are_ignored() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport.clone(), sink.clone());

        engine.handle_transport_event(TransportEvent::Read(ReadEvent::Value(le(5))));
        engine.handle_transport_event(TransportEvent::Indication(le(5)));
        engine.handle_transport_event(TransportEvent::Discovery(DiscoveryEvent::Ok));

        let state = sink.0.lock().unwrap();
        assert_eq!(state.current, None);
        assert!(state.failures.is_empty());
        drop(state);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_disconnect_after_completion_is_noop() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport, sink.clone());

        run_to_operating(&mut engine, TaskKind::History(HistoryBucket::Minute));
        engine.handle_transport_event(TransportEvent::Indication(le(-1)));
        // The terminator won the race; the late disconnect must not raise
        // a second notification.
        engine.handle_transport_event(TransportEvent::Connection(ConnectionEvent::Disconnected));

        let state = sink.0.lock().unwrap();
        assert_eq!(state.histories.len(), 1);
        assert!(state.failures.is_empty());
    }

    #[test]
    fn test_device_persists_across_tasks() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let mut engine = engine_with(transport.clone(), sink.clone());

        run_to_operating(&mut engine, TaskKind::CurrentValue);
        engine.handle_transport_event(TransportEvent::Read(ReadEvent::Value(le(12500))));
        assert!(engine.is_idle());

        // The next task reuses the selected device but reconnects from
        // scratch.
        engine.handle_command(Command::Request(TaskKind::CurrentValue));
        assert!(!transport.calls().contains(&Call::SelectDevice));
        assert_eq!(
            transport.calls().last(),
            Some(&Call::Connect)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_in_run_loop() {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (mut engine, handle) = Engine::new(
            transport.clone(),
            sink.clone(),
            events,
            EngineConfig {
                task_timeout: Duration::from_millis(50),
            },
        );
        engine.device = Some(DeviceHandle("monitor".into()));
        let worker = tokio::spawn(engine.run());

        handle.request_task(TaskKind::CurrentValue);
        // No completion ever arrives; the timer must abort the task.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = sink.0.lock().unwrap();
        assert_eq!(
            state.failures,
            vec![(TaskKind::CurrentValue, TaskError::Timeout)]
        );
        assert_eq!(state.current, None);
        drop(state);
        assert!(transport.closes() >= 1);

        drop(handle);
        drop(event_tx);
        worker.await.unwrap();
    }
}
