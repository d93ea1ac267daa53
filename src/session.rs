//! Session with one CN0503 board.
//!
//! A [`Session`] owns everything a connection needs: the serial [`Transport`], the
//! [`DeviceModel`], the streaming buffers and a dispatcher thread (`cn0503-dispatch`) that
//! feeds every inbound line through the [`Dispatcher`] in arrival order. There is no
//! process-wide state; two sessions on two ports are independent.
//!
//! Commands are validated before anything is queued. A command that fails validation, or
//! that is issued without a link, is reported to the session's [`DiagnosticLog`] and
//! returned as an error. The model only changes when the device echoes a command back.
//!
//! While the device streams, its receive buffer is busy, so every command is sent one
//! character at a time.
//!
//! ## Example
//!
//! ```no_run
//! use cn0503::config::Settings;
//! use cn0503::session::Session;
//!
//! let session = Session::new(Settings::default())?;
//! session.connect("/dev/ttyUSB0")?;
//! session.get_config(false)?;
//! let columns = session.read_data(20, std::time::Duration::from_secs(30))?;
//! println!("ratio 1: {:?}", columns[0]);
//! # Ok::<(), cn0503::error::Cn0503Error>(())
//! ```

use crate::calibration;
use crate::config::Settings;
use crate::diagnostics::DiagnosticLog;
use crate::dispatcher::{DispatchOutcome, Dispatcher, ModelEvent};
use crate::error::{AppResult, Cn0503Error};
use crate::model::channel::{MeasurementType, POLYNOMIAL_LEN};
use crate::model::device::{DeviceModel, DeviceState, Mode, NUM_RATIOS};
use crate::model::stream::{StreamBuffers, StreamSnapshot};
use crate::protocol::command::{
    def_queries, encode_command, encode_def_command, encode_flash_command, encode_raw, frame,
    DefSubcommand, CONTROL_QUERIES, RATMASK_ALL,
};
use crate::protocol::config_file;
use crate::transport::{LinkEvent, SerialConnector, SystemSerial, Transport};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Pause between the two halves of a stop, and between default-ratio writes.
const RESYNC_PAUSE: Duration = Duration::from_millis(100);

/// Time the AFE needs after `IDLE 0` before a baseline read.
const BASELINE_SETTLE: Duration = Duration::from_millis(500);

/// Time the firmware needs to rewrite ratios and LED currents after `CHANNn`.
const MEASUREMENT_TYPE_SETTLE: Duration = Duration::from_secs(1);

const DISPATCH_POLL: Duration = Duration::from_millis(100);
const WAIT_POLL: Duration = Duration::from_millis(10);

/// State shared between the caller's thread and the dispatcher thread.
struct Shared {
    settings: Settings,
    transport: Transport,
    model: Arc<RwLock<DeviceModel>>,
    buffers: Arc<RwLock<StreamBuffers>>,
    diagnostics: DiagnosticLog,
    events: Sender<ModelEvent>,
}

impl Shared {
    /// Record a failure in the diagnostic log and hand the result back.
    fn report<T>(&self, result: AppResult<T>) -> AppResult<T> {
        if let Err(err) = &result {
            self.diagnostics.report(err);
        }
        result
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(Cn0503Error::NotConnected)
        }
    }

    fn settle(&self) {
        thread::sleep(self.settings.protocol.command_settle());
    }

    /// Frame and queue one command.
    fn send_packet(&self, msg: &str, slow: bool) -> AppResult<()> {
        let slow = slow || self.model.read().state == DeviceState::Streaming;
        self.transport.send(&frame(msg), slow)
    }

    fn stop_streaming(&self, idle: bool) -> AppResult<()> {
        let msg = if idle { "IDLE 1" } else { "IDLE 0" };
        // The first IDLE can be lost in the middle of a data line
        for _ in 0..2 {
            self.send_packet(msg, true)?;
            self.settle();
        }
        Ok(())
    }

    fn get_config(&self, apply_default: bool) -> AppResult<()> {
        self.ensure_connected()?;
        info!(apply_default, "Reading device configuration");

        self.stop_streaming(true)?;
        thread::sleep(RESYNC_PAUSE);
        self.stop_streaming(true)?;

        let delay = self.settings.protocol.inter_command_delay();
        for query in CONTROL_QUERIES {
            self.send_packet(query, false)?;
            thread::sleep(delay);
        }

        for index in 0..NUM_RATIOS {
            if apply_default {
                let (expression, subtract) = {
                    let model = self.model.read();
                    let channel = &model.channels[index];
                    (channel.ratio_expression.clone(), channel.subtract_enabled)
                };
                self.send_packet(&encode_def_command("ARAT", index, &expression)?, false)?;
                thread::sleep(RESYNC_PAUSE);
                self.send_packet(
                    &encode_def_command("SUBE", index, &subtract.to_string())?,
                    false,
                )?;
                thread::sleep(RESYNC_PAUSE);
            }
            for query in def_queries(index) {
                self.send_packet(&query, false)?;
                thread::sleep(delay);
            }
        }

        self.send_packet(RATMASK_ALL, false)?;
        let _ = self.events.send(ModelEvent::ModelUpdated);
        Ok(())
    }
}

/// One connection to a CN0503 board and everything known about it.
pub struct Session {
    shared: Arc<Shared>,
    events: Receiver<ModelEvent>,
    running: Arc<AtomicBool>,
    consumer: Option<JoinHandle<()>>,
}

impl Session {
    /// Session over the host's serial ports.
    pub fn new(settings: Settings) -> AppResult<Self> {
        Self::with_connector(settings, Arc::new(SystemSerial))
    }

    /// Session over any [`SerialConnector`], e.g. a [`crate::transport::MockConnector`].
    pub fn with_connector(
        settings: Settings,
        connector: Arc<dyn SerialConnector>,
    ) -> AppResult<Self> {
        settings.validate()?;

        let transport = Transport::new(
            connector,
            settings.protocol.clone(),
            settings.serial.read_timeout(),
        );
        let model = Arc::new(RwLock::new(DeviceModel::new(
            settings.streaming.code_mode_columns,
        )));
        let buffers = Arc::new(RwLock::new(StreamBuffers::new(
            settings.streaming.max_data_points,
        )));
        let diagnostics = DiagnosticLog::new();
        let (events_tx, events_rx) = unbounded();

        let dispatcher = Dispatcher::new(
            model.clone(),
            buffers.clone(),
            events_tx.clone(),
            diagnostics.clone(),
        );
        let inbound = transport.inbound();

        let shared = Arc::new(Shared {
            settings,
            transport,
            model,
            buffers,
            diagnostics,
            events: events_tx,
        });
        let running = Arc::new(AtomicBool::new(true));

        let consumer = {
            let shared = shared.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("cn0503-dispatch".to_string())
                .spawn(move || dispatch_loop(&dispatcher, &inbound, &shared, &running))?
        };

        Ok(Self {
            shared,
            events: events_rx,
            running,
            consumer: Some(consumer),
        })
    }

    /// Settings this session was created with.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    // --- Link ---

    /// Open `port` at the configured baud rate, replacing any current link.
    pub fn connect(&self, port: &str) -> AppResult<()> {
        let baud_rate = self.shared.settings.serial.baud_rate;
        self.shared
            .report(self.shared.transport.connect(port, baud_rate))?;
        self.shared.settle();
        Ok(())
    }

    /// Open the port named in the settings.
    pub fn connect_default(&self) -> AppResult<()> {
        let port = self.shared.settings.serial.port.clone().ok_or_else(|| {
            Cn0503Error::Configuration("No serial port configured".to_string())
        });
        let port = self.shared.report(port)?;
        self.connect(&port)
    }

    /// Close the link. Returns whether one was open.
    pub fn disconnect(&self) -> bool {
        let was_connected = self.shared.transport.disconnect();
        if !was_connected {
            self.shared.diagnostics.note("No serial port to disconnect");
        }
        was_connected
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }

    /// Port of the live link.
    pub fn port(&self) -> Option<String> {
        self.shared.transport.port()
    }

    /// Serial devices present on the host.
    pub fn list_serial_ports(&self) -> AppResult<Vec<String>> {
        self.shared.report(self.shared.transport.scan())
    }

    // --- Encoded commands ---

    fn send_encoded<F>(&self, encode: F) -> AppResult<()>
    where
        F: FnOnce() -> AppResult<String>,
    {
        let result = self
            .shared
            .ensure_connected()
            .and_then(|_| encode())
            .and_then(|msg| self.shared.send_packet(&msg, false));
        self.shared.report(result)?;
        self.shared.settle();
        Ok(())
    }

    /// Send a top-level command, e.g. `("MODE", "ARAT")` or `("DEF2", "RATB 5")`.
    pub fn send_command(&self, name: &str, args: &str) -> AppResult<()> {
        self.send_encoded(|| encode_command(name, args))
    }

    /// Send `DEF<channel_index> <subcommand> <args>`.
    pub fn send_def_command(
        &self,
        subcommand: &str,
        channel_index: usize,
        args: &str,
    ) -> AppResult<()> {
        self.send_encoded(|| encode_def_command(subcommand, channel_index, args))
    }

    /// Send a flash staging command such as `FL_WRITE` or `FL_APPLY`.
    pub fn send_flash_command(&self, name: &str, args: Option<&str>) -> AppResult<()> {
        self.send_encoded(|| encode_flash_command(name, args))
    }

    /// Send a line as typed.
    pub fn send_raw(&self, text: &str) -> AppResult<()> {
        self.send_encoded(|| encode_raw(text))
    }

    /// `MODE <mode>`.
    pub fn set_mode(&self, mode: Mode) -> AppResult<()> {
        self.send_command("MODE", mode.as_str())
    }

    /// `STREAM <samples>`; zero streams until stopped.
    pub fn start_streaming(&self, samples: u32) -> AppResult<()> {
        self.send_command("STREAM", &samples.to_string())
    }

    /// Stop streaming. With `idle` false the AFE stays powered (`IDLE 0`).
    pub fn stop_streaming(&self, idle: bool) -> AppResult<()> {
        let result = self
            .shared
            .ensure_connected()
            .and_then(|_| self.shared.stop_streaming(idle));
        self.shared.report(result)
    }

    // --- Configuration ---

    /// Stop streaming and query the full device configuration.
    ///
    /// With `apply_default` the model's ratio expressions and subtract flags are written to
    /// the device first. The replies update the model as they arrive.
    pub fn get_config(&self, apply_default: bool) -> AppResult<()> {
        self.shared.report(self.shared.get_config(apply_default))
    }

    /// Stage a configuration file into the device's flash buffer.
    ///
    /// Lines the parser cannot use are reported and skipped. Returns the number of
    /// commands sent.
    pub fn load_config(&self, path: impl AsRef<Path>) -> AppResult<usize> {
        let path = path.as_ref();
        self.shared.report(self.shared.ensure_connected())?;
        let parsed = self.shared.report(config_file::parse_file(path))?;
        for rejected in &parsed.rejected {
            self.shared.diagnostics.report(rejected);
        }

        info!(path = %path.display(), commands = parsed.commands.len(), "Loading configuration");
        self.stop_streaming(true)?;
        thread::sleep(RESYNC_PAUSE);
        self.send_flash_command("FL_CLEARBUF", None)?;
        for command in &parsed.commands {
            self.send_raw(command)?;
        }

        self.shared.model.write().code_mode_columns =
            self.shared.settings.streaming.code_mode_columns;
        Ok(parsed.commands.len())
    }

    /// Write the staged flash buffer to flash, `FL_PROGRAM 0`.
    pub fn program_flash(&self) -> AppResult<()> {
        self.send_flash_command("FL_PROGRAM", Some("0"))
    }

    /// Write the recorded register and application changes as a configuration file.
    pub fn save_config(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let text = self.shared.model.read().render_config();
        let result = fs::write(path.as_ref(), text).map_err(Cn0503Error::from);
        self.shared.report(result)?;
        info!(path = %path.as_ref().display(), "Configuration saved");
        Ok(())
    }

    /// Request `FL_DUMP` and collect the echoed lines.
    ///
    /// Collection ends once a `settle` window passes without a new line, or at `timeout`.
    pub fn flash_dump(&self, settle: Duration, timeout: Duration) -> AppResult<Vec<String>> {
        let start = self.shared.model.read().dump_commands.len();
        self.send_raw("FL_DUMP")?;

        let deadline = Instant::now() + timeout;
        let mut seen = start;
        loop {
            thread::sleep(settle);
            let count = self.shared.model.read().dump_commands.len();
            let quiet = count == seen;
            if (quiet && count > start) || Instant::now() >= deadline {
                break;
            }
            seen = count;
        }

        let model = self.shared.model.read();
        Ok(model
            .dump_commands
            .get(start..)
            .map(<[String]>::to_vec)
            .unwrap_or_default())
    }

    // --- Streaming data ---

    /// Drop all buffered samples.
    pub fn clear_graph_data(&self) {
        self.shared.buffers.write().clear();
        let _ = self.shared.events.send(ModelEvent::DataUpdated);
    }

    /// Stream `samples` frames and return the four ratio columns.
    ///
    /// `samples` must be below `max_data_points`.
    ///
    /// Streaming is stopped afterwards, also when the samples do not arrive in time.
    pub fn read_data(&self, samples: usize, timeout: Duration) -> AppResult<Vec<Vec<f64>>> {
        self.shared.report(self.shared.ensure_connected())?;
        // A full buffer holds one frame less than max_data_points
        let capacity = self.shared.buffers.read().max_data_points();
        if samples == 0 || samples >= capacity {
            return self.shared.report(Err(Cn0503Error::InvalidCommand(format!(
                "Cannot collect {samples} samples, the buffer holds at most {}",
                capacity.saturating_sub(1)
            ))));
        }

        self.shared.buffers.write().clear_column(0);
        self.start_streaming(samples as u32)?;

        let deadline = Instant::now() + timeout;
        let collected = loop {
            let count = self
                .shared
                .buffers
                .read()
                .column(0)
                .map_or(0, |column| column.len());
            if count >= samples {
                break true;
            }
            if Instant::now() >= deadline || !self.is_connected() {
                break false;
            }
            thread::sleep(WAIT_POLL);
        };
        self.stop_streaming(true)?;

        if !collected {
            return self
                .shared
                .report(Err(Cn0503Error::Timeout(format!("{samples} samples"))));
        }

        let snapshot = self.shared.buffers.read().snapshot(NUM_RATIOS);
        Ok((0..NUM_RATIOS).map(|i| snapshot.column_f64(i)).collect())
    }

    /// Copy of the buffered samples for the active column count.
    pub fn stream_snapshot(&self) -> StreamSnapshot {
        let model = self.shared.model.read();
        let buffers = self.shared.buffers.read();
        buffers.snapshot(model.current_data_width)
    }

    // --- Calibration ---

    /// Tell the firmware what channel `channel_number` (1-4) measures.
    pub fn set_measurement_type(
        &self,
        channel_number: usize,
        measurement_type: MeasurementType,
    ) -> AppResult<()> {
        if !measurement_type.supported_on(channel_number) {
            return self.shared.report(Err(Cn0503Error::InvalidCommand(format!(
                "{measurement_type} is not available on channel {channel_number}"
            ))));
        }
        self.send_raw(&format!(
            "CHANN{channel_number} {}",
            measurement_type.wire_name()
        ))?;
        thread::sleep(MEASUREMENT_TYPE_SETTLE);
        Ok(())
    }

    /// Measure the blank ratio of one channel and store it as its `RATB`.
    pub fn measure_baseline(
        &self,
        channel_index: usize,
        samples: usize,
        timeout: Duration,
    ) -> AppResult<f64> {
        if channel_index >= NUM_RATIOS {
            return self.shared.report(Err(Cn0503Error::RatioIndexOutOfRange {
                index: channel_index,
                count: NUM_RATIOS,
            }));
        }

        self.stop_streaming(true)?;
        self.set_mode(Mode::Arat)?;
        self.stop_streaming(false)?;
        thread::sleep(BASELINE_SETTLE);

        let columns = self.read_data(samples, timeout)?;
        let baseline = columns
            .get(channel_index)
            .and_then(|column| calibration::mean(column))
            .filter(|mean| *mean != 0.0)
            .ok_or_else(|| {
                Cn0503Error::Calibration(format!(
                    "Channel {} baseline is zero or empty",
                    channel_index + 1
                ))
            });
        let baseline = self.shared.report(baseline)?;

        self.send_def_command("RATB", channel_index, &baseline.to_string())?;
        info!(channel = channel_index + 1, baseline, "Baseline measured");
        Ok(baseline)
    }

    /// Send calibration coefficients, low to high order, as `INS1` or `INS2`.
    pub fn apply_polynomial(
        &self,
        channel_index: usize,
        which: DefSubcommand,
        coefficients: &[f64],
    ) -> AppResult<()> {
        if !matches!(which, DefSubcommand::Ins1 | DefSubcommand::Ins2) {
            return self.shared.report(Err(Cn0503Error::InvalidCommand(format!(
                "{which} does not take a polynomial"
            ))));
        }
        if coefficients.is_empty() || coefficients.len() > POLYNOMIAL_LEN {
            return self.shared.report(Err(Cn0503Error::Calibration(format!(
                "Expected 1-{POLYNOMIAL_LEN} coefficients, got {}",
                coefficients.len()
            ))));
        }

        let args = coefficients
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        self.send_def_command(which.as_str(), channel_index, &args)
    }

    // --- Observation ---

    /// Copy of the current device model.
    pub fn model(&self) -> DeviceModel {
        self.shared.model.read().clone()
    }

    /// Model events since the last call.
    pub fn drain_events(&self) -> Vec<ModelEvent> {
        self.events.try_iter().collect()
    }

    /// Receiver for model events, for callers that want to block on them.
    pub fn events(&self) -> Receiver<ModelEvent> {
        self.events.clone()
    }

    /// Receiver for link loss notifications.
    pub fn link_events(&self) -> Receiver<LinkEvent> {
        self.shared.transport.link_events()
    }

    /// Errors and notes recorded so far.
    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.shared.diagnostics
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shared.transport.disconnect();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}

fn dispatch_loop(
    dispatcher: &Dispatcher,
    inbound: &Receiver<Vec<u8>>,
    shared: &Shared,
    running: &AtomicBool,
) {
    while running.load(Ordering::SeqCst) {
        let bytes = match inbound.recv_timeout(DISPATCH_POLL) {
            Ok(bytes) => bytes,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let line = String::from_utf8_lossy(&bytes);
        if dispatcher.dispatch(&line) == DispatchOutcome::Resync {
            if let Err(err) = shared.get_config(false) {
                shared.diagnostics.report(&err);
            }
        }
    }
    debug!("Dispatch thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockConnector;

    fn session() -> (Session, MockConnector) {
        let connector = MockConnector::new(["mock"]);
        let session =
            Session::with_connector(Settings::default(), Arc::new(connector.clone())).unwrap();
        (session, connector)
    }

    #[test]
    fn commands_need_a_link() {
        let (session, _) = session();
        assert!(matches!(
            session.send_command("MODE", "ARAT"),
            Err(Cn0503Error::NotConnected)
        ));
        assert!(matches!(
            session.get_config(false),
            Err(Cn0503Error::NotConnected)
        ));
        assert_eq!(session.diagnostics().errors().len(), 2);
        assert!(!session.disconnect());
    }

    #[test]
    fn invalid_commands_are_not_sent() {
        let (session, connector) = session();
        session.connect("mock").unwrap();
        let device = connector.device().unwrap();

        assert!(session.send_command("FOO", "1").is_err());
        assert!(session.send_def_command("ARAT", 4, "A1").is_err());
        assert!(session.send_raw("help").is_err());
        assert!(session
            .set_measurement_type(2, MeasurementType::Turbidity)
            .is_err());
        assert!(session
            .apply_polynomial(0, DefSubcommand::Ratb, &[1.0])
            .is_err());

        thread::sleep(Duration::from_millis(200));
        assert!(device.written().is_empty());
        assert_eq!(session.diagnostics().errors().len(), 5);
    }

    #[test]
    fn polynomial_is_sent_low_order_first() {
        let (session, connector) = session();
        session.connect("mock").unwrap();
        let device = connector.device().unwrap();

        session
            .apply_polynomial(1, DefSubcommand::Ins2, &[0.5, 2.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();
        assert!(device.wait_for(Duration::from_secs(2), |lines| {
            lines.len() == 1 && lines[0] == "DEF1 INS2 0.5 2 0 0 0 0"
        }));
    }

    #[test]
    fn clear_graph_data_notifies() {
        let (session, _) = session();
        session.clear_graph_data();
        assert_eq!(session.drain_events(), vec![ModelEvent::DataUpdated]);
        assert!(session.stream_snapshot().is_empty());
    }

    #[test]
    fn read_data_stays_below_buffer_bound() {
        let (session, connector) = session();
        session.connect("mock").unwrap();
        let device = connector.device().unwrap();
        let bound = Settings::default().streaming.max_data_points;

        for samples in [0, bound, bound + 1] {
            assert!(matches!(
                session.read_data(samples, Duration::from_millis(10)),
                Err(Cn0503Error::InvalidCommand(_))
            ));
        }
        thread::sleep(Duration::from_millis(100));
        assert!(device.written().is_empty());
    }

    #[test]
    fn invalid_settings_are_refused() {
        let mut settings = Settings::default();
        settings.protocol.max_line_bytes = 0;
        assert!(Session::with_connector(settings, Arc::new(MockConnector::default())).is_err());
    }
}
