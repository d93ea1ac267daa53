//! Applies classified replies to the device model and the streaming buffers.
//!
//! The dispatcher is the only writer of [`DeviceModel`] and [`StreamBuffers`]. It handles
//! one line to completion before the next one, in arrival order. Observers learn about
//! changes through [`ModelEvent`]s: `ModelUpdated` when a model field actually changed,
//! `DataUpdated` when a frame was appended or the buffers were cleared.

use crate::diagnostics::DiagnosticLog;
use crate::error::Cn0503Error;
use crate::model::device::{DeviceModel, DeviceState, DumpEntry, MAX_COLUMNS, NUM_RATIOS};
use crate::model::stream::{Sample, StreamBuffers};
use crate::protocol::reply::{parse_line, DefField, Reply, Response};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Change notification emitted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEvent {
    /// A device model field changed
    ModelUpdated,
    /// The streaming buffers changed
    DataUpdated,
}

/// What happened to one inbound line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The line was understood (whether or not anything changed)
    Handled,
    /// Prompt, blank line, device error text, fragment or free text
    Ignored,
    /// The line was reported as an error and had no effect
    Rejected,
    /// The device applied a new configuration; the caller should re-read it
    Resync,
}

/// Routes inbound lines into the shared model and buffers.
///
/// Driven from one consumer thread. Takes the model lock before the buffer lock
/// whenever it needs both.
pub struct Dispatcher {
    model: Arc<RwLock<DeviceModel>>,
    buffers: Arc<RwLock<StreamBuffers>>,
    events: Sender<ModelEvent>,
    diagnostics: DiagnosticLog,
}

impl Dispatcher {
    /// Dispatcher writing into `model` and `buffers`, notifying on `events` and
    /// reporting bad lines to `diagnostics`.
    pub fn new(
        model: Arc<RwLock<DeviceModel>>,
        buffers: Arc<RwLock<StreamBuffers>>,
        events: Sender<ModelEvent>,
        diagnostics: DiagnosticLog,
    ) -> Self {
        Self {
            model,
            buffers,
            events,
            diagnostics,
        }
    }

    /// Process one inbound line received now.
    pub fn dispatch(&self, line: &str) -> DispatchOutcome {
        self.dispatch_at(line, Instant::now())
    }

    /// Process one inbound line received at `now`.
    pub fn dispatch_at(&self, line: &str, now: Instant) -> DispatchOutcome {
        debug!(packet = line.trim_end(), "Received packet");
        match parse_line(line) {
            Ok(reply) => self.apply(reply, now),
            Err(err) => self.reject(err),
        }
    }

    fn emit(&self, event: ModelEvent) {
        // Nobody listening is not an error
        let _ = self.events.send(event);
    }

    fn reject(&self, err: Cn0503Error) -> DispatchOutcome {
        self.diagnostics.report(&err);
        DispatchOutcome::Rejected
    }

    fn apply(&self, reply: Reply, now: Instant) -> DispatchOutcome {
        match reply {
            Reply::Blank | Reply::Prompt | Reply::NonResponse(_) => DispatchOutcome::Ignored,
            Reply::DeviceError(text) => {
                debug!(%text, "Device reported an error");
                DispatchOutcome::Ignored
            }
            Reply::Fragment(text) => {
                debug!(%text, "Discarding partial data line");
                DispatchOutcome::Ignored
            }
            Reply::StreamEcho => {
                let mut model = self.model.write();
                let mut buffers = self.buffers.write();
                model.state = DeviceState::Streaming;
                buffers.clear();
                self.emit(ModelEvent::ModelUpdated);
                self.emit(ModelEvent::DataUpdated);
                DispatchOutcome::Handled
            }
            Reply::CodeSample(codes) => {
                let samples: Vec<Sample> = codes.into_iter().map(Sample::Code).collect();
                self.accept_frame(&samples, true, now)
            }
            Reply::FloatSample(values) => {
                let samples: Vec<Sample> = values.into_iter().map(Sample::Value).collect();
                self.accept_frame(&samples, false, now)
            }
            Reply::Response(response) => self.apply_response(response),
        }
    }

    fn accept_frame(&self, samples: &[Sample], code_mode: bool, now: Instant) -> DispatchOutcome {
        let mut model = self.model.write();
        let mut buffers = self.buffers.write();

        if buffers.is_empty() {
            buffers.start(now);
            let mut width = samples.len();
            if code_mode && width > MAX_COLUMNS {
                self.diagnostics.report(&Cn0503Error::SampleWidthMismatch {
                    expected: MAX_COLUMNS,
                    actual: width,
                });
                width = MAX_COLUMNS;
            }
            model.current_data_width = width;
            if code_mode {
                model.code_mode_columns = width;
            }
            self.emit(ModelEvent::ModelUpdated);
        }

        if samples.len() != model.current_data_width {
            return self.reject(Cn0503Error::SampleWidthMismatch {
                expected: model.current_data_width,
                actual: samples.len(),
            });
        }

        if let Err(err) = buffers.append(now, samples) {
            return self.reject(err);
        }
        self.emit(ModelEvent::DataUpdated);
        DispatchOutcome::Handled
    }

    fn apply_response(&self, response: Response) -> DispatchOutcome {
        match response {
            Response::FlashApplied => {
                info!("Update model with newly applied config");
                return DispatchOutcome::Resync;
            }
            Response::FlashRead(value) => {
                self.diagnostics
                    .note(format!("Value from flash software buffer: {value}"));
            }
            Response::FlashWritten(value) => {
                self.diagnostics
                    .note(format!("{value} was written to flash software buffer"));
            }
            Response::FlashDump(payload) => match self.model.write().record_dump(&payload) {
                Ok(DumpEntry::SoftwareReset) => {
                    self.diagnostics
                        .note("SW reset encountered. Register changes list cleared");
                }
                Ok(entry) => debug!(?entry, %payload, "Recorded flash dump line"),
                Err(err) => return self.reject(err),
            },
            Response::FlashOther(command) => debug!(%command, "Flash command acknowledged"),
            Response::LedAdjusted { led, value } => {
                self.diagnostics.note(format!(
                    "LED current registers adjusted to set ADC readback for PCB-LED{led} to {value} saturation"
                ));
            }
            Response::ChannelType { channel, value } => {
                self.diagnostics.note(format!(
                    "CHANN{channel} set to {value}. ARAT, SUBE and LED current registers adjusted. Check jumpers"
                ));
            }
            Response::Register {
                address,
                value,
                query,
            } => {
                info!("Reg 0x{address}=0x{value}");
                if !query {
                    self.model.write().record_register_write(&address, &value);
                }
            }
            Response::Mode(mode) => {
                let mut model = self.model.write();
                if model.mode_needs_refresh(mode) {
                    let mut buffers = self.buffers.write();
                    model.apply_mode(mode);
                    buffers.clear();
                    self.emit(ModelEvent::ModelUpdated);
                    self.emit(ModelEvent::DataUpdated);
                }
            }
            Response::Odr(rate) => {
                if self.model.write().set_odr(rate) {
                    self.emit(ModelEvent::ModelUpdated);
                }
            }
            Response::NumRat(count) => {
                if count != NUM_RATIOS as i64 {
                    return self.reject(Cn0503Error::MalformedPacket(format!(
                        "Number of ratios should be {NUM_RATIOS}, but it is {count}"
                    )));
                }
            }
            Response::Idle(Some(state)) => {
                let mut model = self.model.write();
                if model.state != state {
                    model.state = state;
                    self.emit(ModelEvent::ModelUpdated);
                }
            }
            Response::Idle(None) => debug!("IDLE reply with unexpected value"),
            Response::Def { index, field } => return self.apply_def(index, field),
            Response::Info(text) | Response::RatMask(text) => info!("{}", text),
        }
        DispatchOutcome::Handled
    }

    fn apply_def(&self, index: usize, field: DefField) -> DispatchOutcome {
        let mut model = self.model.write();
        let Some(channel) = model.channel_mut(index) else {
            return self.reject(Cn0503Error::RatioIndexOutOfRange {
                index,
                count: NUM_RATIOS,
            });
        };

        let changed = match field {
            DefField::RatioExpression(expression) => {
                replace_if_changed(&mut channel.ratio_expression, expression)
            }
            DefField::LpfCutoff(cutoff) => channel.set_lpf_cutoff(cutoff),
            DefField::Alarm => false,
            DefField::Baseline(baseline) => replace_if_changed(&mut channel.baseline_ratio, baseline),
            DefField::Ins1(coefficients) => {
                replace_if_changed(&mut channel.ins1_polynomial, coefficients)
            }
            DefField::Ins2(coefficients) => {
                replace_if_changed(&mut channel.ins2_polynomial, coefficients)
            }
            DefField::SubtractEnabled(enabled) => {
                replace_if_changed(&mut channel.subtract_enabled, enabled)
            }
        };

        if changed {
            self.emit(ModelEvent::ModelUpdated);
        }
        DispatchOutcome::Handled
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}
