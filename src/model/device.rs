//! Device-wide state: display mode, idle/streaming state, output data rate, the four
//! channels and the change logs used to rebuild a flashable configuration.

use super::channel::Channel;
use crate::error::{AppResult, Cn0503Error};
use indexmap::IndexMap;
use std::fmt;
use std::str::FromStr;

/// Number of ratios (optical paths) on the board.
pub const NUM_RATIOS: usize = 4;

/// Maximum number of data columns in a streaming frame.
pub const MAX_COLUMNS: usize = 16;

/// Valid output data rate range in Hz.
pub const ODR_RANGE: std::ops::RangeInclusive<f64> = 0.01..=5.0;

/// Register 0xF, bit 15: software reset.
const SW_RESET_REGISTER: u32 = 0xF;
const SW_RESET_BIT: u32 = 0x8000;

/// Display (output) mode of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Raw ADC codes, hex encoded, up to 16 columns
    Code,
    /// Absolute ratio
    Arat,
    /// Relative ratio
    Rrat,
    /// Instrumentation unit 1 polynomial
    Ins1,
    /// Instrumentation unit 2 polynomial
    Ins2,
}

impl Mode {
    /// Every mode, in device index order.
    pub const ALL: [Mode; 5] = [Mode::Code, Mode::Arat, Mode::Rrat, Mode::Ins1, Mode::Ins2];

    /// Wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Code => "CODE",
            Mode::Arat => "ARAT",
            Mode::Rrat => "RRAT",
            Mode::Ins1 => "INS1",
            Mode::Ins2 => "INS2",
        }
    }

    /// Position in [`Mode::ALL`].
    pub fn index(self) -> usize {
        Mode::ALL.iter().position(|m| *m == self).unwrap_or(0)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Cn0503Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Cn0503Error::MalformedPacket(format!("Unrecognized mode {s}")))
    }
}

/// Whether the device is idle or streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    /// AFE powered down, no frames
    #[default]
    Idle,
    /// Frames arriving, commands must be paced
    Streaming,
}

/// What an `FL_DUMP` line turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpEntry {
    /// `DEFn SUB value...` stored under `DEFn SUB`
    Definition { key: String },
    /// `ODR`, `MODE` or `RATMASK` stored under its keyword
    Global { key: String },
    /// Register write appended to the register log
    Register,
    /// Register write that reset the device; the register log was cleared
    SoftwareReset,
}

/// Model of the CN0503 system
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceModel {
    mode: Mode,
    /// Idle or streaming
    pub state: DeviceState,
    odr: f64,
    /// Number of columns the last CODE-mode session produced
    pub code_mode_columns: usize,
    /// Number of columns expected in the current streaming session
    pub current_data_width: usize,
    /// The four optical paths, indexed by ratio index 0-3
    pub channels: [Channel; NUM_RATIOS],
    /// Register writes, "address value", in order
    pub register_changes: Vec<String>,
    /// Application settings seen in a flash dump, keyed by command
    pub config_changes: IndexMap<String, String>,
    /// Raw `FL_DUMP` payloads, in order
    pub dump_commands: Vec<String>,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::new(8)
    }
}

impl DeviceModel {
    /// Fresh model with board defaults.
    pub fn new(code_mode_columns: usize) -> Self {
        Self {
            mode: Mode::Code,
            state: DeviceState::Idle,
            odr: 1.0,
            code_mode_columns,
            current_data_width: NUM_RATIOS,
            channels: std::array::from_fn(|i| Channel::new(i + 1)),
            register_changes: Vec::new(),
            config_changes: IndexMap::new(),
            dump_commands: Vec::new(),
        }
    }

    /// Active output mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Column count a mode produces before any frame has been seen.
    pub fn default_data_width(&self, mode: Mode) -> usize {
        match mode {
            Mode::Code => self.code_mode_columns,
            _ => NUM_RATIOS,
        }
    }

    /// Switch mode and reset the expected data width to the mode default.
    ///
    /// The caller is responsible for clearing the streaming buffers.
    pub fn apply_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.current_data_width = self.default_data_width(mode);
    }

    /// Whether a `MODE` reply would change anything.
    pub fn mode_needs_refresh(&self, mode: Mode) -> bool {
        self.mode != mode || self.current_data_width != self.default_data_width(mode)
    }

    /// Output data rate in Hz.
    pub fn odr(&self) -> f64 {
        self.odr
    }

    /// Set the output data rate. Values outside 0.01-5.0 Hz are ignored.
    ///
    /// Returns whether the stored value changed.
    pub fn set_odr(&mut self, rate: f64) -> bool {
        if !ODR_RANGE.contains(&rate) || self.odr == rate {
            return false;
        }
        self.odr = rate;
        true
    }

    /// Channel for a zero-based ratio index.
    pub fn channel(&self, ratio_index: usize) -> Option<&Channel> {
        self.channels.get(ratio_index)
    }

    /// Mutable channel for a zero-based ratio index.
    pub fn channel_mut(&mut self, ratio_index: usize) -> Option<&mut Channel> {
        self.channels.get_mut(ratio_index)
    }

    /// Record a confirmed register write, zero padded as the device prints it.
    pub fn record_register_write(&mut self, address: &str, value: &str) {
        self.register_changes
            .push(format!("{:0>3} {:0>4}", address, value));
    }

    /// Record one `FL_DUMP` payload and classify it.
    pub fn record_dump(&mut self, payload: &str) -> AppResult<DumpEntry> {
        self.dump_commands.push(payload.to_string());

        let tokens: Vec<&str> = payload.split_whitespace().collect();
        let upper = payload.to_ascii_uppercase();

        if tokens.iter().any(|t| t.to_ascii_uppercase().contains("DEF")) {
            let split = tokens.len().min(2);
            let key = tokens[..split].join(" ");
            self.config_changes
                .insert(key.clone(), tokens[split..].join(" "));
            return Ok(DumpEntry::Definition { key });
        }

        if ["ODR", "MODE", "RATMASK"].iter().any(|k| upper.contains(k)) {
            let split = tokens.len().min(1);
            let key = tokens[..split].join(" ");
            self.config_changes
                .insert(key.clone(), tokens[split..].join(" "));
            return Ok(DumpEntry::Global { key });
        }

        let register = if tokens.iter().any(|t| t.to_ascii_uppercase().contains("REG")) {
            &tokens[1.min(tokens.len())..]
        } else {
            &tokens[..]
        };

        let (address, value) = match register {
            [address, value, ..] => (*address, *value),
            _ => {
                return Err(Cn0503Error::MalformedPacket(format!(
                    "In FL_DUMP: {payload}"
                )))
            }
        };
        let parsed_address = parse_hex(address)
            .ok_or_else(|| Cn0503Error::MalformedPacket(format!("In FL_DUMP: {payload}")))?;
        let parsed_value = parse_hex(value)
            .ok_or_else(|| Cn0503Error::MalformedPacket(format!("In FL_DUMP: {payload}")))?;

        if parsed_address == SW_RESET_REGISTER && parsed_value & SW_RESET_BIT == SW_RESET_BIT {
            self.register_changes.clear();
            return Ok(DumpEntry::SoftwareReset);
        }

        self.register_changes.push(register.join(" "));
        Ok(DumpEntry::Register)
    }

    /// Rebuild a configuration file from the recorded register and application changes.
    ///
    /// The output is accepted by [`crate::protocol::config_file::parse`].
    pub fn render_config(&self) -> String {
        let mut out = String::from("# CN0503 configuration\n");
        if !self.register_changes.is_empty() {
            out.push_str("# Registers\n");
            for change in &self.register_changes {
                out.push_str("REG ");
                out.push_str(change);
                out.push('\n');
            }
        }
        if !self.config_changes.is_empty() {
            out.push_str("# Application\n");
            for (key, value) in &self.config_changes {
                out.push_str(key);
                if !value.is_empty() {
                    out.push(' ');
                    out.push_str(value);
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Parse a hex number with an optional `0x` prefix.
pub(crate) fn parse_hex(text: &str) -> Option<u32> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u32::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_switch_resets_width() {
        let mut model = DeviceModel::new(8);
        model.current_data_width = 3;
        model.apply_mode(Mode::Code);
        assert_eq!(model.current_data_width, 8);
        model.apply_mode(Mode::Rrat);
        assert_eq!(model.current_data_width, NUM_RATIOS);
        assert!(!model.mode_needs_refresh(Mode::Rrat));
        assert!(model.mode_needs_refresh(Mode::Ins1));
    }

    #[test]
    fn odr_out_of_range_is_ignored() {
        let mut model = DeviceModel::default();
        assert!(!model.set_odr(10.0));
        assert!(!model.set_odr(1.0));
        assert!(model.set_odr(2.5));
        assert_eq!(model.odr(), 2.5);
    }

    #[test]
    fn parses_modes_case_insensitively() {
        assert_eq!("rrat".parse::<Mode>().unwrap(), Mode::Rrat);
        assert_eq!(Mode::Ins2.index(), 4);
        assert!("FAST".parse::<Mode>().is_err());
    }

    #[test]
    fn dump_classifies_definitions_and_globals() {
        let mut model = DeviceModel::default();
        let entry = model.record_dump("DEF0 RATB 1.003").unwrap();
        assert_eq!(
            entry,
            DumpEntry::Definition {
                key: "DEF0 RATB".into()
            }
        );
        model.record_dump("ODR 2.0").unwrap();
        model.record_dump("DEF0 RATB 1.1").unwrap();

        assert_eq!(model.config_changes["DEF0 RATB"], "1.1");
        assert_eq!(model.config_changes["ODR"], "2.0");
        assert_eq!(model.dump_commands.len(), 3);
    }

    #[test]
    fn dump_records_register_writes() {
        let mut model = DeviceModel::default();
        assert_eq!(model.record_dump("REG 10B 03FC").unwrap(), DumpEntry::Register);
        assert_eq!(model.record_dump("10C 0001").unwrap(), DumpEntry::Register);
        assert_eq!(model.register_changes, vec!["10B 03FC", "10C 0001"]);
    }

    #[test]
    fn software_reset_clears_register_log() {
        let mut model = DeviceModel::default();
        model.record_dump("REG 10B 03FC").unwrap();
        model.record_dump("REG 10C 0001").unwrap();

        let entry = model.record_dump("REG F 8000").unwrap();
        assert_eq!(entry, DumpEntry::SoftwareReset);
        assert!(model.register_changes.is_empty());

        model.record_dump("REG 00F 0001").unwrap();
        assert_eq!(model.register_changes, vec!["00F 0001"]);
    }

    #[test]
    fn malformed_register_dump_is_an_error() {
        let mut model = DeviceModel::default();
        assert!(model.record_dump("REG XYZ").is_err());
        assert!(model.record_dump("hello world").is_err());
        assert!(model.register_changes.is_empty());
    }

    #[test]
    fn rendered_config_round_trips_through_the_log() {
        let mut model = DeviceModel::default();
        model.record_dump("REG 10B 03FC").unwrap();
        model.record_dump("MODE RRAT").unwrap();
        model.record_dump("DEF1 INS1 0 1 0 0 0 0").unwrap();

        let text = model.render_config();
        assert!(text.contains("REG 10B 03FC\n"));
        assert!(text.contains("MODE RRAT\n"));
        assert!(text.contains("DEF1 INS1 0 1 0 0 0 0\n"));
    }
}
