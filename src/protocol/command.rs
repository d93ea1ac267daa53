//! Outbound command encoding.
//!
//! Every encoder validates before anything reaches the wire and returns the command text
//! without a line terminator. [`frame`] adds the terminator.

use crate::error::{AppResult, Cn0503Error};
use crate::model::device::NUM_RATIOS;
use std::fmt;
use std::str::FromStr;

/// Top-level command vocabulary accepted by [`encode_command`].
pub const UART_COMMANDS: [&str; 10] = [
    "REG", "MODE", "STREAM", "IDLE", "DEF", "ALRM", "BOOT", "ODR", "NUMRAT", "PCB-LED",
];

/// Commands that carry a trailing channel digit (`DEF0`, `PCB-LED2`).
const CHANNEL_COMMANDS: [&str; 2] = ["DEF", "PCB-LED"];

/// Queries issued at the start of a configuration read.
pub const CONTROL_QUERIES: [&str; 4] = ["IDLE?", "ODR?", "MODE?", "NUMRAT?"];

/// Enables data output on all four optical paths.
pub const RATMASK_ALL: &str = "RATMASK F";

/// `DEFn` subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefSubcommand {
    /// Ratio expression (RPN)
    Arat,
    /// Low-pass filter cutoff
    Rflt,
    /// Alarm thresholds, not modelled
    Alrm,
    /// Ratio baseline
    Ratb,
    /// First instrumentation polynomial
    Ins1,
    /// Second instrumentation polynomial
    Ins2,
    /// Subtract enable for the relative ratio
    Sube,
}

impl DefSubcommand {
    /// Every subcommand, in wire order.
    pub const ALL: [DefSubcommand; 7] = [
        DefSubcommand::Arat,
        DefSubcommand::Rflt,
        DefSubcommand::Alrm,
        DefSubcommand::Ratb,
        DefSubcommand::Ins1,
        DefSubcommand::Ins2,
        DefSubcommand::Sube,
    ];

    /// Subcommands read back during a configuration read, in order.
    pub const QUERIED: [DefSubcommand; 6] = [
        DefSubcommand::Arat,
        DefSubcommand::Rflt,
        DefSubcommand::Ratb,
        DefSubcommand::Ins1,
        DefSubcommand::Ins2,
        DefSubcommand::Sube,
    ];

    /// Wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            DefSubcommand::Arat => "ARAT",
            DefSubcommand::Rflt => "RFLT",
            DefSubcommand::Alrm => "ALRM",
            DefSubcommand::Ratb => "RATB",
            DefSubcommand::Ins1 => "INS1",
            DefSubcommand::Ins2 => "INS2",
            DefSubcommand::Sube => "SUBE",
        }
    }
}

impl fmt::Display for DefSubcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefSubcommand {
    type Err = Cn0503Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DefSubcommand::ALL
            .into_iter()
            .find(|sub| sub.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Cn0503Error::InvalidCommand(format!("Invalid DEF command '{s}'")))
    }
}

/// Flash staging buffer commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashCommand {
    /// Empty the staging buffer
    ClearBuf,
    /// Load flash into the staging buffer
    Load,
    /// Write the staging buffer to flash
    Program,
    /// Erase the stored configuration
    Erase,
    /// Apply the stored configuration
    Apply,
    /// Append one command to the staging buffer
    Write,
    /// Read the staging buffer back
    Read,
}

impl FlashCommand {
    /// Every flash command.
    pub const ALL: [FlashCommand; 7] = [
        FlashCommand::ClearBuf,
        FlashCommand::Load,
        FlashCommand::Program,
        FlashCommand::Erase,
        FlashCommand::Apply,
        FlashCommand::Write,
        FlashCommand::Read,
    ];

    /// Wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            FlashCommand::ClearBuf => "FL_CLEARBUF",
            FlashCommand::Load => "FL_LOAD",
            FlashCommand::Program => "FL_PROGRAM",
            FlashCommand::Erase => "FL_ERASE",
            FlashCommand::Apply => "FL_APPLY",
            FlashCommand::Write => "FL_WRITE",
            FlashCommand::Read => "FL_READ",
        }
    }
}

impl FromStr for FlashCommand {
    type Err = Cn0503Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlashCommand::ALL
            .into_iter()
            .find(|cmd| cmd.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Cn0503Error::InvalidCommand(format!("Invalid flash command '{s}'")))
    }
}

/// Validate `name` against [`UART_COMMANDS`] and build `NAME[digit] args`.
///
/// For `DEF` and `PCB-LED` the trailing channel digits are split off before the lookup
/// and reattached afterwards.
pub fn encode_command(name: &str, args: &str) -> AppResult<String> {
    let name = name.trim().to_ascii_uppercase();

    let (base, channel) = CHANNEL_COMMANDS
        .iter()
        .find_map(|prefix| {
            name.strip_prefix(prefix)
                .filter(|rest| rest.chars().all(|c| c.is_ascii_digit()))
                .map(|rest| (*prefix, rest))
        })
        .unwrap_or((name.as_str(), ""));

    if !UART_COMMANDS.contains(&base) {
        return Err(Cn0503Error::InvalidCommand(format!(
            "Invalid command '{name}'"
        )));
    }

    Ok(format!("{base}{channel} {}", args.trim())
        .trim_end()
        .to_string())
}

/// Build `DEFn SUB args` for ratio index `channel_index` (0-3).
pub fn encode_def_command(subcommand: &str, channel_index: usize, args: &str) -> AppResult<String> {
    let subcommand: DefSubcommand = subcommand.parse()?;
    if channel_index >= NUM_RATIOS {
        return Err(Cn0503Error::RatioIndexOutOfRange {
            index: channel_index,
            count: NUM_RATIOS,
        });
    }
    Ok(format!("DEF{channel_index} {subcommand} {}", args.trim())
        .trim_end()
        .to_string())
}

/// Build a flash command, with an optional argument string.
pub fn encode_flash_command(name: &str, args: Option<&str>) -> AppResult<String> {
    let command: FlashCommand = name.parse()?;
    let mut msg = command.as_str().to_string();
    if let Some(args) = args.map(str::trim).filter(|a| !a.is_empty()) {
        msg.push(' ');
        msg.push_str(args);
    }
    Ok(msg)
}

/// Pass text through unvalidated, except for empty text and `help`.
///
/// The device answers `help` with a multi-line listing that would desynchronize the
/// line-oriented reply parser.
pub fn encode_raw(text: &str) -> AppResult<String> {
    let msg = text.trim();
    if msg.is_empty() {
        return Err(Cn0503Error::InvalidCommand("Empty command".to_string()));
    }
    if msg.to_ascii_lowercase().contains("help") {
        return Err(Cn0503Error::InvalidCommand(
            "Intercepted help command because of multi-line response".to_string(),
        ));
    }
    Ok(msg.to_string())
}

/// `DEFn? SUB` queries for one ratio.
pub fn def_queries(channel_index: usize) -> Vec<String> {
    DefSubcommand::QUERIED
        .iter()
        .map(|sub| format!("DEF{channel_index}? {sub}"))
        .collect()
}

/// The full configuration read: control queries, six DEF queries per ratio, then
/// [`RATMASK_ALL`].
pub fn config_query_sequence() -> Vec<String> {
    let mut sequence: Vec<String> = CONTROL_QUERIES.iter().map(|q| q.to_string()).collect();
    for index in 0..NUM_RATIOS {
        sequence.extend(def_queries(index));
    }
    sequence.push(RATMASK_ALL.to_string());
    sequence
}

/// Terminate a message for the wire. Trailing whitespace is replaced by a single `\n`.
pub fn frame(msg: &str) -> String {
    format!("{}\n", msg.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_digit_is_reattached() {
        assert_eq!(encode_command("def2", "RATB 5").unwrap(), "DEF2 RATB 5");
        assert_eq!(encode_command("PCB-LED1", "50").unwrap(), "PCB-LED1 50");
        assert_eq!(encode_command("stream", "10").unwrap(), "STREAM 10");
        assert_eq!(encode_command("IDLE", "").unwrap(), "IDLE");
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(matches!(
            encode_command("RESET", "1"),
            Err(Cn0503Error::InvalidCommand(_))
        ));
        assert!(encode_command("DEFX", "RATB 1").is_err());
        assert!(encode_command("RATMASK", "F").is_err());
    }

    #[test]
    fn def_command_validates_subcommand_and_index() {
        assert_eq!(
            encode_def_command("ratb", 0, "1.003").unwrap(),
            "DEF0 RATB 1.003"
        );
        assert!(encode_def_command("GAIN", 0, "1").is_err());
        assert!(matches!(
            encode_def_command("RATB", 4, "1"),
            Err(Cn0503Error::RatioIndexOutOfRange { index: 4, count: 4 })
        ));
    }

    #[test]
    fn flash_command_arguments_are_optional() {
        assert_eq!(encode_flash_command("fl_apply", None).unwrap(), "FL_APPLY");
        assert_eq!(
            encode_flash_command("FL_WRITE", Some("REG 10B 03FC")).unwrap(),
            "FL_WRITE REG 10B 03FC"
        );
        assert_eq!(encode_flash_command("FL_PROGRAM", Some("")).unwrap(), "FL_PROGRAM");
        assert!(encode_flash_command("FL_DUMPALL", None).is_err());
    }

    #[test]
    fn raw_rejects_empty_and_help() {
        assert!(encode_raw("   ").is_err());
        assert!(encode_raw("HELP").is_err());
        assert!(encode_raw("reg help").is_err());
        assert_eq!(encode_raw(" FL_DUMP \n").unwrap(), "FL_DUMP");
    }

    #[test]
    fn query_sequence_order() {
        let sequence = config_query_sequence();
        assert_eq!(sequence.len(), 4 + 4 * 6 + 1);
        assert_eq!(&sequence[..4], &["IDLE?", "ODR?", "MODE?", "NUMRAT?"]);
        assert_eq!(sequence[4], "DEF0? ARAT");
        assert_eq!(sequence[9], "DEF0? SUBE");
        assert_eq!(sequence[27], "DEF3? SUBE");
        assert_eq!(sequence.last().unwrap(), "RATMASK F");
    }

    #[test]
    fn frame_terminates_once() {
        assert_eq!(frame("IDLE 1"), "IDLE 1\n");
        assert_eq!(frame("IDLE 1\r\n"), "IDLE 1\n");
    }
}
