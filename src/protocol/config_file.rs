//! Configuration file parsing.
//!
//! A configuration file is line oriented. Lines starting with `#` or `/` are comments.
//! Every other line is either a register write, `REG 10B 03FC` or bare `10B 03FC` with an
//! optional trailing comment, or an application command (`DEFn ...`, `MODE ...`,
//! `ODR ...`, `RATMASK ...`). Each line is turned into a flash staging command
//! (`FL_WRITE <line>`) unless it already names a flash command.
//!
//! `.dcfg` files usually hold ADPD4101 registers, `.lcfg` files application values and
//! `.cfg` files both. The parser does not care.

use crate::error::Cn0503Error;
use crate::model::device::parse_hex;
use std::fs;
use std::path::Path;

const APPLICATION_KEYWORDS: [&str; 5] = ["REG", "DEF", "ODR", "MODE", "RATMASK"];

/// Commands ready to send, plus the lines that could not be used.
#[derive(Debug, Default)]
pub struct ParsedConfig {
    /// Device commands in file order
    pub commands: Vec<String>,
    /// One error per unusable line
    pub rejected: Vec<Cn0503Error>,
}

/// Parse configuration text.
pub fn parse(text: &str) -> ParsedConfig {
    let mut parsed = ParsedConfig::default();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('/') {
            continue;
        }

        match parse_line(line) {
            Some(command) => parsed.commands.push(command),
            None => parsed.rejected.push(Cn0503Error::UnsupportedConfigLine {
                line: number + 1,
                text: trimmed.to_string(),
            }),
        }
    }

    parsed
}

/// Read and parse a configuration file.
pub fn parse_file(path: impl AsRef<Path>) -> Result<ParsedConfig, Cn0503Error> {
    let text = fs::read_to_string(path)?;
    Ok(parse(&text))
}

fn parse_line(line: &str) -> Option<String> {
    let upper = line.to_ascii_uppercase();
    if APPLICATION_KEYWORDS.iter().any(|k| upper.contains(k)) {
        // ARAT expressions use '#' for constants, so their comments cannot be stripped
        let msg = if line.contains("ARAT") {
            line.trim()
        } else {
            line.split('#').next().unwrap_or_default().trim()
        };
        if msg.is_empty() {
            return None;
        }
        return Some(if msg.contains("FL_") {
            msg.to_string()
        } else {
            format!("FL_WRITE {msg}")
        });
    }

    let mut parts = line.split_whitespace();
    let address = parts.next().filter(|a| parse_hex(a).is_some())?;
    let value = parts.next()?;
    Some(format!("FL_WRITE REG {address} {value}"))
}
