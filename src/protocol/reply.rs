//! Inbound line classification.
//!
//! [`parse_line`] turns one line received from the device into a [`Reply`]. The checks run
//! in a fixed order because several of them overlap textually (a `RESP: STREAM` echo also
//! contains `STREAM`, a truncated data line can start with a hex digit, and so on).
//! Tokens are matched by exact equality after tokenizing, never by substring, with the
//! exception of the device's own error text and the `STREAM` echo.

use crate::error::{AppResult, Cn0503Error};
use crate::model::channel::POLYNOMIAL_LEN;
use crate::model::device::{parse_hex, DeviceState, Mode, NUM_RATIOS};
use crate::protocol::command::DefSubcommand;

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Empty line
    Blank,
    /// The `>` prompt
    Prompt,
    /// `Unknown ...` or `ERROR ...` text already printed by the device
    DeviceError(String),
    /// Any line containing `STREAM`
    StreamEcho,
    /// Partial data line whose first token is a number
    Fragment(String),
    /// `DATI` frame, one raw ADC code per column
    CodeSample(Vec<u32>),
    /// `DATF` frame, one value per column
    FloatSample(Vec<f64>),
    /// Line that is neither a frame nor a `RESP` (help text, free-form messages)
    NonResponse(String),
    /// A `RESP:` reply
    Response(Response),
}

/// Payload of a `RESP:` line.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The device applied a newly flashed configuration
    FlashApplied,
    /// `FL_READ` acknowledgment
    FlashRead(String),
    /// `FL_WRITE` echo of the staged command
    FlashWritten(String),
    /// One line of a flash dump, verbatim
    FlashDump(String),
    /// `FL_CLEARBUF`, `FL_LOAD`, `FL_PROGRAM`, `FL_ERASE` acknowledgments
    FlashOther(String),
    /// `PCB-LEDn` auto-adjust result
    LedAdjusted {
        /// `PCB-LEDn` token
        led: String,
        /// Drive current chosen by the firmware
        value: String,
    },
    /// `CHANNn` measurement type change
    ChannelType {
        /// `CHANNn` token
        channel: String,
        /// Measurement type as echoed
        value: String,
    },
    /// Register echo, zero padded to 3 and 4 digits
    Register {
        /// Hex register address
        address: String,
        /// Hex register value
        value: String,
        /// Answer to `REG?` rather than a write echo
        query: bool,
    },
    /// Active output mode
    Mode(Mode),
    /// Output data rate in Hz
    Odr(f64),
    /// Number of ratios reported by the firmware
    NumRat(i64),
    /// `None` for values other than `0` or `1`
    Idle(Option<DeviceState>),
    /// One field of ratio `index`
    Def {
        /// Zero-based ratio index
        index: usize,
        /// Field and its new value
        field: DefField,
    },
    /// Free-form `INFO` text
    Info(String),
    /// Ratio mask acknowledgment
    RatMask(String),
}

/// Channel field carried by a `DEFn` reply.
#[derive(Debug, Clone, PartialEq)]
pub enum DefField {
    /// `ARAT` ratio expression
    RatioExpression(String),
    /// `RFLT` cutoff in Hz
    LpfCutoff(f64),
    /// Accepted, not modelled
    Alarm,
    /// `RATB` baseline ratio
    Baseline(f64),
    /// `INS1` coefficients, lowest order first
    Ins1(Vec<f64>),
    /// `INS2` coefficients, lowest order first
    Ins2(Vec<f64>),
    /// `SUBE` flag, `0` or `1`
    SubtractEnabled(u8),
}

fn malformed(message: impl Into<String>) -> Cn0503Error {
    Cn0503Error::MalformedPacket(message.into())
}

/// Whether a token reads as a hex integer or a float.
fn is_numeric(token: &str) -> bool {
    parse_hex(token).is_some() || token.parse::<f64>().is_ok()
}

/// Classify one inbound line.
///
/// Errors are protocol-level: the line is malformed, carries a value that does not parse,
/// names a ratio index out of range, or has an unrecognized token. None of them are fatal.
pub fn parse_line(line: &str) -> AppResult<Reply> {
    let packet = line.trim();

    if packet.is_empty() {
        return Ok(Reply::Blank);
    }
    if packet == ">" {
        return Ok(Reply::Prompt);
    }
    if packet.contains("Unknown") || packet.contains("ERROR") {
        return Ok(Reply::DeviceError(packet.to_string()));
    }
    if packet.contains("STREAM") {
        return Ok(Reply::StreamEcho);
    }

    let (head, rest) = packet
        .split_once(' ')
        .ok_or_else(|| malformed(format!("Invalid packet with no spaces: {packet}")))?;

    if is_numeric(head) {
        return Ok(Reply::Fragment(packet.to_string()));
    }

    match head {
        "DATI" => rest
            .split_whitespace()
            .map(|v| {
                u32::from_str_radix(v, 16).map_err(|_| malformed(format!("Bad DATI value '{v}'")))
            })
            .collect::<AppResult<Vec<u32>>>()
            .map(Reply::CodeSample),
        "DATF" => rest
            .split_whitespace()
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| malformed(format!("Bad DATF value '{v}'")))
            })
            .collect::<AppResult<Vec<f64>>>()
            .map(Reply::FloatSample),
        _ if head.starts_with("RESP") => parse_response(rest).map(Reply::Response),
        _ => Ok(Reply::NonResponse(packet.to_string())),
    }
}

/// Parse what follows `RESP:`. `=` separates a token from its value like a space does.
fn parse_response(body: &str) -> AppResult<Response> {
    let normalized = body.replace('=', " ");
    let normalized = normalized.trim();
    let (raw_token, remainder) = match normalized.split_once(' ') {
        Some((token, remainder)) => (token, remainder.trim()),
        None => (normalized, ""),
    };

    let query = raw_token.ends_with('?');
    let token = raw_token.trim_end_matches('?');

    let response = match token {
        "FL_APPLY" => Response::FlashApplied,
        "FL_READ" => Response::FlashRead(remainder.to_string()),
        "FL_WRITE" => Response::FlashWritten(remainder.to_string()),
        "FL_DUMP" => Response::FlashDump(remainder.to_string()),
        _ if token.starts_with("FL_") => Response::FlashOther(token.to_string()),
        "REG" => parse_register(remainder, query)?,
        "MODE" => Response::Mode(remainder.parse()?),
        "ODR" => Response::Odr(
            remainder
                .parse()
                .map_err(|_| malformed(format!("Non-numeric ODR value '{remainder}'")))?,
        ),
        "NUMRAT" => Response::NumRat(
            remainder
                .parse()
                .map_err(|_| malformed(format!("Could not convert '{remainder}' to int")))?,
        ),
        "IDLE" => Response::Idle(match remainder {
            "1" => Some(DeviceState::Idle),
            "0" => Some(DeviceState::Streaming),
            _ => None,
        }),
        "INFO" => Response::Info(remainder.to_string()),
        "RATMASK" => Response::RatMask(remainder.to_string()),
        _ => {
            if let Some(led) = indexed(token, "PCB-LED") {
                Response::LedAdjusted {
                    led: led.to_string(),
                    value: remainder.to_string(),
                }
            } else if let Some(channel) = indexed(token, "CHANN") {
                Response::ChannelType {
                    channel: channel.to_string(),
                    value: remainder.to_string(),
                }
            } else if let Some(index) = indexed(token, "DEF") {
                parse_def(index, remainder)?
            } else {
                return Err(malformed(format!("Unrecognized command {body}")));
            }
        }
    };
    Ok(response)
}

/// Digits following `prefix`, if `token` is exactly `prefix` followed by digits.
fn indexed<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    token
        .strip_prefix(prefix)
        .filter(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
}

fn parse_register(remainder: &str, query: bool) -> AppResult<Response> {
    let mut parts = remainder.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(address), Some(value)) => Ok(Response::Register {
            address: format!("{address:0>3}"),
            value: format!("{value:0>4}"),
            query,
        }),
        _ => Err(malformed(format!("REG reply without address and value: {remainder}"))),
    }
}

fn parse_def(index: &str, remainder: &str) -> AppResult<Response> {
    let index: usize = index
        .parse()
        .map_err(|_| malformed(format!("Ratio index in DEF command not numeric: {index}")))?;
    if index >= NUM_RATIOS {
        return Err(Cn0503Error::RatioIndexOutOfRange {
            index,
            count: NUM_RATIOS,
        });
    }

    let mut values = remainder.split_whitespace();
    let subcommand: DefSubcommand = values
        .next()
        .ok_or_else(|| malformed(format!("DEF{index} reply without subcommand")))?
        .parse()
        .map_err(|_| malformed(format!("Unrecognized DEF subcommand in '{remainder}'")))?;
    let values: Vec<&str> = values.collect();

    let first = || {
        values
            .first()
            .copied()
            .ok_or_else(|| malformed(format!("DEF{index} {subcommand} reply without value")))
    };
    let float = |text: &str| {
        text.parse::<f64>()
            .map_err(|_| malformed(format!("DEF{index} {subcommand}: '{text}' is not a number")))
    };

    let field = match subcommand {
        DefSubcommand::Arat => DefField::RatioExpression(first()?.to_string()),
        DefSubcommand::Rflt => DefField::LpfCutoff(float(first()?)?),
        DefSubcommand::Alrm => DefField::Alarm,
        DefSubcommand::Ratb => DefField::Baseline(float(first()?)?),
        DefSubcommand::Ins1 | DefSubcommand::Ins2 => {
            if values.len() > POLYNOMIAL_LEN {
                return Err(malformed(format!(
                    "DEF{index} {subcommand}: {} coefficients, at most {POLYNOMIAL_LEN} allowed",
                    values.len()
                )));
            }
            let coefficients = values
                .iter()
                .map(|v| float(*v))
                .collect::<AppResult<Vec<f64>>>()?;
            if subcommand == DefSubcommand::Ins1 {
                DefField::Ins1(coefficients)
            } else {
                DefField::Ins2(coefficients)
            }
        }
        DefSubcommand::Sube => DefField::SubtractEnabled(
            first()?
                .parse::<u8>()
                .ok()
                .filter(|v| *v <= 1)
                .ok_or_else(|| malformed(format!("DEF{index} SUBE must be 0 or 1: {remainder}")))?,
        ),
    };
    Ok(Response::Def { index, field })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(line: &str) -> Response {
        match parse_line(line).unwrap() {
            Reply::Response(response) => response,
            other => panic!("expected a RESP reply, got {other:?}"),
        }
    }

    #[test]
    fn early_classification_order() {
        assert_eq!(parse_line("\r\n").unwrap(), Reply::Blank);
        assert_eq!(parse_line(">").unwrap(), Reply::Prompt);
        assert!(matches!(
            parse_line("Unknown command: FOO").unwrap(),
            Reply::DeviceError(_)
        ));
        // Device error text wins over the STREAM check
        assert!(matches!(
            parse_line("ERROR: STREAM needs an argument").unwrap(),
            Reply::DeviceError(_)
        ));
        assert_eq!(parse_line("RESP: STREAM 10").unwrap(), Reply::StreamEcho);
        assert_eq!(parse_line("STREAM").unwrap(), Reply::StreamEcho);
    }

    #[test]
    fn no_space_is_malformed() {
        assert!(matches!(
            parse_line("GARBAGE"),
            Err(Cn0503Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn numeric_head_is_a_fragment() {
        assert!(matches!(parse_line("1E 28 32").unwrap(), Reply::Fragment(_)));
        assert!(matches!(parse_line("0.125 0.5").unwrap(), Reply::Fragment(_)));
        assert!(matches!(parse_line("ABCD 0001").unwrap(), Reply::Fragment(_)));
    }

    #[test]
    fn data_frames() {
        assert_eq!(
            parse_line("DATI 0A 14 1E 28\r\n").unwrap(),
            Reply::CodeSample(vec![10, 20, 30, 40])
        );
        assert_eq!(
            parse_line("DATF 0.5 1.25 -2").unwrap(),
            Reply::FloatSample(vec![0.5, 1.25, -2.0])
        );
        assert!(parse_line("DATI 0A ZZ").is_err());
        assert!(parse_line("DATF 1.0 nope").is_err());
    }

    #[test]
    fn non_resp_lines_are_ignored() {
        assert!(matches!(
            parse_line("Available commands:").unwrap(),
            Reply::NonResponse(_)
        ));
    }

    #[test]
    fn equals_separates_token_from_value() {
        assert_eq!(response("RESP: ODR?=2.500000"), Response::Odr(2.5));
        assert_eq!(response("RESP: ODR 0.5"), Response::Odr(0.5));
        assert_eq!(response("RESP: MODE?=RRAT"), Response::Mode(Mode::Rrat));
        assert_eq!(response("RESP: NUMRAT?=4"), Response::NumRat(4));
        assert!(parse_line("RESP: ODR=fast").is_err());
        assert!(parse_line("RESP: MODE=TURBO").is_err());
    }

    #[test]
    fn idle_values() {
        assert_eq!(
            response("RESP: IDLE=1"),
            Response::Idle(Some(DeviceState::Idle))
        );
        assert_eq!(
            response("RESP: IDLE?=0"),
            Response::Idle(Some(DeviceState::Streaming))
        );
        assert_eq!(response("RESP: IDLE=2"), Response::Idle(None));
    }

    #[test]
    fn register_echo_and_query() {
        assert_eq!(
            response("RESP: REG 10B 3FC"),
            Response::Register {
                address: "10B".into(),
                value: "03FC".into(),
                query: false
            }
        );
        assert_eq!(
            response("RESP: REG?=F 0"),
            Response::Register {
                address: "00F".into(),
                value: "0000".into(),
                query: true
            }
        );
        assert!(parse_line("RESP: REG 10B").is_err());
    }

    #[test]
    fn flash_replies() {
        assert_eq!(response("RESP: FL_APPLY 1"), Response::FlashApplied);
        assert_eq!(
            response("RESP: FL_DUMP REG 10B 03FC"),
            Response::FlashDump("REG 10B 03FC".into())
        );
        assert_eq!(
            response("RESP: FL_CLEARBUF 1"),
            Response::FlashOther("FL_CLEARBUF".into())
        );
    }

    #[test]
    fn indexed_tokens() {
        assert_eq!(
            response("RESP: PCB-LED2 80"),
            Response::LedAdjusted {
                led: "2".into(),
                value: "80".into()
            }
        );
        assert_eq!(
            response("RESP: CHANN1 FLUO"),
            Response::ChannelType {
                channel: "1".into(),
                value: "FLUO".into()
            }
        );
    }

    #[test]
    fn def_fields() {
        assert_eq!(
            response("RESP: DEF2 RATB=5.000000"),
            Response::Def {
                index: 2,
                field: DefField::Baseline(5.0)
            }
        );
        assert_eq!(
            response("RESP: DEF0? ARAT=A1#2048-A2#2048-/"),
            Response::Def {
                index: 0,
                field: DefField::RatioExpression("A1#2048-A2#2048-/".into())
            }
        );
        assert_eq!(
            response("RESP: DEF3 INS2 0 1 0.5"),
            Response::Def {
                index: 3,
                field: DefField::Ins2(vec![0.0, 1.0, 0.5])
            }
        );
        assert_eq!(
            response("RESP: DEF1 ALRM 1 2"),
            Response::Def {
                index: 1,
                field: DefField::Alarm
            }
        );
    }

    #[test]
    fn def_errors() {
        assert!(matches!(
            parse_line("RESP: DEF4 RATB 1.0"),
            Err(Cn0503Error::RatioIndexOutOfRange { index: 4, count: 4 })
        ));
        assert!(parse_line("RESP: DEF0 GAIN 1").is_err());
        assert!(parse_line("RESP: DEF0 RATB").is_err());
        assert!(parse_line("RESP: DEF0 SUBE 3").is_err());
        assert!(parse_line("RESP: DEF0 INS1 1 2 3 4 5 6 7").is_err());
    }

    #[test]
    fn unrecognized_tokens_are_errors() {
        assert!(matches!(
            parse_line("RESP: WHATEVER 1"),
            Err(Cn0503Error::MalformedPacket(_))
        ));
    }
}
