//! CN0503 ASCII wire protocol.
//!
//! Commands are `NAME[digit] args\n`. Replies are one line each: `DATI`/`DATF` data
//! frames, `RESP: TOKEN[=]value` acknowledgments, or free text.

pub mod command;
pub mod config_file;
pub mod reply;

pub use command::{DefSubcommand, FlashCommand};
pub use reply::{parse_line, DefField, Reply, Response};
