//! Memcached text protocol: tokenization and command dispatch.

mod handler;
mod parser;

pub use parser::{parse_i32, parse_i64, parse_u32, parse_u64, CommandLine, MAX_KEY_LEN, MAX_TOKENS};

pub(crate) use handler::{complete_nread, process_command};
