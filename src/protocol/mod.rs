//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the text-line protocol spoken with the broker:
//! - control-line keywords and argument parsing
//! - the [`Frame`] enum with its encoder
//! - [`FrameReader`] for decoding frames from a buffered stream

mod frame;
mod reader;
mod wire_format;

pub use frame::Frame;
pub use reader::{read_frame, FrameReader};
pub use wire_format::{
    is_delimiter, keyword_len, keywords, parse_err_args, parse_info_args, parse_msg_args,
    ConnectOptions, MsgHeader, CRLF, DEFAULT_MAX_PAYLOAD_SIZE, MAX_CONTROL_LINE,
};
