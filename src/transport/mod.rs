//! Transport module - dialing and stream plumbing.
//!
//! A connection runs over any ordered, bidirectional byte stream. TCP is
//! the usual transport; tests and custom setups can hand in anything that
//! implements `AsyncRead + AsyncWrite`.

mod tcp;

pub use tcp::{dial, split_stream, BoxedReader, BoxedWriter, Transport};
