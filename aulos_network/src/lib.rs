//! Runtime machinery for the message model defined in the `aulos_proto` crate.
//!
//! This crate moves protocol messages over byte streams and datagram sockets,
//! and implements the stateful parts of the protocol:
//!
//! - [`transport`]: the non-blocking transport abstraction, with TCP, UDP and
//!   in-memory implementations,
//! - [`framer`]: incremental message framing over byte streams,
//! - [`correlator`]: request/response correlation and the per-connection
//!   worker loop,
//! - [`sync`]: clock synchronization between two independently clocked peers,
//! - [`audio`]: the audio delivery pipeline, from encrypted datagrams to
//!   drift-corrected playout, and its sending counterpart.
//!
//! Nothing here installs a logger: all diagnostics go through the [`log`]
//! facade.

pub mod audio;
pub mod config;
pub mod correlator;
pub mod framer;
pub mod sync;
pub mod transport;

pub use aulos_proto;
pub use aulos_utils;

/// Returns `true` if the given I/O error kind represents a timeout condition.
///
/// This treats both `WouldBlock` and `TimedOut` as timeout-equivalent, which
/// is useful when working with non-blocking or socket-based transports.
#[inline(always)]
pub(crate) fn io_err_is_timeout(e: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    [WouldBlock, TimedOut].contains(&e)
}
