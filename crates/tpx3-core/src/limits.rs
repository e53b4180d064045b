//! Shared hard limits and timing constants.
//!
//! Centralizing these keeps the reader loop, the buffer manager and the
//! control-plane client consistent and makes tuning a one-line change.

use std::time::Duration;

/// Maximum bytes a single acquisition buffer may occupy (16 GiB).
///
/// A misconfigured 4D mode can request essentially unbounded memory; the
/// buffer manager rejects anything above this before allocating.
pub const MAX_BUFFER_BYTES: usize = 16 * 1024 * 1024 * 1024;

/// Maximum bytes a single header-framed payload may declare (100 MiB).
pub const MAX_RECORD_BYTES: usize = 100 * 1024 * 1024;

/// Ceiling for one socket read in the streaming loops (64 KiB).
pub const RECV_CHUNK_BYTES: usize = 64 * 1024;

/// Read timeout inside the streaming loops.
///
/// The worker must never block indefinitely in `recv`; the stop flag is
/// observed on every timeout tick.
pub const SOCKET_POLL_TIMEOUT: Duration = Duration::from_millis(5);

/// Timeout for establishing the data-plane TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on one control-plane request/response round trip.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
