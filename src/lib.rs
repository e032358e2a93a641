//! Host-side USB 1.1/2.0 full-speed protocol engine for exercising simulated
//! device cores.
//!
//! The crate is organized leaves-first:
//!
//! - [`codec`] - NRZI, bit-stuffing and the USB CRC pair.
//! - [`packet`] - packet construction and validation over raw bytes.
//! - [`phy`] - the signal-level seam to the simulation environment.
//! - [`bus`] - bit-by-bit packet transmission and reception, SOF scheduling.
//! - [`endpoint`] - per-endpoint expected device state.
//! - [`transaction`] - token/data/handshake exchanges with NAK retry.
//! - [`control`] - SETUP payload layout and standard request templates.
//! - [`host`] - control-transfer sequencing and the device session.
//! - [`descriptor`] - canonical descriptor byte synthesis.
//! - [`sim`] - a behavioral full-speed device for engine-level tests.

/// Errors raised while driving or checking bus traffic.
///
/// Framing, PID and CRC violations are never retried by the engine: they
/// indicate a protocol violation by the device under test and always
/// propagate to the calling scenario. NAK is the only condition the engine
/// recovers from internally, bounded by a deadline.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UsbError {
    /// Illegal bit-stuffing, a malformed sync pattern, a mid-packet SE0, or
    /// a packet that does not divide into whole bytes.
    Framing,
    /// The PID check nibble did not complement the PID value, or the PID is
    /// not one the engine supports.
    Pid,
    /// A token CRC5 or data CRC16 did not match the received fields.
    Crc,
    /// An out-of-range field was passed to a packet builder or engine
    /// operation (address > 127, endpoint > 15, oversized payload).
    InvalidField,
    /// The bus stayed idle past the turnaround window: the device sent
    /// nothing at all.
    NoResponse,
    /// A deadline elapsed before the expected event occurred.
    Timeout,
    /// The device answered with a handshake other than the scripted
    /// expectation.
    UnexpectedHandshake,
    /// Data arrived out of sequence order: a DATA toggle value, or a control
    /// stage, that does not match the transfer state.
    Sequence,
    /// A response payload differed from the scripted expectation.
    Mismatch,
}

pub type Result<T> = core::result::Result<T, UsbError>;

/// Direction of a USB transfer, seen from the host.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UsbDirection {
    /// Host to device.
    Out = 0,
    /// Device to host.
    In = 1,
}

pub mod bus;
pub mod codec;
pub mod control;
pub mod descriptor;
pub mod endpoint;
pub mod host;
pub mod packet;
pub mod phy;
pub mod sim;
pub mod transaction;

pub mod prelude {
    pub use crate::endpoint::{EndpointAddress, EndpointResponse};
    pub use crate::host::{HostConfig, UsbHost};
    pub use crate::packet::Pid;
    pub use crate::phy::{Deadline, Ticks};
    pub use crate::{UsbDirection, UsbError};
}
