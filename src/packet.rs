//! Packet construction and validation.
//!
//! A [`Packet`] is the unit the bus driver transmits and receives. CRC
//! fields are always derived: builders compute them while serializing and
//! [`Packet::parse`] verifies them while decoding, so no packet value ever
//! carries a CRC that disagrees with its fields.

use core::convert::TryFrom;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{codec, Result, UsbError};

/// Largest payload a DATA packet can carry (high-bandwidth isochronous
/// bound; full-speed endpoints negotiate 64 or less).
pub const MAX_DATA_PAYLOAD: usize = 1024;

/// Packet identifier, stored as the full PID byte with the check nibble
/// included, exactly as transmitted.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
pub enum Pid {
    Out = 0xe1,
    In = 0x69,
    Sof = 0xa5,
    Setup = 0x2d,
    Data0 = 0xc3,
    Data1 = 0x4b,
    Ack = 0xd2,
    Nak = 0x5a,
    Stall = 0x1e,
}

impl Pid {
    /// Decodes a PID byte.
    ///
    /// # Errors
    ///
    /// * [`Pid`](crate::UsbError::Pid) - The check nibble does not
    ///   complement the value nibble, or the PID is one this engine does not
    ///   speak (PING, SPLIT and the high-speed set).
    pub fn from_byte(byte: u8) -> Result<Pid> {
        if (byte >> 4) != (!byte & 0x0f) {
            return Err(UsbError::Pid);
        }
        Pid::try_from(byte).map_err(|_| UsbError::Pid)
    }

    pub fn is_token(self) -> bool {
        matches!(self, Pid::Setup | Pid::In | Pid::Out)
    }

    pub fn is_data(self) -> bool {
        matches!(self, Pid::Data0 | Pid::Data1)
    }

    pub fn is_handshake(self) -> bool {
        matches!(self, Pid::Ack | Pid::Nak | Pid::Stall)
    }

    /// The other data toggle value.
    ///
    /// # Panics
    ///
    /// Panics if `self` is not DATA0 or DATA1.
    pub fn other_toggle(self) -> Pid {
        match self {
            Pid::Data0 => Pid::Data1,
            Pid::Data1 => Pid::Data0,
            _ => panic!("not a data PID: {:?}", self),
        }
    }
}

/// Payload buffer of a DATA packet.
pub type Payload = heapless::Vec<u8, MAX_DATA_PAYLOAD>;

/// A decoded or to-be-transmitted USB packet.
#[derive(Clone, PartialEq, Debug)]
pub enum Packet {
    /// SETUP/IN/OUT token addressing a device endpoint.
    Token { pid: Pid, address: u8, endpoint: u8 },
    /// DATA0/DATA1 payload packet.
    Data { pid: Pid, payload: Payload },
    /// ACK/NAK/STALL handshake.
    Handshake { pid: Pid },
    /// Start-of-frame marker with an 11-bit frame number.
    Sof { frame: u16 },
}

impl Packet {
    /// Builds a SETUP/IN/OUT token.
    ///
    /// # Errors
    ///
    /// * [`InvalidField`](crate::UsbError::InvalidField) - Non-token PID,
    ///   address above 127 or endpoint above 15.
    pub fn token(pid: Pid, address: u8, endpoint: u8) -> Result<Packet> {
        if !pid.is_token() || address > 127 || endpoint > 15 {
            return Err(UsbError::InvalidField);
        }
        Ok(Packet::Token { pid, address, endpoint })
    }

    /// Builds a DATA0/DATA1 packet.
    ///
    /// # Errors
    ///
    /// * [`InvalidField`](crate::UsbError::InvalidField) - Non-data PID or a
    ///   payload above [`MAX_DATA_PAYLOAD`]. The negotiated per-endpoint
    ///   maximum is enforced by the transaction engine, not here.
    pub fn data(pid: Pid, payload: &[u8]) -> Result<Packet> {
        if !pid.is_data() {
            return Err(UsbError::InvalidField);
        }
        let payload = Payload::from_slice(payload).map_err(|_| UsbError::InvalidField)?;
        Ok(Packet::Data { pid, payload })
    }

    /// Builds an ACK/NAK/STALL handshake.
    ///
    /// # Errors
    ///
    /// * [`InvalidField`](crate::UsbError::InvalidField) - Non-handshake PID.
    pub fn handshake(pid: Pid) -> Result<Packet> {
        if !pid.is_handshake() {
            return Err(UsbError::InvalidField);
        }
        Ok(Packet::Handshake { pid })
    }

    /// Builds a start-of-frame packet.
    ///
    /// # Errors
    ///
    /// * [`InvalidField`](crate::UsbError::InvalidField) - Frame number above
    ///   11 bits.
    pub fn sof(frame: u16) -> Result<Packet> {
        if frame > 0x7ff {
            return Err(UsbError::InvalidField);
        }
        Ok(Packet::Sof { frame })
    }

    pub fn pid(&self) -> Pid {
        match self {
            Packet::Token { pid, .. } => *pid,
            Packet::Data { pid, .. } => *pid,
            Packet::Handshake { pid } => *pid,
            Packet::Sof { .. } => Pid::Sof,
        }
    }

    /// Serializes the packet to raw bytes (PID byte first), computing CRC
    /// fields as required.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::Token { pid, address, endpoint } => {
                let field = (*address as u16) | ((*endpoint as u16) << 7);
                token_bytes((*pid).into(), field)
            }
            Packet::Sof { frame } => token_bytes(Pid::Sof.into(), *frame),
            Packet::Data { pid, payload } => {
                let mut bytes = Vec::with_capacity(payload.len() + 3);
                bytes.push((*pid).into());
                bytes.extend_from_slice(payload);
                bytes.extend_from_slice(&codec::crc16(payload).to_le_bytes());
                bytes
            }
            Packet::Handshake { pid } => vec![(*pid).into()],
        }
    }

    /// Decodes and validates raw packet bytes: PID first, then the
    /// PID-specific field layout, then the CRC.
    ///
    /// # Errors
    ///
    /// * [`Pid`](crate::UsbError::Pid) - Check nibble mismatch or
    ///   unsupported PID.
    /// * [`Framing`](crate::UsbError::Framing) - Wrong byte count for the
    ///   packet class.
    /// * [`Crc`](crate::UsbError::Crc) - Embedded CRC5/CRC16 does not match
    ///   the fields. The packet is rejected, never corrected.
    pub fn parse(bytes: &[u8]) -> Result<Packet> {
        let pid = Pid::from_byte(*bytes.first().ok_or(UsbError::Framing)?)?;

        match pid {
            Pid::Setup | Pid::In | Pid::Out => {
                let field = token_field(pid, bytes)?;
                Ok(Packet::Token {
                    pid,
                    address: (field & 0x7f) as u8,
                    endpoint: ((field >> 7) & 0x0f) as u8,
                })
            }
            Pid::Sof => {
                let field = token_field(pid, bytes)?;
                Ok(Packet::Sof { frame: field })
            }
            Pid::Data0 | Pid::Data1 => {
                if bytes.len() < 3 || bytes.len() > MAX_DATA_PAYLOAD + 3 {
                    return Err(UsbError::Framing);
                }
                let payload = &bytes[1..bytes.len() - 2];
                let crc = u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
                if crc != codec::crc16(payload) {
                    return Err(UsbError::Crc);
                }
                // Length is bounded above, so the copy cannot fail.
                Ok(Packet::Data {
                    pid,
                    payload: Payload::from_slice(payload).map_err(|_| UsbError::Framing)?,
                })
            }
            Pid::Ack | Pid::Nak | Pid::Stall => {
                if bytes.len() != 1 {
                    return Err(UsbError::Framing);
                }
                Ok(Packet::Handshake { pid })
            }
        }
    }
}

fn token_bytes(pid: u8, field: u16) -> Vec<u8> {
    let crc = codec::crc5(field, 11);
    vec![pid, (field & 0xff) as u8, ((field >> 8) & 0x07) as u8 | (crc << 3)]
}

fn token_field(pid: Pid, bytes: &[u8]) -> Result<u16> {
    if bytes.len() != 3 {
        return Err(UsbError::Framing);
    }
    let field = (bytes[1] as u16) | (((bytes[2] & 0x07) as u16) << 8);
    if (bytes[2] >> 3) != codec::crc5(field, 11) {
        log::debug!("{:?} token CRC5 mismatch: {:02x?}", pid, bytes);
        return Err(UsbError::Crc);
    }
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_token_wire_bytes() {
        let token = Packet::token(Pid::Setup, 0, 0).unwrap();
        assert_eq!(token.to_bytes(), [0x2d, 0x00, 0x10]);
    }

    #[test]
    fn token_round_trip() {
        for &(addr, ep) in &[(0u8, 0u8), (20, 1), (127, 15), (11, 0)] {
            let token = Packet::token(Pid::In, addr, ep).unwrap();
            assert_eq!(Packet::parse(&token.to_bytes()).unwrap(), token);
        }
    }

    #[test]
    fn sof_round_trip() {
        for &frame in &[0u16, 0x001, 0x4ff, 0x512, 0x6e1, 0x519, 0x7ff] {
            let sof = Packet::sof(frame).unwrap();
            assert_eq!(Packet::parse(&sof.to_bytes()).unwrap(), sof);
        }
    }

    #[test]
    fn data_round_trip() {
        let data = Packet::data(Pid::Data1, &[0x12, 0x01, 0x10, 0x02]).unwrap();
        let bytes = data.to_bytes();
        assert_eq!(bytes[0], 0x4b);
        assert_eq!(Packet::parse(&bytes).unwrap(), data);
    }

    #[test]
    fn zero_length_data_has_zero_crc() {
        let zlp = Packet::data(Pid::Data1, &[]).unwrap();
        assert_eq!(zlp.to_bytes(), [0x4b, 0x00, 0x00]);
    }

    #[test]
    fn handshake_round_trip() {
        for &pid in &[Pid::Ack, Pid::Nak, Pid::Stall] {
            let hs = Packet::handshake(pid).unwrap();
            assert_eq!(Packet::parse(&hs.to_bytes()).unwrap(), hs);
        }
    }

    #[test]
    fn pid_check_nibble_is_enforced() {
        // 0x2f: SETUP value nibble with a corrupted check nibble.
        assert_eq!(Packet::parse(&[0x2f, 0x00, 0x10]), Err(UsbError::Pid));
        // PING has a valid check nibble but is not a full-speed PID we speak.
        assert_eq!(Pid::from_byte(0xb4), Err(UsbError::Pid));
    }

    #[test]
    fn corrupted_crc5_is_a_crc_error() {
        let mut bytes = Packet::token(Pid::Out, 20, 2).unwrap().to_bytes();
        bytes[2] ^= 0x80;
        assert_eq!(Packet::parse(&bytes), Err(UsbError::Crc));
    }

    #[test]
    fn corrupted_crc16_is_a_crc_error() {
        let mut bytes = Packet::data(Pid::Data0, &[1, 2, 3]).unwrap().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(Packet::parse(&bytes), Err(UsbError::Crc));
    }

    #[test]
    fn corrupted_payload_is_a_crc_error() {
        let mut bytes = Packet::data(Pid::Data0, &[1, 2, 3, 4]).unwrap().to_bytes();
        bytes[2] ^= 0x10;
        assert_eq!(Packet::parse(&bytes), Err(UsbError::Crc));
    }

    #[test]
    fn builders_validate_field_ranges() {
        assert_eq!(Packet::token(Pid::In, 128, 0), Err(UsbError::InvalidField));
        assert_eq!(Packet::token(Pid::In, 0, 16), Err(UsbError::InvalidField));
        assert_eq!(Packet::token(Pid::Ack, 0, 0), Err(UsbError::InvalidField));
        assert_eq!(Packet::sof(0x800), Err(UsbError::InvalidField));
        assert_eq!(Packet::handshake(Pid::Data0), Err(UsbError::InvalidField));
        assert_eq!(Packet::data(Pid::Ack, &[]), Err(UsbError::InvalidField));
    }

    #[test]
    fn truncated_token_is_a_framing_error() {
        assert_eq!(Packet::parse(&[0x2d, 0x00]), Err(UsbError::Framing));
        assert_eq!(Packet::parse(&[]), Err(UsbError::Framing));
    }
}
