//! SETUP payload layout and standard request templates.
//!
//! A [`Request`] is the 8-byte payload of a control transfer's Setup stage.
//! The engine builds them from the template constructors and serializes with
//! [`Request::to_bytes`]; the behavioral device model parses them back with
//! [`Request::parse`].

use crate::descriptor::descriptor_type;
use crate::{Result, UsbDirection, UsbError};

/// Request type, the bmRequestType bits 5..6.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Request recipient, the bmRequestType bits 0..4.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    Reserved = 4,
}

/// A parsed or to-be-sent control request.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Request {
    /// Direction of the data (and therefore status) stage, bmRequestType
    /// bit 7. `In` means device-to-host.
    pub direction: UsbDirection,
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl Request {
    /// Parses an 8-byte SETUP payload.
    ///
    /// # Errors
    ///
    /// * [`InvalidField`](crate::UsbError::InvalidField) - Payload is not
    ///   exactly 8 bytes.
    pub fn parse(buf: &[u8]) -> Result<Request> {
        if buf.len() != 8 {
            return Err(UsbError::InvalidField);
        }

        let rt = buf[0];

        Ok(Request {
            direction: if rt & 0x80 != 0 { UsbDirection::In } else { UsbDirection::Out },
            request_type: match (rt >> 5) & 0b11 {
                0 => RequestType::Standard,
                1 => RequestType::Class,
                2 => RequestType::Vendor,
                _ => RequestType::Reserved,
            },
            recipient: match rt & 0b11111 {
                0 => Recipient::Device,
                1 => Recipient::Interface,
                2 => Recipient::Endpoint,
                3 => Recipient::Other,
                _ => Recipient::Reserved,
            },
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    /// Serializes to the exact bmRequestType/bRequest/wValue/wIndex/wLength
    /// wire layout.
    pub fn to_bytes(&self) -> [u8; 8] {
        let rt = ((self.direction as u8) << 7)
            | ((self.request_type as u8) << 5)
            | match self.recipient {
                Recipient::Device => 0,
                Recipient::Interface => 1,
                Recipient::Endpoint => 2,
                Recipient::Other => 3,
                Recipient::Reserved => 31,
            };

        let mut bytes = [0u8; 8];
        bytes[0] = rt;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&self.value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    /// GET_DESCRIPTOR for a descriptor type and index. `index` is the
    /// language ID for string descriptors and zero otherwise.
    pub fn get_descriptor(descriptor: u8, descriptor_index: u8, index: u16, length: u16) -> Request {
        Request {
            direction: UsbDirection::In,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: standard_request::GET_DESCRIPTOR,
            value: ((descriptor as u16) << 8) | descriptor_index as u16,
            index,
            length,
        }
    }

    /// GET_DESCRIPTOR(DEVICE) for the canonical 18-byte device descriptor.
    pub fn get_device_descriptor(length: u16) -> Request {
        Request::get_descriptor(descriptor_type::DEVICE, 0, 0, length)
    }

    pub fn get_configuration_descriptor(index: u8, length: u16) -> Request {
        Request::get_descriptor(descriptor_type::CONFIGURATION, index, 0, length)
    }

    pub fn get_string_descriptor(index: u8, lang_id: u16, length: u16) -> Request {
        Request::get_descriptor(descriptor_type::STRING, index, lang_id, length)
    }

    pub fn set_address(address: u8) -> Request {
        Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: standard_request::SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    pub fn set_configuration(value: u8) -> Request {
        Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: standard_request::SET_CONFIGURATION,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub fn get_configuration() -> Request {
        Request {
            direction: UsbDirection::In,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: standard_request::GET_CONFIGURATION,
            value: 0,
            index: 0,
            length: 1,
        }
    }

    pub fn get_status(recipient: Recipient, index: u16) -> Request {
        Request {
            direction: UsbDirection::In,
            request_type: RequestType::Standard,
            recipient,
            request: standard_request::GET_STATUS,
            value: 0,
            index,
            length: 2,
        }
    }

    pub fn set_feature(recipient: Recipient, feature: u16, index: u16) -> Request {
        Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Standard,
            recipient,
            request: standard_request::SET_FEATURE,
            value: feature,
            index,
            length: 0,
        }
    }

    pub fn clear_feature(recipient: Recipient, feature: u16, index: u16) -> Request {
        Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Standard,
            recipient,
            request: standard_request::CLEAR_FEATURE,
            value: feature,
            index,
            length: 0,
        }
    }
}

pub mod standard_request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
    pub const SYNCH_FRAME: u8 = 12;
}

pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_device_descriptor_layout() {
        assert_eq!(
            Request::get_device_descriptor(0x40).to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00]
        );
        assert_eq!(
            Request::get_device_descriptor(18).to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
    }

    #[test]
    fn get_string_descriptor_layout() {
        assert_eq!(
            Request::get_string_descriptor(2, 0x0409, 0x00ff).to_bytes(),
            [0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0xff, 0x00]
        );
    }

    #[test]
    fn set_address_layout() {
        assert_eq!(
            Request::set_address(11).to_bytes(),
            [0x00, 0x05, 11, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn set_feature_endpoint_halt_layout() {
        let req = Request::set_feature(Recipient::Endpoint, feature::ENDPOINT_HALT, 0x0001);
        assert_eq!(req.to_bytes(), [0x02, 0x03, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn parse_round_trip() {
        let req = Request::get_string_descriptor(1, 0x0409, 10);
        assert_eq!(Request::parse(&req.to_bytes()).unwrap(), req);

        let req = Request::set_configuration(1);
        assert_eq!(Request::parse(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(Request::parse(&[0x80, 0x06]), Err(UsbError::InvalidField));
    }
}
