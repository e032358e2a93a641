//! Canonical descriptor byte synthesis.
//!
//! The engine itself never interprets descriptors; it only needs a provider
//! that, given a descriptor specification, yields the canonical byte arrays
//! a conforming device must return. [`DeviceModel`] is that provider: tests
//! build one from field values, hand it to the behavioral device, and assert
//! control transfers return exactly its bytes.

use crate::endpoint::{EndpointAddress, EndpointType};
use crate::UsbDirection;

pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
}

pub mod lang_id {
    pub const ENGLISH_US: u16 = 0x0409;
}

/// Field-level device descriptor specification.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    pub usb_release: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// The canonical 18-byte wire form.
    pub fn bytes(&self) -> [u8; 18] {
        [
            18,
            descriptor_type::DEVICE,
            self.usb_release as u8,
            (self.usb_release >> 8) as u8,
            self.device_class,
            self.device_sub_class,
            self.device_protocol,
            self.max_packet_size_0,
            self.vendor_id as u8,
            (self.vendor_id >> 8) as u8,
            self.product_id as u8,
            (self.product_id >> 8) as u8,
            self.device_release as u8,
            (self.device_release >> 8) as u8,
            self.manufacturer_index,
            self.product_index,
            self.serial_number_index,
            self.num_configurations,
        ]
    }
}

/// Builds a complete configuration descriptor (configuration header plus
/// interface and endpoint descriptors) with wTotalLength and bNumInterfaces
/// computed at the end, the way the host reads it back in one GET_DESCRIPTOR.
pub struct ConfigurationBuilder {
    buf: Vec<u8>,
    interfaces: u8,
}

impl ConfigurationBuilder {
    pub fn new(value: u8, attributes: u8, max_power: u8) -> ConfigurationBuilder {
        ConfigurationBuilder {
            buf: vec![
                9,
                descriptor_type::CONFIGURATION,
                0, // wTotalLength, patched in finish()
                0,
                0, // bNumInterfaces, patched in finish()
                value,
                0, // iConfiguration
                attributes,
                max_power,
            ],
            interfaces: 0,
        }
    }

    /// Appends an interface descriptor and returns its number.
    pub fn interface(&mut self, num_endpoints: u8, class: u8, sub_class: u8, protocol: u8) -> u8 {
        let number = self.interfaces;
        self.interfaces += 1;
        self.buf.extend_from_slice(&[
            9,
            descriptor_type::INTERFACE,
            number,
            0, // bAlternateSetting
            num_endpoints,
            class,
            sub_class,
            protocol,
            0, // iInterface
        ]);
        number
    }

    /// Appends an endpoint descriptor.
    pub fn endpoint(
        &mut self,
        address: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
        interval: u8,
    ) {
        let dir_bit = match address.direction() {
            UsbDirection::In => 0x80,
            UsbDirection::Out => 0x00,
        };
        self.buf.extend_from_slice(&[
            7,
            descriptor_type::ENDPOINT,
            address.number() | dir_bit,
            ep_type as u8,
            max_packet_size as u8,
            (max_packet_size >> 8) as u8,
            interval,
        ]);
    }

    pub fn finish(mut self) -> Vec<u8> {
        let total = self.buf.len() as u16;
        self.buf[2] = total as u8;
        self.buf[3] = (total >> 8) as u8;
        self.buf[4] = self.interfaces;
        self.buf
    }
}

/// Encodes a string descriptor as UTF-16LE with the length/type header.
pub fn string_descriptor(s: &str) -> Vec<u8> {
    let mut buf = vec![0, descriptor_type::STRING];
    for unit in s.encode_utf16() {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf[0] = buf.len() as u8;
    buf
}

/// Encodes string descriptor zero, the language ID table.
pub fn lang_descriptor(lang_ids: &[u16]) -> Vec<u8> {
    let mut buf = vec![0, descriptor_type::STRING];
    for lang in lang_ids {
        buf.extend_from_slice(&lang.to_le_bytes());
    }
    buf[0] = buf.len() as u8;
    buf
}

/// Descriptor provider: canonical byte arrays for one device specification,
/// plus the derived fields the engine needs.
#[derive(Clone, Debug)]
pub struct DeviceModel {
    pub device: DeviceDescriptor,
    pub configurations: Vec<Vec<u8>>,
    /// String descriptors by index, starting at index 1.
    pub strings: Vec<String>,
    pub lang_ids: Vec<u16>,
}

impl DeviceModel {
    /// EP0 maximum packet size the device reports.
    pub fn max_packet_size_0(&self) -> u8 {
        self.device.max_packet_size_0
    }

    pub fn device_bytes(&self) -> [u8; 18] {
        self.device.bytes()
    }

    pub fn configuration_bytes(&self, index: u8) -> Option<&[u8]> {
        self.configurations.get(index as usize).map(|c| c.as_slice())
    }

    pub fn string_bytes(&self, index: u8) -> Option<Vec<u8>> {
        if index == 0 {
            return Some(lang_descriptor(&self.lang_ids));
        }
        self.strings
            .get(index as usize - 1)
            .map(|s| string_descriptor(s))
    }

    /// The canonical bytes for a GET_DESCRIPTOR request, or `None` when a
    /// conforming device would STALL.
    pub fn descriptor_bytes(&self, descriptor: u8, index: u8) -> Option<Vec<u8>> {
        match descriptor {
            descriptor_type::DEVICE if index == 0 => Some(self.device_bytes().to_vec()),
            descriptor_type::CONFIGURATION => self.configuration_bytes(index).map(|c| c.to_vec()),
            descriptor_type::STRING => self.string_bytes(index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fomu_style_device() -> DeviceDescriptor {
        DeviceDescriptor {
            usb_release: 0x0210,
            device_class: 0x02,
            device_sub_class: 0x00,
            device_protocol: 0x00,
            max_packet_size_0: 0x40,
            vendor_id: 0x1209,
            product_id: 0x70b1,
            device_release: 0x0101,
            manufacturer_index: 1,
            product_index: 2,
            serial_number_index: 0,
            num_configurations: 1,
        }
    }

    #[test]
    fn device_descriptor_canonical_bytes() {
        assert_eq!(
            fomu_style_device().bytes(),
            [
                0x12, 0x01, 0x10, 0x02, 0x02, 0x00, 0x00, 0x40, 0x09, 0x12, 0xb1, 0x70, 0x01,
                0x01, 0x01, 0x02, 0x00, 0x01,
            ]
        );
    }

    #[test]
    fn configuration_total_length() {
        let mut builder = ConfigurationBuilder::new(1, 0x80, 50);
        builder.interface(2, 0xff, 0, 0);
        builder.endpoint(
            EndpointAddress::from_parts(1, UsbDirection::Out),
            EndpointType::Bulk,
            64,
            0,
        );
        builder.endpoint(
            EndpointAddress::from_parts(1, UsbDirection::In),
            EndpointType::Bulk,
            64,
            0,
        );
        let bytes = builder.finish();

        assert_eq!(bytes.len(), 9 + 9 + 7 + 7);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), bytes.len() as u16);
        assert_eq!(bytes[4], 1); // bNumInterfaces
        assert_eq!(bytes[9 + 9 + 2], 0x01); // OUT endpoint address
        assert_eq!(bytes[9 + 9 + 7 + 2], 0x81); // IN endpoint address
    }

    #[test]
    fn string_encoding_is_utf16le() {
        let bytes = string_descriptor("Fomu");
        assert_eq!(bytes[0] as usize, bytes.len());
        assert_eq!(bytes[1], descriptor_type::STRING);
        assert_eq!(&bytes[2..], &[0x46, 0x00, 0x6f, 0x00, 0x6d, 0x00, 0x75, 0x00]);
    }

    #[test]
    fn lang_table() {
        assert_eq!(lang_descriptor(&[lang_id::ENGLISH_US]), vec![4, 3, 0x09, 0x04]);
    }

    #[test]
    fn unknown_descriptor_yields_none() {
        let model = DeviceModel {
            device: fomu_style_device(),
            configurations: vec![],
            strings: vec![],
            lang_ids: vec![lang_id::ENGLISH_US],
        };
        // A device descriptor with a non-zero index is the classic invalid
        // request a conforming device STALLs.
        assert_eq!(model.descriptor_bytes(descriptor_type::DEVICE, 1), None);
    }
}
