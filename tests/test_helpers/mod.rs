#![allow(dead_code)]

use usb_host_sim::descriptor::{lang_id, ConfigurationBuilder, DeviceDescriptor, DeviceModel};
use usb_host_sim::endpoint::EndpointType;
use usb_host_sim::prelude::*;
use usb_host_sim::sim::SimBus;

/// Canonical 18-byte device descriptor the model must return.
pub const DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, 0x01, 0x10, 0x02, 0x02, 0x00, 0x00, 0x40, 0x09, 0x12, 0xb1, 0x70, 0x01, 0x01, 0x01,
    0x02, 0x00, 0x01,
];

pub const MANUFACTURER: &str = "Test Vendor";
pub const PRODUCT: &str = "Sim Device";
/// Long enough that its string descriptor spans two 64-byte packets.
pub const SERIAL: &str = "Full Speed Device Bootloader v1.8.7-8-g1664f35";

pub fn model() -> DeviceModel {
    let device = DeviceDescriptor {
        usb_release: 0x0210,
        device_class: 0x02,
        device_sub_class: 0x00,
        device_protocol: 0x00,
        max_packet_size_0: 64,
        vendor_id: 0x1209,
        product_id: 0x70b1,
        device_release: 0x0101,
        manufacturer_index: 1,
        product_index: 2,
        serial_number_index: 0,
        num_configurations: 1,
    };

    let mut config = ConfigurationBuilder::new(1, 0x80, 50);
    config.interface(2, 0xff, 0x00, 0x00);
    config.endpoint(
        EndpointAddress::from_parts(1, UsbDirection::Out),
        EndpointType::Bulk,
        64,
        0,
    );
    config.endpoint(
        EndpointAddress::from_parts(1, UsbDirection::In),
        EndpointType::Bulk,
        64,
        0,
    );

    DeviceModel {
        device,
        configurations: vec![config.finish()],
        strings: vec![MANUFACTURER.into(), PRODUCT.into(), SERIAL.into()],
        lang_ids: vec![lang_id::ENGLISH_US],
    }
}

/// A host wired to a fresh sim device, reset and connected, with the EP0
/// packet size already known the way scenarios configure it up front.
pub fn connected_host() -> UsbHost<SimBus> {
    let config = HostConfig {
        max_packet_size: 64,
        ..HostConfig::default()
    };
    let mut host = UsbHost::new(SimBus::new(model()), config);
    host.reset().expect("reset");
    host.connect().expect("connect");
    host
}

pub fn ep_in(number: u8) -> EndpointAddress {
    EndpointAddress::from_parts(number, UsbDirection::In)
}

pub fn ep_out(number: u8) -> EndpointAddress {
    EndpointAddress::from_parts(number, UsbDirection::Out)
}
