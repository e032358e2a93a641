mod test_helpers;
use crate::test_helpers::*;

use usb_host_sim::phy::RegisterBus;
use usb_host_sim::phy::UsbPhy;
use usb_host_sim::sim::{REG_ADDRESS, REG_PULLUP, REG_SCRATCH};

#[test]
fn pullup_register_controls_device_presence() {
    let mut host = connected_host();

    assert_eq!(host.phy_mut().read(REG_PULLUP).expect("read"), 1);

    host.phy_mut().write(REG_PULLUP, 0).expect("write");
    assert!(!host.phy().device_present());

    host.phy_mut().write(REG_PULLUP, 1).expect("write");
    assert!(host.phy().device_present());
    host.connect().expect("reconnect");
}

#[test]
fn scratch_register_round_trips() {
    let mut host = connected_host();

    // The scratch register carries its reset value until written.
    assert_eq!(host.phy_mut().read(REG_SCRATCH).expect("read"), 0x1234_5678);

    host.phy_mut().write(REG_SCRATCH, 0x42).expect("write");
    assert_eq!(host.phy_mut().read(REG_SCRATCH).expect("read"), 0x42);
}

#[test]
fn forcing_the_address_register_redirects_traffic() {
    let mut host = connected_host();

    // White-box address override, no SET_ADDRESS transfer involved.
    host.phy_mut().write(REG_ADDRESS, 28).expect("write");
    assert_eq!(host.phy_mut().read(REG_ADDRESS).expect("read"), 28);

    host.control_transfer_in(
        28,
        &usb_host_sim::control::Request::get_device_descriptor(18),
        &DEVICE_DESCRIPTOR,
    )
    .expect("traffic at the forced address");
}
