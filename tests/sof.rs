mod test_helpers;
use crate::test_helpers::*;

use usb_host_sim::control::Request;
use usb_host_sim::descriptor::lang_id;
use usb_host_sim::prelude::*;
use usb_host_sim::transaction::InResult;

#[test]
fn stuffing_heavy_frame_numbers_are_accepted() {
    let mut host = connected_host();

    // Frame numbers chosen for long runs of ones in the 11-bit field.
    for &frame in &[0x01, 0x04ff, 0x0512, 0x06e1, 0x0519] {
        host.send_sof(frame).expect("sof");
    }

    // The device is undisturbed and still enumerates.
    host.get_device_descriptor(&DEVICE_DESCRIPTOR).expect("get_descriptor");
}

#[test]
fn sof_between_every_stage_of_a_control_transfer() {
    let mut host = connected_host();
    host.set_device_address(0x20).expect("set_address");
    let addr = 0x20;

    let request = Request::get_string_descriptor(0, 0, 10);

    // SOF before Setup.
    host.send_sof(2).expect("sof");

    host.endpoints_mut().arm_control(0);
    host.engine_mut().send_token(Pid::Setup, addr, 0).expect("setup token");

    // SOF between the token and its DATA0 payload.
    host.send_sof(3).expect("sof");

    host.engine_mut()
        .send_data(Pid::Data0, &request.to_bytes())
        .expect("setup data");
    host.engine_mut().expect_ack().expect("setup ack");

    // SOF between the Setup and Data stages.
    host.send_sof(4).expect("sof");

    // Data stage: the 4-byte language table.
    let deadline = Deadline::after(host.engine().bus().now(), 12_000);
    let ep0_in = EndpointAddress::control(UsbDirection::In);
    match host.engine_mut().in_transaction(addr, ep0_in, deadline).expect("data") {
        InResult::Data(payload) => {
            assert_eq!(payload.as_slice(), &[4, 3, 0x09, 0x04][..]);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // SOF before Status.
    host.send_sof(5).expect("sof");

    host.transaction_status_out(addr).expect("status");

    // SOF traffic altered neither toggles nor halt state.
    assert!(!host.endpoints().is_halted(ep0_in));
    assert_eq!(host.endpoints().toggle(ep0_in), Pid::Data0);
}

#[test]
fn frame_numbers_spanning_the_counter_range() {
    let mut host = connected_host();
    for &frame in &[0x000, 0x001, 0x3ff, 0x400, 0x7fe, 0x7ff] {
        host.send_sof(frame).expect("sof");
    }
    host.get_device_descriptor(&DEVICE_DESCRIPTOR).expect("get_descriptor");
}

#[test]
fn automatic_sof_injection_does_not_break_transfers() {
    let mut host = connected_host();

    // A SOF every 50 us of simulated time, injected at inter-packet gaps.
    host.sof_every_us(50, 0);

    host.get_device_descriptor(&DEVICE_DESCRIPTOR).expect("get_descriptor");
    host.set_device_address(20).expect("set_address");
    host.get_device_descriptor(&DEVICE_DESCRIPTOR).expect("get_descriptor");
    host.get_string_descriptor(1, lang_id::ENGLISH_US, &usb_host_sim::descriptor::string_descriptor(MANUFACTURER))
        .expect("get string");

    host.stop_sof();
}

#[test]
fn sof_never_consumes_a_transaction_deadline() {
    let mut host = connected_host();
    host.set_device_address(20).expect("set_address");

    // Dense SOF schedule: one every 10 us, far more often than packets.
    host.sof_every_us(10, 0);

    // Transfers still complete; the injected traffic extends deadlines by
    // exactly the bus time it consumed.
    host.get_device_descriptor(&DEVICE_DESCRIPTOR).expect("get_descriptor");
}
