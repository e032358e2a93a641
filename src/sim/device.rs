//! Behavioral full-speed device model.
//!
//! Implements just enough device-side protocol for the engine and test
//! scenarios to have a conforming peer: EP0 standard requests served from a
//! [`DeviceModel`], scriptable response policy and data on the other
//! endpoints, per-endpoint data toggles and halt, and the SET_ADDRESS
//! pending-address latch that only takes effect once the Status stage
//! completes.

use std::collections::VecDeque;

use super::control_pipe::{ControlPipe, PipeIn, PipeOut, SetupOutcome};
use crate::control::{feature, standard_request, Recipient, Request, RequestType};
use crate::descriptor::DeviceModel;
use crate::endpoint::{EndpointAddress, EndpointResponse};
use crate::packet::{Packet, Pid};
use crate::UsbDirection;

/// Device-side registers for one endpoint.
struct EndpointReg {
    response: EndpointResponse,
    in_packets: VecDeque<Vec<u8>>,
    received: Vec<(Pid, Vec<u8>)>,
    toggle: Pid,
    halted: bool,
}

impl EndpointReg {
    fn new() -> EndpointReg {
        EndpointReg {
            response: EndpointResponse::Ack,
            in_packets: VecDeque::new(),
            received: Vec::new(),
            toggle: Pid::Data0,
            halted: false,
        }
    }

    fn reset(&mut self) {
        *self = EndpointReg::new();
    }
}

enum PendingData {
    None,
    Setup { endpoint: u8 },
    Out { ep: EndpointAddress },
}

/// The device under test, as a behavioral model.
pub struct SimDevice {
    model: DeviceModel,
    pullup: bool,
    address: u8,
    pending_address: Option<u8>,
    configuration: u8,
    control: ControlPipe,
    endpoints: [EndpointReg; 32],
    pending_data: PendingData,
    in_flight: Option<EndpointAddress>,
    vendor_buffer: Vec<u8>,
}

impl SimDevice {
    pub fn new(model: DeviceModel) -> SimDevice {
        let max_packet = model.max_packet_size_0() as usize;
        SimDevice {
            model,
            pullup: true,
            address: 0,
            pending_address: None,
            configuration: 0,
            control: ControlPipe::new(max_packet),
            endpoints: core::array::from_fn(|_| EndpointReg::new()),
            pending_data: PendingData::None,
            in_flight: None,
            vendor_buffer: Vec::new(),
        }
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    pub fn pullup(&self) -> bool {
        self.pullup
    }

    pub fn set_pullup(&mut self, pullup: bool) {
        self.pullup = pullup;
    }

    /// Address the device currently answers at.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// White-box override of the device address.
    pub fn force_address(&mut self, address: u8) {
        self.address = address & 0x7f;
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Scripts the handshake policy for a non-control endpoint.
    pub fn set_response(&mut self, ep: EndpointAddress, response: EndpointResponse) {
        self.reg_mut(ep).response = response;
    }

    /// Queues one IN packet's payload on an endpoint.
    pub fn queue_in(&mut self, ep: EndpointAddress, data: &[u8]) {
        self.reg_mut(ep).in_packets.push_back(data.to_vec());
    }

    pub fn clear_in(&mut self, ep: EndpointAddress) {
        self.reg_mut(ep).in_packets.clear();
    }

    /// Whether queued IN data is still waiting to be drained.
    pub fn in_pending(&self, ep: EndpointAddress) -> bool {
        !self.reg(ep).in_packets.is_empty()
    }

    /// DATA packets accepted on an OUT endpoint, in arrival order, with the
    /// data PID each arrived under.
    pub fn received(&self, ep: EndpointAddress) -> &[(Pid, Vec<u8>)] {
        &self.reg(ep).received
    }

    pub fn set_halted(&mut self, ep: EndpointAddress, halted: bool) {
        self.reg_mut(ep).halted = halted;
    }

    pub fn is_halted(&self, ep: EndpointAddress) -> bool {
        self.reg(ep).halted
    }

    /// Payload the host last wrote with a vendor OUT request.
    pub fn vendor_buffer(&self) -> &[u8] {
        &self.vendor_buffer
    }

    fn reg(&self, ep: EndpointAddress) -> &EndpointReg {
        &self.endpoints[u8::from(ep) as usize]
    }

    fn reg_mut(&mut self, ep: EndpointAddress) -> &mut EndpointReg {
        &mut self.endpoints[u8::from(ep) as usize]
    }

    /// Bus reset: back to the default state, address 0. The pull-up is a
    /// board-level property and survives.
    pub fn bus_reset(&mut self) {
        log::debug!("sim device: bus reset");
        self.address = 0;
        self.pending_address = None;
        self.configuration = 0;
        self.control.reset();
        self.pending_data = PendingData::None;
        self.in_flight = None;
        for reg in self.endpoints.iter_mut() {
            reg.reset();
        }
    }

    /// Hard reset over the DUT reset line.
    pub fn hard_reset(&mut self) {
        self.bus_reset();
        self.vendor_buffer.clear();
    }

    /// Feeds one decoded packet into the device; returns the packet the
    /// device answers with, if any.
    pub fn packet_in(&mut self, packet: &Packet) -> Option<Packet> {
        match packet {
            // SOF carries no transaction semantics: pending token state is
            // deliberately left untouched.
            Packet::Sof { .. } => None,

            Packet::Token { pid: Pid::Setup, address, endpoint } => {
                if *address == self.address {
                    self.pending_data = PendingData::Setup { endpoint: *endpoint };
                }
                None
            }
            Packet::Token { pid: Pid::Out, address, endpoint } => {
                if *address == self.address {
                    self.pending_data = PendingData::Out {
                        ep: EndpointAddress::from_parts(*endpoint, UsbDirection::Out),
                    };
                }
                None
            }
            Packet::Token { pid: Pid::In, address, endpoint } => {
                if *address != self.address {
                    return None;
                }
                self.in_token(*endpoint)
            }
            Packet::Token { .. } => None,

            Packet::Data { pid, payload } => self.data_in(*pid, payload),

            Packet::Handshake { pid: Pid::Ack } => {
                self.acknowledged();
                None
            }
            Packet::Handshake { .. } => None,
        }
    }

    fn in_token(&mut self, endpoint: u8) -> Option<Packet> {
        let ep = EndpointAddress::from_parts(endpoint, UsbDirection::In);

        if self.reg(ep).halted {
            return handshake(Pid::Stall);
        }
        if endpoint == 0 {
            return match self.control.in_token() {
                PipeIn::Data { pid, bytes } => data_packet(pid, &bytes),
                PipeIn::Nak => handshake(Pid::Nak),
                PipeIn::Stall => handshake(Pid::Stall),
            };
        }

        match self.reg(ep).response {
            EndpointResponse::Nak => handshake(Pid::Nak),
            EndpointResponse::Stall => handshake(Pid::Stall),
            EndpointResponse::Ack => {
                let toggle = self.reg(ep).toggle;
                match self.reg(ep).in_packets.front().cloned() {
                    Some(bytes) => {
                        self.in_flight = Some(ep);
                        data_packet(toggle, &bytes)
                    }
                    None => handshake(Pid::Nak),
                }
            }
        }
    }

    fn data_in(&mut self, pid: Pid, payload: &[u8]) -> Option<Packet> {
        match core::mem::replace(&mut self.pending_data, PendingData::None) {
            PendingData::Setup { endpoint } => {
                if pid != Pid::Data0 || payload.len() != 8 {
                    return None;
                }
                // A SETUP clears the halt on the addressed endpoint pair
                // before the request is even looked at.
                for dir in [UsbDirection::Out, UsbDirection::In].iter() {
                    self.reg_mut(EndpointAddress::from_parts(endpoint, *dir)).halted = false;
                }

                let request = Request::parse(payload).ok()?;
                let outcome = self.dispatch_setup(&request);
                self.control.start(&request, outcome);
                handshake(Pid::Ack)
            }
            PendingData::Out { ep } if ep.number() == 0 => {
                if self.reg(ep).halted {
                    return handshake(Pid::Stall);
                }
                match self.control.data_out(payload) {
                    PipeOut::Handshake(hs) => handshake(hs),
                    PipeOut::Complete(data) => {
                        self.vendor_buffer = data;
                        handshake(Pid::Ack)
                    }
                }
            }
            PendingData::Out { ep } => {
                if self.reg(ep).halted {
                    return handshake(Pid::Stall);
                }
                match self.reg(ep).response {
                    EndpointResponse::Nak => handshake(Pid::Nak),
                    EndpointResponse::Stall => handshake(Pid::Stall),
                    EndpointResponse::Ack => {
                        let reg = self.reg_mut(ep);
                        if pid == reg.toggle {
                            reg.received.push((pid, payload.to_vec()));
                            reg.toggle = reg.toggle.other_toggle();
                        }
                        // A repeated toggle is a retransmission: acknowledge
                        // and discard, per USB 8.6.3.
                        handshake(Pid::Ack)
                    }
                }
            }
            PendingData::None => None,
        }
    }

    fn acknowledged(&mut self) {
        if let Some(ep) = self.in_flight.take() {
            let reg = self.reg_mut(ep);
            reg.in_packets.pop_front();
            reg.toggle = reg.toggle.other_toggle();
            return;
        }
        if self.control.in_acked() {
            if let Some(address) = self.pending_address.take() {
                log::debug!("sim device: address {} -> {}", self.address, address);
                self.address = address;
            }
        }
    }

    fn dispatch_setup(&mut self, request: &Request) -> SetupOutcome {
        match request.request_type {
            RequestType::Standard => self.dispatch_standard(request),
            RequestType::Vendor => match request.direction {
                UsbDirection::Out => {
                    if request.length > 0 {
                        SetupOutcome::AcceptOut
                    } else {
                        SetupOutcome::NoData
                    }
                }
                UsbDirection::In => SetupOutcome::DataIn(self.vendor_buffer.clone()),
            },
            _ => SetupOutcome::Reject,
        }
    }

    fn dispatch_standard(&mut self, request: &Request) -> SetupOutcome {
        match (request.recipient, request.request) {
            (Recipient::Device, standard_request::GET_DESCRIPTOR) => {
                let descriptor = (request.value >> 8) as u8;
                let index = request.value as u8;
                match self.model.descriptor_bytes(descriptor, index) {
                    Some(bytes) => SetupOutcome::DataIn(bytes),
                    None => SetupOutcome::Reject,
                }
            }
            (Recipient::Device, standard_request::SET_ADDRESS) => {
                self.pending_address = Some(request.value as u8 & 0x7f);
                SetupOutcome::NoData
            }
            (Recipient::Device, standard_request::SET_CONFIGURATION) => {
                self.configuration = request.value as u8;
                for reg in self.endpoints.iter_mut().skip(2) {
                    reg.toggle = Pid::Data0;
                    reg.halted = false;
                }
                SetupOutcome::NoData
            }
            (Recipient::Device, standard_request::GET_CONFIGURATION) => {
                SetupOutcome::DataIn(vec![self.configuration])
            }
            (Recipient::Device, standard_request::GET_STATUS) => {
                SetupOutcome::DataIn(vec![0, 0])
            }
            (Recipient::Interface, standard_request::GET_STATUS) => {
                SetupOutcome::DataIn(vec![0, 0])
            }
            (Recipient::Endpoint, standard_request::GET_STATUS) => {
                let halted = self.reg(endpoint_from_index(request.index)).halted;
                SetupOutcome::DataIn(vec![halted as u8, 0])
            }
            (Recipient::Endpoint, standard_request::SET_FEATURE)
                if request.value == feature::ENDPOINT_HALT =>
            {
                self.reg_mut(endpoint_from_index(request.index)).halted = true;
                SetupOutcome::NoData
            }
            (Recipient::Endpoint, standard_request::CLEAR_FEATURE)
                if request.value == feature::ENDPOINT_HALT =>
            {
                let reg = self.reg_mut(endpoint_from_index(request.index));
                reg.halted = false;
                reg.toggle = Pid::Data0;
                SetupOutcome::NoData
            }
            _ => SetupOutcome::Reject,
        }
    }
}

fn endpoint_from_index(index: u16) -> EndpointAddress {
    let dir = if index & 0x80 != 0 { UsbDirection::In } else { UsbDirection::Out };
    EndpointAddress::from_parts(index as u8 & 0x0f, dir)
}

fn handshake(pid: Pid) -> Option<Packet> {
    Packet::handshake(pid).ok()
}

fn data_packet(pid: Pid, bytes: &[u8]) -> Option<Packet> {
    Packet::data(pid, bytes).ok()
}
