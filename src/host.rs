//! The host: device session tracking and the control-transfer sequencer.
//!
//! [`UsbHost`] is what a test scenario holds. It owns the transaction engine
//! and a scenario-scoped [`DeviceSession`], composes Setup/Data/Status
//! stages into the standard named operations, and applies the session rules
//! the USB spec makes subtle - most notably that a SET_ADDRESS only takes
//! effect after its Status stage is acknowledged.

use crate::bus::{BusConfig, BusDriver};
use crate::control::{feature, Recipient, Request};
use crate::endpoint::{EndpointAddress, EndpointSet};
use crate::packet::Pid;
use crate::phy::{us, Deadline, Ticks, UsbPhy};
use crate::transaction::{EngineConfig, InResult, OutResult, TransactionEngine};
use crate::{Result, UsbDirection, UsbError};

/// Timing and sizing knobs for a host instance.
#[derive(Copy, Clone, Debug)]
pub struct HostConfig {
    /// EP0 maximum packet size assumed until a device descriptor is read.
    /// The USB default before enumeration is 8.
    pub max_packet_size: u16,
    /// Budget for a single response packet, in bit times.
    pub packet_timeout: Ticks,
    /// NAK retry budget per transaction, in bit times.
    pub retry_timeout: Ticks,
    /// Idle bits after which a wait reports no response.
    pub turnaround_timeout: u32,
    /// Idle bits held before each transmission.
    pub interpacket_gap: u32,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            max_packet_size: 8,
            packet_timeout: us(200),
            retry_timeout: us(10_000),
            turnaround_timeout: 18,
            interpacket_gap: 4,
        }
    }
}

/// Scenario-scoped state of the device under test, as the host believes it
/// to be. Created fresh for each scenario and destroyed on reset.
#[derive(Copy, Clone, Debug)]
pub struct DeviceSession {
    /// Address the device currently answers at. Address 0 after any reset;
    /// updated by SET_ADDRESS only once its Status stage is acknowledged.
    pub current_address: u8,
    /// EP0 maximum packet size the device reported (or the configured
    /// default until one is read).
    pub max_packet_size_0: u16,
    /// Whether the device pull-up has been observed.
    pub connected: bool,
    /// Configuration selected by a completed SET_CONFIGURATION.
    pub configuration: Option<u8>,
}

impl DeviceSession {
    fn new(max_packet_size_0: u16) -> DeviceSession {
        DeviceSession {
            current_address: 0,
            max_packet_size_0,
            connected: false,
            configuration: None,
        }
    }
}

/// Host-side protocol engine bound to one device under test.
pub struct UsbHost<P: UsbPhy> {
    engine: TransactionEngine<P>,
    session: DeviceSession,
    config: HostConfig,
}

impl<P: UsbPhy> UsbHost<P> {
    pub fn new(phy: P, config: HostConfig) -> UsbHost<P> {
        let bus = BusDriver::new(
            phy,
            BusConfig {
                turnaround_timeout: config.turnaround_timeout,
                interpacket_gap: config.interpacket_gap,
            },
        );
        let engine = TransactionEngine::new(
            bus,
            EngineConfig {
                packet_timeout: config.packet_timeout,
            },
        );
        UsbHost {
            engine,
            session: DeviceSession::new(config.max_packet_size),
            config,
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn engine(&self) -> &TransactionEngine<P> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TransactionEngine<P> {
        &mut self.engine
    }

    pub fn endpoints(&self) -> &EndpointSet {
        self.engine.endpoints()
    }

    pub fn endpoints_mut(&mut self) -> &mut EndpointSet {
        self.engine.endpoints_mut()
    }

    pub fn phy(&self) -> &P {
        self.engine.bus().phy()
    }

    pub fn phy_mut(&mut self) -> &mut P {
        self.engine.bus_mut().phy_mut()
    }

    /// Overrides the EP0 packet size used for chunking, as a scenario does
    /// when it knows the descriptor ahead of reading it.
    pub fn set_max_packet_size(&mut self, size: u16) {
        self.session.max_packet_size_0 = size;
    }

    /// Suspends for `n` microseconds of simulated time with the bus idle.
    pub fn wait_us(&mut self, n: u64) {
        self.engine.bus_mut().wait_ticks(us(n));
    }

    /// Pulses the DUT reset line and starts a fresh session: address 0, no
    /// configuration, all endpoint state discarded.
    pub fn reset(&mut self) -> Result<()> {
        log::info!("asserting DUT reset");
        self.engine.bus_mut().phy_mut().set_reset(true);
        self.engine.bus_mut().wait_ticks(us(1));
        self.engine.bus_mut().phy_mut().set_reset(false);
        self.engine.bus_mut().wait_ticks(us(1));

        self.session = DeviceSession::new(self.config.max_packet_size);
        self.engine.reset_endpoints();
        Ok(())
    }

    /// Waits for the device pull-up and marks the session connected.
    ///
    /// # Errors
    ///
    /// * [`Timeout`](crate::UsbError::Timeout) - No pull-up within the retry
    ///   budget.
    pub fn connect(&mut self) -> Result<()> {
        let deadline = Deadline::after(self.engine.bus().now(), self.config.retry_timeout);
        while !self.engine.bus().phy().device_present() {
            if deadline.expired(self.engine.bus().now()) {
                log::error!("no device pull-up observed");
                return Err(UsbError::Timeout);
            }
            self.engine.bus_mut().wait_ticks(1);
        }
        self.engine.bus_mut().wait_ticks(8);
        self.session.connected = true;
        log::info!("device connected");
        Ok(())
    }

    /// Forgets the session, as after a detach.
    pub fn disconnect(&mut self) {
        self.session = DeviceSession::new(self.config.max_packet_size);
        self.engine.reset_endpoints();
    }

    /// Drives a bus reset (SE0) for `duration_us` and returns the session to
    /// its default state: the device answers at address 0 afterwards.
    pub fn port_reset(&mut self, duration_us: u64) -> Result<()> {
        log::info!("port reset for {} us", duration_us);
        self.engine.bus_mut().drive_reset(us(duration_us));
        self.session.current_address = 0;
        self.session.configuration = None;
        self.engine.reset_endpoints();
        Ok(())
    }

    /// Sends a single SOF marker. May be interleaved between the stages of
    /// an ongoing transfer; SOF never expects a response.
    pub fn send_sof(&mut self, frame: u16) -> Result<()> {
        self.engine.send_sof(frame)
    }

    /// Starts injecting SOF markers every `period_us`, at inter-packet gaps
    /// only, without consuming in-flight transaction deadlines.
    pub fn sof_every_us(&mut self, period_us: u64, start_frame: u16) {
        self.engine.bus_mut().schedule_sof(us(period_us), start_frame);
    }

    pub fn stop_sof(&mut self) {
        self.engine.bus_mut().cancel_sof();
    }

    fn retry_deadline(&self) -> Deadline {
        Deadline::after(self.engine.bus().now(), self.config.retry_timeout)
    }

    /// Drives a SETUP transaction on endpoint 0.
    pub fn transaction_setup(&mut self, address: u8, request: &Request) -> Result<()> {
        self.engine.setup_transaction(address, 0, request)
    }

    /// Reads `expected` back from an endpoint in max-packet chunks,
    /// asserting each DATA payload. An empty `expected` reads a single
    /// zero-length packet.
    pub fn transaction_data_in(
        &mut self,
        address: u8,
        ep: EndpointAddress,
        expected: &[u8],
        chunk_size: Option<usize>,
    ) -> Result<()> {
        let chunk_size = chunk_size.unwrap_or(self.session.max_packet_size_0 as usize);

        if expected.is_empty() {
            return self.expect_in_payload(address, ep, &[]);
        }
        for chunk in expected.chunks(chunk_size) {
            self.expect_in_payload(address, ep, chunk)?;
        }
        Ok(())
    }

    fn expect_in_payload(&mut self, address: u8, ep: EndpointAddress, expected: &[u8]) -> Result<()> {
        let deadline = self.retry_deadline();
        match self.engine.in_transaction(address, ep, deadline)? {
            InResult::Data(payload) => {
                if payload.as_slice() != expected {
                    log::error!(
                        "IN payload mismatch on {}:{}: expected {:02x?}, got {:02x?}",
                        address,
                        ep.number(),
                        expected,
                        payload
                    );
                    return Err(UsbError::Mismatch);
                }
                Ok(())
            }
            InResult::Stalled => {
                log::error!("IN {}:{} stalled", address, ep.number());
                Err(UsbError::UnexpectedHandshake)
            }
        }
    }

    /// Writes `data` to an endpoint in max-packet chunks, requiring an ACK
    /// for each. An empty `data` writes a single zero-length packet.
    pub fn transaction_data_out(
        &mut self,
        address: u8,
        ep: EndpointAddress,
        data: &[u8],
        chunk_size: Option<usize>,
    ) -> Result<()> {
        let chunk_size = chunk_size.unwrap_or(self.session.max_packet_size_0 as usize);

        if data.is_empty() {
            return self.expect_out_acked(address, ep, &[]);
        }
        for chunk in data.chunks(chunk_size) {
            self.expect_out_acked(address, ep, chunk)?;
        }
        Ok(())
    }

    fn expect_out_acked(&mut self, address: u8, ep: EndpointAddress, chunk: &[u8]) -> Result<()> {
        let deadline = self.retry_deadline();
        match self.engine.out_transaction(address, ep, chunk, deadline)? {
            OutResult::Acked => Ok(()),
            OutResult::Stalled => {
                log::error!("OUT {}:{} stalled", address, ep.number());
                Err(UsbError::UnexpectedHandshake)
            }
        }
    }

    /// Status stage of an IN transfer: a zero-length OUT, always DATA1.
    pub fn transaction_status_out(&mut self, address: u8) -> Result<()> {
        let ep = EndpointAddress::control(UsbDirection::Out);
        self.engine.endpoints_mut().set_toggle(ep, Pid::Data1);
        self.expect_out_acked(address, ep, &[])
    }

    /// Status stage of an OUT transfer: a zero-length IN, always DATA1.
    pub fn transaction_status_in(&mut self, address: u8) -> Result<()> {
        let ep = EndpointAddress::control(UsbDirection::In);
        self.engine.endpoints_mut().set_toggle(ep, Pid::Data1);
        self.expect_in_payload(address, ep, &[])
    }

    /// Runs an IN control transfer: Setup stage, IN data stage accumulating
    /// until `wLength` bytes or a short packet, then the zero-length OUT
    /// status stage. The accumulated bytes are asserted against `expected`;
    /// a prefix match is accepted for reads the device cut short.
    ///
    /// Returns the accumulated data-stage bytes.
    pub fn control_transfer_in(
        &mut self,
        address: u8,
        request: &Request,
        expected: &[u8],
    ) -> Result<Vec<u8>> {
        if request.direction != UsbDirection::In {
            log::error!("control_transfer_in with an OUT request");
            return Err(UsbError::Sequence);
        }

        self.transaction_setup(address, request)?;

        let mut accumulated = Vec::new();
        if request.length > 0 {
            let ep = EndpointAddress::control(UsbDirection::In);
            let max_packet = self.session.max_packet_size_0 as usize;
            loop {
                let deadline = self.retry_deadline();
                match self.engine.in_transaction(address, ep, deadline)? {
                    InResult::Data(payload) => {
                        let short = payload.len() < max_packet;
                        accumulated.extend_from_slice(&payload);
                        if short || accumulated.len() >= request.length as usize {
                            break;
                        }
                    }
                    InResult::Stalled => {
                        log::error!("control request {:02x?} stalled", request.to_bytes());
                        return Err(UsbError::UnexpectedHandshake);
                    }
                }
            }
        }

        if accumulated.len() > expected.len()
            || accumulated.as_slice() != &expected[..accumulated.len()]
        {
            log::error!(
                "control data mismatch: expected {:02x?}, got {:02x?}",
                expected,
                accumulated
            );
            return Err(UsbError::Mismatch);
        }

        self.transaction_status_out(address)?;
        Ok(accumulated)
    }

    /// Runs an OUT control transfer: Setup stage, OUT data stage chunked at
    /// the max packet size (with a terminating zero-length packet when the
    /// payload is short of `wLength` but lands on a packet boundary), then
    /// the zero-length IN status stage.
    pub fn control_transfer_out(
        &mut self,
        address: u8,
        request: &Request,
        payload: &[u8],
    ) -> Result<()> {
        if request.direction != UsbDirection::Out {
            log::error!("control_transfer_out with an IN request");
            return Err(UsbError::Sequence);
        }
        if payload.len() > request.length as usize {
            return Err(UsbError::InvalidField);
        }

        self.transaction_setup(address, request)?;

        if !payload.is_empty() {
            let ep = EndpointAddress::control(UsbDirection::Out);
            let max_packet = self.session.max_packet_size_0 as usize;
            for chunk in payload.chunks(max_packet) {
                self.expect_out_acked(address, ep, chunk)?;
            }
            if payload.len() < request.length as usize && payload.len() % max_packet == 0 {
                self.expect_out_acked(address, ep, &[])?;
            }
        }

        self.transaction_status_in(address)
    }

    /// SET_ADDRESS. The session's address for subsequent traffic changes
    /// only after the Status stage is acknowledged - a device must keep
    /// answering at its old address until then.
    pub fn set_device_address(&mut self, address: u8) -> Result<()> {
        if address > 127 {
            return Err(UsbError::InvalidField);
        }
        self.control_transfer_out(
            self.session.current_address,
            &Request::set_address(address),
            &[],
        )?;
        log::info!(
            "device address {} -> {} (status stage acknowledged)",
            self.session.current_address,
            address
        );
        self.session.current_address = address;
        Ok(())
    }

    /// GET_DESCRIPTOR(DEVICE) asserting the canonical bytes; also refreshes
    /// the session's EP0 max packet size from the response.
    pub fn get_device_descriptor(&mut self, expected: &[u8]) -> Result<Vec<u8>> {
        let request = Request::get_device_descriptor(expected.len() as u16);
        let bytes = self.control_transfer_in(self.session.current_address, &request, expected)?;
        if bytes.len() >= 8 {
            self.session.max_packet_size_0 = bytes[7] as u16;
        }
        Ok(bytes)
    }

    pub fn get_configuration_descriptor(&mut self, index: u8, expected: &[u8]) -> Result<Vec<u8>> {
        let request = Request::get_configuration_descriptor(index, expected.len() as u16);
        self.control_transfer_in(self.session.current_address, &request, expected)
    }

    pub fn get_string_descriptor(
        &mut self,
        index: u8,
        lang_id: u16,
        expected: &[u8],
    ) -> Result<Vec<u8>> {
        let request = Request::get_string_descriptor(index, lang_id, expected.len() as u16);
        self.control_transfer_in(self.session.current_address, &request, expected)
    }

    /// SET_CONFIGURATION; resets data toggles and halts on the non-control
    /// endpoints, as configuring a device does.
    pub fn set_configuration(&mut self, value: u8) -> Result<()> {
        self.control_transfer_out(
            self.session.current_address,
            &Request::set_configuration(value),
            &[],
        )?;
        self.session.configuration = Some(value);
        for number in 1..16 {
            self.engine.endpoints_mut().clear_halt(number);
        }
        Ok(())
    }

    /// SET_FEATURE(ENDPOINT_HALT) on `ep`, then scripts the endpoint as
    /// halted so subsequent transactions expect STALL.
    pub fn halt_endpoint(&mut self, ep: EndpointAddress) -> Result<()> {
        let request = Request::set_feature(Recipient::Endpoint, feature::ENDPOINT_HALT, endpoint_index(ep));
        self.control_transfer_out(self.session.current_address, &request, &[])?;
        self.engine.endpoints_mut().set_halted(ep, true);
        Ok(())
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) on `ep`; the endpoint's toggle resets to
    /// DATA0 along with the halt.
    pub fn clear_endpoint_halt(&mut self, ep: EndpointAddress) -> Result<()> {
        let request =
            Request::clear_feature(Recipient::Endpoint, feature::ENDPOINT_HALT, endpoint_index(ep));
        self.control_transfer_out(self.session.current_address, &request, &[])?;
        let endpoints = self.engine.endpoints_mut();
        endpoints.set_halted(ep, false);
        endpoints.set_toggle(ep, Pid::Data0);
        Ok(())
    }
}

/// wIndex encoding for endpoint-recipient requests: number in the low
/// nibble, direction in bit 7.
fn endpoint_index(ep: EndpointAddress) -> u16 {
    let dir_bit = match ep.direction() {
        UsbDirection::In => 0x80,
        UsbDirection::Out => 0x00,
    };
    (ep.number() | dir_bit) as u16
}
