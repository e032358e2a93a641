//! Token/data/handshake exchanges with NAK retry.
//!
//! One call drives one transaction through its states: token sent, response
//! awaited, handshake resolved. NAK is retried internally until a deadline
//! expressed in simulated time - DUT processing latency, not a retry count,
//! is what scenarios want to bound. Every other non-ACK outcome either
//! surfaces as a typed result (STALL) or propagates as a hard failure
//! (framing/PID/CRC violations, timeouts, no response at all).

use crate::bus::BusDriver;
use crate::control::Request;
use crate::endpoint::{EndpointAddress, EndpointResponse, EndpointSet};
use crate::packet::{Packet, Payload, Pid};
use crate::phy::{Deadline, Ticks, UsbPhy};
use crate::{Result, UsbError};

/// Timing limits for individual transactions.
#[derive(Copy, Clone, Debug)]
pub struct EngineConfig {
    /// Budget for one response packet to arrive and finish, in bit times.
    pub packet_timeout: Ticks,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            packet_timeout: crate::phy::us(200),
        }
    }
}

/// Terminal state of an IN transaction.
#[derive(Clone, PartialEq, Debug)]
pub enum InResult {
    /// The device returned this payload and the engine acknowledged it.
    Data(Payload),
    /// The device answered STALL; the toggle was left untouched.
    Stalled,
}

/// Terminal state of an OUT transaction.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OutResult {
    /// The device acknowledged the data; the toggle advanced.
    Acked,
    /// The device answered STALL; the toggle was left untouched.
    Stalled,
}

/// Drives individual transactions over a [`BusDriver`], consulting and
/// maintaining the per-endpoint expected state.
pub struct TransactionEngine<P: UsbPhy> {
    bus: BusDriver<P>,
    endpoints: EndpointSet,
    config: EngineConfig,
}

impl<P: UsbPhy> TransactionEngine<P> {
    pub fn new(bus: BusDriver<P>, config: EngineConfig) -> TransactionEngine<P> {
        TransactionEngine {
            bus,
            endpoints: EndpointSet::new(),
            config,
        }
    }

    pub fn bus(&self) -> &BusDriver<P> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut BusDriver<P> {
        &mut self.bus
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    pub fn endpoints_mut(&mut self) -> &mut EndpointSet {
        &mut self.endpoints
    }

    /// Discards all per-endpoint state, as a bus reset does.
    pub fn reset_endpoints(&mut self) {
        self.endpoints = EndpointSet::new();
    }

    // Raw packet surface. Scenarios compose these directly for adversarial
    // sequences the structured operations would never emit: wrong-endpoint
    // traffic, slow-host NAK polling, tokens without data.

    pub fn send_token(&mut self, pid: Pid, address: u8, endpoint: u8) -> Result<()> {
        self.bus.drive_packet(&Packet::token(pid, address, endpoint)?)
    }

    pub fn send_data(&mut self, pid: Pid, payload: &[u8]) -> Result<()> {
        self.bus.drive_packet(&Packet::data(pid, payload)?)
    }

    pub fn send_ack(&mut self) -> Result<()> {
        self.bus.drive_packet(&Packet::handshake(Pid::Ack)?)
    }

    pub fn send_sof(&mut self, frame: u16) -> Result<()> {
        self.bus.send_sof(frame)
    }

    /// Waits one packet budget for a packet with one of the `expected` PIDs.
    ///
    /// # Errors
    ///
    /// * [`NoResponse`](crate::UsbError::NoResponse) - The bus stayed idle
    ///   past the turnaround window.
    pub fn expect_packet(&mut self, expected: &[Pid]) -> Result<Packet> {
        let deadline = Deadline::after(self.bus.now(), self.config.packet_timeout);
        match self.bus.sample_for(expected, deadline)? {
            Some(packet) => Ok(packet),
            None => {
                log::error!("no response: bus idle past turnaround waiting for {:?}", expected);
                Err(UsbError::NoResponse)
            }
        }
    }

    pub fn expect_ack(&mut self) -> Result<()> {
        self.expect_packet(&[Pid::Ack]).map(|_| ())
    }

    pub fn expect_nak(&mut self) -> Result<()> {
        self.expect_packet(&[Pid::Nak]).map(|_| ())
    }

    pub fn expect_stall(&mut self) -> Result<()> {
        self.expect_packet(&[Pid::Stall]).map(|_| ())
    }

    /// Waits for a DATA packet with exactly this PID and payload. Does not
    /// acknowledge; pair with [`send_ack`](TransactionEngine::send_ack).
    ///
    /// # Errors
    ///
    /// * [`Mismatch`](crate::UsbError::Mismatch) - Payload differs.
    /// * [`Sequence`](crate::UsbError::Sequence) - Other data toggle.
    pub fn expect_data_packet(&mut self, pid: Pid, expected: &[u8]) -> Result<()> {
        match self.expect_packet(&[Pid::Data0, Pid::Data1])? {
            Packet::Data { pid: got, payload } => {
                if got != pid {
                    log::error!("expected {:?}, device sent {:?}", pid, got);
                    return Err(UsbError::Sequence);
                }
                if payload.as_slice() != expected {
                    log::error!("payload mismatch: expected {:02x?}, got {:02x?}", expected, payload);
                    return Err(UsbError::Mismatch);
                }
                Ok(())
            }
            _ => Err(UsbError::UnexpectedHandshake),
        }
    }

    /// Drives a SETUP transaction: SETUP token, DATA0 request payload, ACK
    /// required. A SETUP addressed to a halted endpoint clears the halt on
    /// the endpoint pair before anything else, and arms both control toggles
    /// to DATA1 for the stages that follow.
    pub fn setup_transaction(&mut self, address: u8, endpoint: u8, request: &Request) -> Result<()> {
        self.endpoints.arm_control(endpoint);

        self.bus.service_sof()?;
        self.send_token(Pid::Setup, address, endpoint)?;
        self.send_data(Pid::Data0, &request.to_bytes())?;
        self.expect_ack()?;
        log::debug!("SETUP {:02x?} to {}:{} acknowledged", request.to_bytes(), address, endpoint);
        Ok(())
    }

    fn stall_scripted(&self, ep: EndpointAddress) -> bool {
        self.endpoints.is_halted(ep) || self.endpoints.response(ep) == EndpointResponse::Stall
    }

    /// Drives one IN transaction, retrying NAKs until `deadline`.
    ///
    /// On data: CRC and toggle are verified, the packet is acknowledged and
    /// the expected toggle flips; if the endpoint has scripted pending data,
    /// the payload is checked against (and consumes) it. NAK and STALL leave
    /// the toggle untouched. If the endpoint is scripted as halted or with a
    /// STALL policy, the device is expected to STALL and anything else fails
    /// the transaction.
    pub fn in_transaction(
        &mut self,
        address: u8,
        ep: EndpointAddress,
        mut deadline: Deadline,
    ) -> Result<InResult> {
        if self.stall_scripted(ep) {
            self.bus.service_sof()?;
            self.send_token(Pid::In, address, ep.number())?;
            self.expect_stall()?;
            return Ok(InResult::Stalled);
        }

        loop {
            deadline.extend(self.bus.service_sof()?);
            self.send_token(Pid::In, address, ep.number())?;

            match self.expect_packet(&[Pid::Data0, Pid::Data1, Pid::Nak, Pid::Stall])? {
                Packet::Data { pid, payload } => {
                    let expected = self.endpoints.toggle(ep);
                    if pid != expected {
                        log::error!(
                            "IN {}:{} toggle out of sequence: expected {:?}, got {:?}",
                            address,
                            ep.number(),
                            expected,
                            pid
                        );
                        return Err(UsbError::Sequence);
                    }
                    self.send_ack()?;
                    self.endpoints.flip_toggle(ep);

                    let scripted = self.endpoints.pending(ep);
                    if !scripted.is_empty() {
                        if payload.len() > scripted.len()
                            || payload.as_slice() != &scripted[..payload.len()]
                        {
                            log::error!(
                                "IN {}:{} returned {:02x?}, scripted {:02x?}",
                                address,
                                ep.number(),
                                payload,
                                scripted
                            );
                            return Err(UsbError::Mismatch);
                        }
                        self.endpoints.consume_pending(ep, payload.len());
                    }
                    return Ok(InResult::Data(payload));
                }
                Packet::Handshake { pid: Pid::Nak } => {
                    if deadline.expired(self.bus.now()) {
                        log::error!(
                            "IN {}:{} did not receive expected response within deadline {}",
                            address,
                            ep.number(),
                            deadline.instant()
                        );
                        return Err(UsbError::Timeout);
                    }
                }
                Packet::Handshake { pid: Pid::Stall } => return Ok(InResult::Stalled),
                _ => return Err(UsbError::UnexpectedHandshake),
            }
        }
    }

    /// Drives one OUT transaction, retrying NAKs until `deadline` with the
    /// identical DATA packet - NAK does not advance state, so the retry must
    /// resend the same toggle and payload.
    pub fn out_transaction(
        &mut self,
        address: u8,
        ep: EndpointAddress,
        payload: &[u8],
        mut deadline: Deadline,
    ) -> Result<OutResult> {
        let toggle = self.endpoints.toggle(ep);

        if self.stall_scripted(ep) {
            self.bus.service_sof()?;
            self.send_token(Pid::Out, address, ep.number())?;
            self.send_data(toggle, payload)?;
            self.expect_stall()?;
            return Ok(OutResult::Stalled);
        }

        loop {
            deadline.extend(self.bus.service_sof()?);
            self.send_token(Pid::Out, address, ep.number())?;
            self.send_data(toggle, payload)?;

            match self.expect_packet(&[Pid::Ack, Pid::Nak, Pid::Stall])? {
                Packet::Handshake { pid: Pid::Ack } => {
                    self.endpoints.flip_toggle(ep);
                    return Ok(OutResult::Acked);
                }
                Packet::Handshake { pid: Pid::Nak } => {
                    if deadline.expired(self.bus.now()) {
                        log::error!(
                            "OUT {}:{} did not receive expected response within deadline {}",
                            address,
                            ep.number(),
                            deadline.instant()
                        );
                        return Err(UsbError::Timeout);
                    }
                }
                Packet::Handshake { pid: Pid::Stall } => return Ok(OutResult::Stalled),
                _ => return Err(UsbError::UnexpectedHandshake),
            }
        }
    }
}
