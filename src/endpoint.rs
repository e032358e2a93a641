//! Per-endpoint expected device state.
//!
//! Test scenarios script what a conforming device endpoint "would" report
//! (response policy, pending data, halt) and the transaction engine consults
//! and maintains the rest (data toggles). One [`EndpointSet`] lives inside
//! each scenario's [`UsbHost`](crate::host::UsbHost) and is rebuilt on
//! reset, so no endpoint state leaks between scenarios.

use crate::packet::Pid;
use crate::UsbDirection;

/// USB endpoint address: a 4-bit endpoint number combined with a direction
/// bit in bit 0, giving the 5-bit identifier used to key endpoint state.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct EndpointAddress(u8);

impl From<u8> for EndpointAddress {
    #[inline]
    fn from(addr: u8) -> EndpointAddress {
        EndpointAddress(addr & 0x1f)
    }
}

impl From<EndpointAddress> for u8 {
    #[inline]
    fn from(addr: EndpointAddress) -> u8 {
        addr.0
    }
}

impl EndpointAddress {
    /// Constructs an EndpointAddress from an endpoint number and direction.
    #[inline]
    pub fn from_parts(number: u8, dir: UsbDirection) -> Self {
        EndpointAddress(((number & 0x0f) << 1) | dir as u8)
    }

    /// The default control pipe in the given direction.
    #[inline]
    pub fn control(dir: UsbDirection) -> Self {
        EndpointAddress::from_parts(0, dir)
    }

    /// Gets the direction part of the address.
    #[inline]
    pub fn direction(&self) -> UsbDirection {
        if self.0 & 1 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    /// Gets the number part of the endpoint address.
    #[inline]
    pub fn number(&self) -> u8 {
        self.0 >> 1
    }
}

/// USB endpoint transfer type, as encoded in the descriptor bmAttributes.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EndpointType {
    Control = 0b00,
    Isochronous = 0b01,
    Bulk = 0b10,
    Interrupt = 0b11,
}

/// The handshake a scripted endpoint is expected to answer with.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EndpointResponse {
    Ack,
    Nak,
    Stall,
}

/// Pending data scripted for one endpoint.
pub type PendingData = heapless::Vec<u8, 1024>;

/// Expected state of a single endpoint.
#[derive(Clone, Debug)]
pub struct EndpointState {
    toggle: Pid,
    response: EndpointResponse,
    pending: PendingData,
    halted: bool,
}

impl EndpointState {
    fn new() -> EndpointState {
        EndpointState {
            toggle: Pid::Data0,
            response: EndpointResponse::Ack,
            pending: PendingData::new(),
            halted: false,
        }
    }
}

/// Expected state for all 16 endpoint numbers in both directions.
pub struct EndpointSet {
    endpoints: [EndpointState; 32],
}

impl EndpointSet {
    pub fn new() -> EndpointSet {
        EndpointSet {
            endpoints: core::array::from_fn(|_| EndpointState::new()),
        }
    }

    fn state(&self, ep: EndpointAddress) -> &EndpointState {
        &self.endpoints[u8::from(ep) as usize]
    }

    fn state_mut(&mut self, ep: EndpointAddress) -> &mut EndpointState {
        &mut self.endpoints[u8::from(ep) as usize]
    }

    /// Scripts the handshake the device is expected to answer with on `ep`.
    pub fn set_response(&mut self, ep: EndpointAddress, response: EndpointResponse) {
        self.state_mut(ep).response = response;
    }

    pub fn response(&self, ep: EndpointAddress) -> EndpointResponse {
        self.state(ep).response
    }

    /// Replaces the pending data scripted for `ep`.
    ///
    /// For an IN endpoint this is what the device is expected to transmit;
    /// for an OUT endpoint, what the device is expected to accept.
    pub fn set_data(&mut self, ep: EndpointAddress, data: &[u8]) {
        let pending = &mut self.state_mut(ep).pending;
        pending.clear();
        // Scripted data is bounded by the protocol payload limit.
        let take = data.len().min(pending.capacity());
        let _ = pending.extend_from_slice(&data[..take]);
    }

    pub fn pending(&self, ep: EndpointAddress) -> &[u8] {
        &self.state(ep).pending
    }

    pub fn clear_data(&mut self, ep: EndpointAddress) {
        self.state_mut(ep).pending.clear();
    }

    /// Drops the first `count` scripted bytes, after a transaction delivered
    /// them.
    pub fn consume_pending(&mut self, ep: EndpointAddress, count: usize) {
        let state = self.state_mut(ep);
        let count = count.min(state.pending.len());
        let remaining = PendingData::from_slice(&state.pending[count..]).unwrap_or_default();
        state.pending = remaining;
    }

    /// The data toggle expected on the next transaction for `ep`.
    pub fn toggle(&self, ep: EndpointAddress) -> Pid {
        self.state(ep).toggle
    }

    pub fn set_toggle(&mut self, ep: EndpointAddress, toggle: Pid) {
        self.state_mut(ep).toggle = toggle;
    }

    /// Advances the toggle after a transaction that moved data *and* was
    /// acknowledged. NAK and STALL outcomes must not call this: a retry has
    /// to resend the identical data PID.
    pub fn flip_toggle(&mut self, ep: EndpointAddress) {
        let state = self.state_mut(ep);
        state.toggle = state.toggle.other_toggle();
    }

    pub fn set_halted(&mut self, ep: EndpointAddress, halted: bool) {
        self.state_mut(ep).halted = halted;
    }

    pub fn is_halted(&self, ep: EndpointAddress) -> bool {
        self.state(ep).halted
    }

    /// Clears the halt on both directions of endpoint `number` and resets
    /// their toggles, as CLEAR_FEATURE(ENDPOINT_HALT) and SETUP do.
    pub fn clear_halt(&mut self, number: u8) {
        for dir in [UsbDirection::Out, UsbDirection::In].iter() {
            let state = self.state_mut(EndpointAddress::from_parts(number, *dir));
            state.halted = false;
            state.toggle = Pid::Data0;
        }
    }

    /// Arms the control pipe after a SETUP handshake: halt cleared and both
    /// EP0 toggles set to DATA1 for the data and status stages.
    pub fn arm_control(&mut self, number: u8) {
        for dir in [UsbDirection::Out, UsbDirection::In].iter() {
            let state = self.state_mut(EndpointAddress::from_parts(number, *dir));
            state.halted = false;
            state.toggle = Pid::Data1;
        }
    }
}

impl Default for EndpointSet {
    fn default() -> EndpointSet {
        EndpointSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_packing() {
        let ep = EndpointAddress::from_parts(3, UsbDirection::In);
        assert_eq!(u8::from(ep), 0x07);
        assert_eq!(ep.number(), 3);
        assert_eq!(ep.direction(), UsbDirection::In);

        let ep = EndpointAddress::from_parts(3, UsbDirection::Out);
        assert_eq!(u8::from(ep), 0x06);
        assert_eq!(ep.direction(), UsbDirection::Out);
    }

    #[test]
    fn toggle_flip_and_hold() {
        let mut set = EndpointSet::new();
        let ep = EndpointAddress::from_parts(1, UsbDirection::In);

        assert_eq!(set.toggle(ep), Pid::Data0);
        set.flip_toggle(ep);
        assert_eq!(set.toggle(ep), Pid::Data1);
        // NAK/STALL paths simply do not flip; nothing else mutates it.
        assert_eq!(set.toggle(ep), Pid::Data1);
        set.flip_toggle(ep);
        assert_eq!(set.toggle(ep), Pid::Data0);
    }

    #[test]
    fn setup_arms_both_control_directions() {
        let mut set = EndpointSet::new();
        let ep_out = EndpointAddress::control(UsbDirection::Out);
        let ep_in = EndpointAddress::control(UsbDirection::In);

        set.set_halted(ep_out, true);
        set.arm_control(0);
        assert!(!set.is_halted(ep_out));
        assert_eq!(set.toggle(ep_out), Pid::Data1);
        assert_eq!(set.toggle(ep_in), Pid::Data1);
    }

    #[test]
    fn clear_halt_resets_toggle() {
        let mut set = EndpointSet::new();
        let ep = EndpointAddress::from_parts(2, UsbDirection::Out);

        set.flip_toggle(ep);
        set.set_halted(ep, true);
        set.clear_halt(2);
        assert!(!set.is_halted(ep));
        assert_eq!(set.toggle(ep), Pid::Data0);
    }
}
