//! Bit-by-bit packet transmission and reception over a [`UsbPhy`].
//!
//! The driver owns everything the codec does not: idle timing, sync and EOP
//! placement, the turnaround window that distinguishes "nothing came" from a
//! late response, and the inter-packet gap discipline that keeps injected
//! SOF traffic out of the middle of other packets. It drives or samples
//! exactly one bit per clock edge and never busy-waits.

use crate::codec::{self, Level};
use crate::packet::{Packet, Pid};
use crate::phy::{Deadline, Ticks, UsbPhy};
use crate::{Result, UsbError};

/// Bound on received packet length, in bit cells. Generous enough for a
/// max-size data packet after stuffing; anything longer is a device driving
/// the bus without framing.
const MAX_PACKET_CELLS: usize = 16 * 1024;

/// Signal-level timing knobs, in bit times.
#[derive(Copy, Clone, Debug)]
pub struct BusConfig {
    /// Idle bits after which a wait reports that nothing came. The USB
    /// bus-turnaround budget is 16-18 bit times.
    pub turnaround_timeout: u32,
    /// Idle bits the driver holds before starting a transmission.
    pub interpacket_gap: u32,
}

impl Default for BusConfig {
    fn default() -> BusConfig {
        BusConfig {
            turnaround_timeout: 18,
            interpacket_gap: 4,
        }
    }
}

struct SofSchedule {
    period: Ticks,
    next_at: Ticks,
    frame: u16,
}

/// Drives and samples the differential pair one bit per clock edge.
pub struct BusDriver<P: UsbPhy> {
    phy: P,
    config: BusConfig,
    sof: Option<SofSchedule>,
}

impl<P: UsbPhy> BusDriver<P> {
    pub fn new(phy: P, config: BusConfig) -> BusDriver<P> {
        BusDriver { phy, config, sof: None }
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn now(&self) -> Ticks {
        self.phy.now()
    }

    /// Suspends for `ticks` bit times with the bus released.
    pub fn wait_ticks(&mut self, ticks: Ticks) {
        for _ in 0..ticks {
            self.phy.tick();
        }
    }

    /// Transmits one packet: inter-packet gap, sync, bit-stuffed NRZI body,
    /// then EOP (SE0, SE0, J). Returns once the bus is released again.
    pub fn drive_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes();
        log::trace!("tx {:?} -> {:02x?}", packet.pid(), bytes);

        self.wait_ticks(self.config.interpacket_gap as Ticks);

        for level in codec::encode(&bytes) {
            self.phy.drive(level);
            self.phy.tick();
        }
        for eop in [Level::Se0, Level::Se0, Level::J].iter() {
            self.phy.drive(*eop);
            self.phy.tick();
        }
        self.phy.release();
        Ok(())
    }

    /// Suspends until a packet with one of the `expected` PIDs arrives, the
    /// bus stays idle past the turnaround window, or `deadline` elapses.
    ///
    /// An empty `expected` set accepts any packet. `Ok(None)` means nothing
    /// came at all - distinct from [`Timeout`](crate::UsbError::Timeout),
    /// which means the caller gave up while traffic may still have been in
    /// flight.
    ///
    /// # Errors
    ///
    /// * [`Timeout`](crate::UsbError::Timeout) - `deadline` elapsed.
    /// * [`UnexpectedHandshake`](crate::UsbError::UnexpectedHandshake) - A
    ///   valid packet arrived whose PID is not in `expected`.
    /// * Framing/PID/CRC errors propagate from decoding.
    pub fn sample_for(&mut self, expected: &[Pid], deadline: Deadline) -> Result<Option<Packet>> {
        let mut idle = 0u32;

        // Wait for the device to take the bus.
        loop {
            if deadline.expired(self.phy.now()) {
                log::warn!("deadline elapsed waiting for {:?}", expected);
                return Err(UsbError::Timeout);
            }
            match self.phy.sample() {
                Level::K => break,
                _ => {
                    idle += 1;
                    if idle > self.config.turnaround_timeout {
                        return Ok(None);
                    }
                }
            }
            self.phy.tick();
        }

        // Collect bit cells until the EOP's first SE0.
        let mut levels = Vec::new();
        loop {
            if deadline.expired(self.phy.now()) {
                log::warn!("deadline elapsed mid-packet after {} cells", levels.len());
                return Err(UsbError::Timeout);
            }
            match self.phy.sample() {
                Level::Se0 => {
                    // Consume the second SE0 and the trailing J.
                    self.phy.tick();
                    self.phy.tick();
                    break;
                }
                level => {
                    levels.push(level);
                    if levels.len() > MAX_PACKET_CELLS {
                        return Err(UsbError::Framing);
                    }
                }
            }
            self.phy.tick();
        }
        self.phy.tick();

        let bytes = codec::decode(&levels)?;
        let packet = Packet::parse(&bytes)?;
        log::trace!("rx {:?} <- {:02x?}", packet.pid(), bytes);

        if expected.is_empty() || expected.iter().any(|pid| *pid == packet.pid()) {
            Ok(Some(packet))
        } else {
            log::error!("expected one of {:?}, device sent {:?}", expected, packet.pid());
            Err(UsbError::UnexpectedHandshake)
        }
    }

    /// Transmits a single SOF marker. Fire and forget: no response is ever
    /// expected for SOF.
    pub fn send_sof(&mut self, frame: u16) -> Result<()> {
        self.drive_packet(&Packet::sof(frame)?)
    }

    /// Starts automatic SOF injection every `period` bit times, beginning
    /// with `start_frame`. Injection happens only at inter-packet gaps, when
    /// the engine calls [`service_sof`](BusDriver::service_sof).
    pub fn schedule_sof(&mut self, period: Ticks, start_frame: u16) {
        self.sof = Some(SofSchedule {
            period,
            next_at: self.phy.now() + period,
            frame: start_frame,
        });
    }

    pub fn cancel_sof(&mut self) {
        self.sof = None;
    }

    /// Sends any SOFs that have come due and returns the bus time consumed,
    /// so in-flight deadlines can be extended by exactly that much rather
    /// than paying for injected traffic.
    pub fn service_sof(&mut self) -> Result<Ticks> {
        let started = self.phy.now();

        while let Some(frame) = self.due_sof() {
            self.send_sof(frame)?;
        }
        Ok(self.phy.now() - started)
    }

    fn due_sof(&mut self) -> Option<u16> {
        let now = self.phy.now();
        let schedule = self.sof.as_mut()?;
        if now < schedule.next_at {
            return None;
        }
        let frame = schedule.frame;
        schedule.frame = (schedule.frame + 1) & 0x7ff;
        schedule.next_at += schedule.period;
        Some(frame)
    }

    /// Drives a single-ended zero for `duration` bit times: the bus-level
    /// reset a host issues before enumeration.
    pub fn drive_reset(&mut self, duration: Ticks) {
        for _ in 0..duration {
            self.phy.drive(Level::Se0);
            self.phy.tick();
        }
        self.phy.drive(Level::J);
        self.phy.tick();
        self.phy.release();
        self.wait_ticks(self.config.interpacket_gap as Ticks);
    }
}
