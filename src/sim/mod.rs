//! Simulated bus and behavioral device for engine-level testing.
//!
//! [`SimBus`] implements [`UsbPhy`] over an in-process wire model: the
//! differential pair is a single resolved [`Level`] per bit cell, the clock
//! is a tick counter, and the far end is a [`SimDevice`] that receives
//! packets bit by bit exactly as a hardware core would - including the
//! turnaround delay before it answers and the EOP it appends to its own
//! transmissions. A small register window implements [`RegisterBus`] for
//! white-box scenarios.

mod control_pipe;
mod device;

pub use device::SimDevice;

use std::collections::VecDeque;

use crate::codec::{self, Level};
use crate::descriptor::DeviceModel;
use crate::packet::Packet;
use crate::phy::{RegisterBus, Ticks, UsbPhy};
use crate::{Result, UsbError};

/// Register window exposed to white-box scenarios.
pub const REG_PULLUP: u32 = 0x00;
pub const REG_ADDRESS: u32 = 0x04;
pub const REG_SCRATCH: u32 = 0x08;

/// Bit cells the device waits after a received EOP before driving its
/// response. Inside the host's 16-18 bit turnaround budget.
const RESPONSE_GAP: u32 = 6;

/// SE0 cells after which the device treats the bus as being reset.
const RESET_DETECT_CELLS: u32 = 30;

enum RxState {
    Idle,
    Receiving(Vec<Level>),
}

/// In-process simulation of the bus and an attached [`SimDevice`].
pub struct SimBus {
    time: Ticks,
    host_level: Option<Level>,
    dev_out: Option<Level>,
    tx: VecDeque<Level>,
    pending_tx: Option<VecDeque<Level>>,
    gap: u32,
    rx: RxState,
    se0_run: u32,
    reset_asserted: bool,
    scratch: u32,
    device: SimDevice,
}

impl SimBus {
    pub fn new(model: DeviceModel) -> SimBus {
        SimBus {
            time: 0,
            host_level: None,
            dev_out: None,
            tx: VecDeque::new(),
            pending_tx: None,
            gap: 0,
            rx: RxState::Idle,
            se0_run: 0,
            reset_asserted: false,
            scratch: 0x1234_5678,
            device: SimDevice::new(model),
        }
    }

    pub fn device(&self) -> &SimDevice {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut SimDevice {
        &mut self.device
    }

    fn line_state(&self) -> Level {
        if let Some(level) = self.host_level {
            level
        } else if let Some(level) = self.dev_out {
            level
        } else if self.device.pullup() {
            Level::J
        } else {
            Level::Se0
        }
    }

    fn step_device(&mut self, line: Level) {
        if self.reset_asserted {
            self.device.hard_reset();
            self.flush_wire();
            return;
        }

        if line == Level::Se0 {
            self.se0_run += 1;
            if self.se0_run == RESET_DETECT_CELLS {
                self.device.bus_reset();
                self.flush_wire();
            }
        } else {
            self.se0_run = 0;
        }

        // Turnaround countdown before a queued response goes on the wire.
        if self.gap > 0 {
            self.gap -= 1;
            if self.gap == 0 {
                if let Some(tx) = self.pending_tx.take() {
                    self.tx = tx;
                }
            }
            return;
        }

        // Transmitting: one cell per edge, deaf to the bus meanwhile.
        if !self.tx.is_empty() || self.dev_out.is_some() {
            self.dev_out = self.tx.pop_front();
            return;
        }

        match &mut self.rx {
            RxState::Idle => {
                if line == Level::K {
                    self.rx = RxState::Receiving(vec![Level::K]);
                }
            }
            RxState::Receiving(levels) => {
                if line == Level::Se0 {
                    let levels = core::mem::replace(levels, Vec::new());
                    self.rx = RxState::Idle;
                    self.finish_packet(&levels);
                } else {
                    levels.push(line);
                }
            }
        }
    }

    fn flush_wire(&mut self) {
        self.rx = RxState::Idle;
        self.tx.clear();
        self.pending_tx = None;
        self.dev_out = None;
        self.gap = 0;
    }

    fn finish_packet(&mut self, levels: &[Level]) {
        let packet = match codec::decode(levels).and_then(|bytes| Packet::parse(&bytes)) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!("sim device dropped undecodable traffic: {:?}", err);
                return;
            }
        };

        if let Some(response) = self.device.packet_in(&packet) {
            let mut levels: VecDeque<Level> =
                codec::encode(&response.to_bytes()).into_iter().collect();
            levels.push_back(Level::Se0);
            levels.push_back(Level::Se0);
            levels.push_back(Level::J);
            self.pending_tx = Some(levels);
            self.gap = RESPONSE_GAP;
        }
    }
}

impl UsbPhy for SimBus {
    fn tick(&mut self) {
        let line = self.line_state();
        self.time += 1;
        self.step_device(line);
    }

    fn now(&self) -> Ticks {
        self.time
    }

    fn drive(&mut self, level: Level) {
        self.host_level = Some(level);
    }

    fn release(&mut self) {
        self.host_level = None;
    }

    fn sample(&self) -> Level {
        self.line_state()
    }

    fn device_present(&self) -> bool {
        self.device.pullup()
    }

    fn set_reset(&mut self, asserted: bool) {
        self.reset_asserted = asserted;
    }
}

impl RegisterBus for SimBus {
    fn read(&mut self, address: u32) -> Result<u32> {
        self.tick();
        match address {
            REG_PULLUP => Ok(self.device.pullup() as u32),
            REG_ADDRESS => Ok(self.device.address() as u32),
            REG_SCRATCH => Ok(self.scratch),
            _ => Err(UsbError::InvalidField),
        }
    }

    fn write(&mut self, address: u32, value: u32) -> Result<()> {
        self.tick();
        match address {
            REG_PULLUP => {
                self.device.set_pullup(value != 0);
                Ok(())
            }
            REG_ADDRESS => {
                self.device.force_address(value as u8);
                Ok(())
            }
            REG_SCRATCH => {
                self.scratch = value;
                Ok(())
            }
            _ => Err(UsbError::InvalidField),
        }
    }
}
