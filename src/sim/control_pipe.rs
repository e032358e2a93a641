//! Device-side EP0 state machine for the behavioral model.
//!
//! Tracks one control transfer through its stages and produces the
//! packet-level reactions: DATA chunks for IN tokens, handshakes for OUT
//! data, and the transition points where a request's side effects (like a
//! pending address) become due.

use crate::control::Request;
use crate::packet::Pid;

/// How the device resolved a SETUP request.
pub(crate) enum SetupOutcome {
    /// IN request: these bytes form the data stage (clamped to wLength).
    DataIn(Vec<u8>),
    /// OUT request with a data stage the device will accept.
    AcceptOut,
    /// Request accepted, no data stage.
    NoData,
    /// Request rejected: the pipe answers STALL until the next SETUP.
    Reject,
}

/// Reaction to an IN token on EP0.
pub(crate) enum PipeIn {
    Data { pid: Pid, bytes: Vec<u8> },
    Nak,
    Stall,
}

/// Reaction to an OUT DATA packet on EP0.
pub(crate) enum PipeOut {
    Handshake(Pid),
    /// Data stage complete: the accumulated payload, acknowledged.
    Complete(Vec<u8>),
}

enum State {
    Idle,
    DataIn { buf: Vec<u8>, pos: usize, zlp: bool },
    StatusOut,
    DataOut { expected: usize, buf: Vec<u8> },
    StatusIn,
    Stalled,
}

pub(crate) struct ControlPipe {
    state: State,
    toggle: Pid,
    max_packet_size: usize,
    awaiting_ack: bool,
}

impl ControlPipe {
    pub fn new(max_packet_size: usize) -> ControlPipe {
        ControlPipe {
            state: State::Idle,
            toggle: Pid::Data1,
            max_packet_size,
            awaiting_ack: false,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.toggle = Pid::Data1;
        self.awaiting_ack = false;
    }

    /// Begins a new transfer from an accepted SETUP. Responses start at
    /// DATA1; a zero-length request goes straight to the IN status stage.
    pub fn start(&mut self, request: &Request, outcome: SetupOutcome) {
        self.toggle = Pid::Data1;
        self.awaiting_ack = false;

        let length = request.length as usize;
        self.state = match outcome {
            SetupOutcome::Reject => State::Stalled,
            _ if length == 0 => State::StatusIn,
            SetupOutcome::DataIn(mut buf) => {
                buf.truncate(length);
                // A short response landing on a packet boundary needs an
                // explicit zero-length packet to end the stage.
                let zlp = buf.len() < length && buf.len() % self.max_packet_size == 0;
                State::DataIn { buf, pos: 0, zlp }
            }
            SetupOutcome::AcceptOut => State::DataOut {
                expected: length,
                buf: Vec::new(),
            },
            SetupOutcome::NoData => State::StatusIn,
        };
    }

    /// Reaction to an IN token. The sent chunk is not consumed until the
    /// host acknowledges it, so a retransmission repeats it exactly.
    pub fn in_token(&mut self) -> PipeIn {
        match &self.state {
            State::DataIn { buf, pos, zlp } => {
                if *pos < buf.len() {
                    let end = (*pos + self.max_packet_size).min(buf.len());
                    self.awaiting_ack = true;
                    PipeIn::Data {
                        pid: self.toggle,
                        bytes: buf[*pos..end].to_vec(),
                    }
                } else if *zlp {
                    self.awaiting_ack = true;
                    PipeIn::Data {
                        pid: self.toggle,
                        bytes: Vec::new(),
                    }
                } else {
                    PipeIn::Nak
                }
            }
            State::StatusIn => {
                self.awaiting_ack = true;
                PipeIn::Data {
                    pid: Pid::Data1,
                    bytes: Vec::new(),
                }
            }
            State::Stalled => PipeIn::Stall,
            _ => PipeIn::Nak,
        }
    }

    /// Advances after the host acknowledged our last DATA. Returns true when
    /// the acknowledgment completed the IN status stage, the point where a
    /// pending address change becomes live.
    pub fn in_acked(&mut self) -> bool {
        if !self.awaiting_ack {
            return false;
        }
        self.awaiting_ack = false;

        match &mut self.state {
            State::DataIn { buf, pos, zlp } => {
                if *pos < buf.len() {
                    *pos = (*pos + self.max_packet_size).min(buf.len());
                } else {
                    *zlp = false;
                }
                self.toggle = self.toggle.other_toggle();
                if *pos >= buf.len() && !*zlp {
                    self.state = State::StatusOut;
                }
                false
            }
            State::StatusIn => {
                self.state = State::Idle;
                true
            }
            _ => false,
        }
    }

    /// Reaction to an OUT DATA packet.
    pub fn data_out(&mut self, payload: &[u8]) -> PipeOut {
        match &mut self.state {
            State::StatusOut => {
                if !payload.is_empty() {
                    self.state = State::Stalled;
                    return PipeOut::Handshake(Pid::Stall);
                }
                self.state = State::Idle;
                PipeOut::Handshake(Pid::Ack)
            }
            State::DataOut { expected, buf } => {
                buf.extend_from_slice(payload);
                if buf.len() >= *expected || payload.len() < self.max_packet_size {
                    let data = core::mem::replace(buf, Vec::new());
                    self.state = State::StatusIn;
                    PipeOut::Complete(data)
                } else {
                    PipeOut::Handshake(Pid::Ack)
                }
            }
            State::Stalled => PipeOut::Handshake(Pid::Stall),
            _ => {
                self.state = State::Stalled;
                PipeOut::Handshake(Pid::Stall)
            }
        }
    }
}
