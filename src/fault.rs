// Fault injection policy.
//
// A FaultSpec is the operator's fault configuration as it stood when a session started. The
// session wraps it in a FaultPolicy, which adds the `armed` flag: a fault fires at most once per
// session, no matter how many later packets look like the target.
//
// DATA and ACK packets are matched on a logical block index derived from the session's transfer
// counter rather than the block number carried in the packet. Once a packet has been dropped or
// duplicated the peers may resend blocks, and the carried number would then match the target a
// second time.

use crate::tftp::OpCode;
use std::fmt;
use std::time::Duration;

/// The packet a fault is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Rrq,
    Wrq,
    Data(u32),
    Ack(u32),
}

impl Target {
    pub fn opcode(self) -> OpCode {
        match self {
            Target::Rrq => OpCode::Rrq,
            Target::Wrq => OpCode::Wrq,
            Target::Data(_) => OpCode::Data,
            Target::Ack(_) => OpCode::Ack,
        }
    }

    /// Requests are always block 1.
    pub fn block(self) -> u32 {
        match self {
            Target::Rrq | Target::Wrq => 1,
            Target::Data(block) | Target::Ack(block) => block,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Rrq | Target::Wrq => write!(f, "{}", self.opcode()),
            Target::Data(block) | Target::Ack(block) => write!(f, "{} #{block}", self.opcode()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    None,
    Duplicate,
    Lose,
    Delay,
}

/// An immutable fault configuration. Exactly one mode at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultSpec {
    #[default]
    Normal,
    /// Send a second copy of the target `delay` after the first.
    Duplicate { target: Target, delay: Duration },
    /// Drop the target.
    Lose { target: Target },
    /// Hold the target back for `delay`.
    Delay { target: Target, delay: Duration },
}

impl FaultSpec {
    pub fn mode(&self) -> FaultMode {
        match self {
            FaultSpec::Normal => FaultMode::None,
            FaultSpec::Duplicate { .. } => FaultMode::Duplicate,
            FaultSpec::Lose { .. } => FaultMode::Lose,
            FaultSpec::Delay { .. } => FaultMode::Delay,
        }
    }

    pub fn target(&self) -> Option<Target> {
        match self {
            FaultSpec::Normal => None,
            FaultSpec::Duplicate { target, .. } | FaultSpec::Lose { target } | FaultSpec::Delay { target, .. } => {
                Some(*target)
            }
        }
    }

    pub fn delay(&self) -> Duration {
        match self {
            FaultSpec::Duplicate { delay, .. } | FaultSpec::Delay { delay, .. } => *delay,
            _ => Duration::ZERO,
        }
    }
}

impl fmt::Display for FaultSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultSpec::Normal => f.write_str("normal operation"),
            FaultSpec::Duplicate { target, delay } => write!(f, "duplicate {target} after {}ms", delay.as_millis()),
            FaultSpec::Lose { target } => write!(f, "lose {target}"),
            FaultSpec::Delay { target, delay } => write!(f, "delay {target} by {}ms", delay.as_millis()),
        }
    }
}

/// Logical block index of a DATA or ACK packet, given the session's transfer counter.
///
/// DATA and ACK alternate within each round trip, so the DATA of round `n` is seen while the
/// counter is `2n - 1` and its ACK while the counter is `2n`.
pub fn logical_index(opcode: OpCode, transfers: u32) -> Option<u32> {
    match opcode {
        OpCode::Data => Some(transfers / 2 + 1),
        OpCode::Ack => Some(transfers / 2),
        _ => None,
    }
}

/// A session's view of its fault: the snapshot plus whether it is still armed.
#[derive(Debug, Clone)]
pub struct FaultPolicy {
    spec: FaultSpec,
    armed: bool,
}

impl FaultPolicy {
    pub fn new(spec: FaultSpec) -> FaultPolicy {
        FaultPolicy { spec, armed: spec.mode() != FaultMode::None }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn delay(&self) -> Duration {
        self.spec.delay()
    }

    /// Checks the fault against `opcode` at logical `index` and, on a match, disarms it.
    pub fn fire(&mut self, mode: FaultMode, opcode: OpCode, index: u32) -> bool {
        let Some(target) = self.spec.target() else {
            return false;
        };
        let hit = self.armed && self.spec.mode() == mode && target.opcode() == opcode && target.block() == index;
        if hit {
            self.armed = false;
        }
        hit
    }

    /// The opening RRQ/WRQ.
    pub fn fire_on_request(&mut self, mode: FaultMode, connection: OpCode) -> bool {
        self.fire(mode, connection, 1)
    }

    /// The server's first reply: DATA 1 for a read, ACK 0 for a write.
    pub fn fire_on_first_reply(&mut self, mode: FaultMode, opcode: OpCode, connection: OpCode) -> bool {
        let index = if connection == OpCode::Rrq { 1 } else { 0 };
        self.fire(mode, opcode, index)
    }

    /// Loss and delay act on the target packet itself.
    pub fn fire_on_packet(&mut self, mode: FaultMode, opcode: OpCode, transfers: u32) -> bool {
        match logical_index(opcode, transfers) {
            Some(index) => self.fire(mode, opcode, index),
            None => false,
        }
    }

    /// Duplication is triggered by the packet answering the target, at which point the target is
    /// the previous outgoing packet. A DATA target fires on its ACK and an ACK target on the DATA
    /// that follows it.
    pub fn fire_duplicate(&mut self, opcode: OpCode, transfers: u32) -> bool {
        let answered = match opcode {
            OpCode::Ack => OpCode::Data,
            OpCode::Data => OpCode::Ack,
            _ => return false,
        };
        self.fire(FaultMode::Duplicate, answered, transfers / 2)
    }
}
