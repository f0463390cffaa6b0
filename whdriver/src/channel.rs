/// Per-channel transfer bookkeeping.

use std::fmt;

use parking_lot::Mutex;

use crate::board::{pins, transfer::PACKET_SIZE};
use crate::regs::PinFunction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    A,
    B,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::A, ChannelId::B];

    pub fn index(self) -> usize {
        match self {
            ChannelId::A => 0,
            ChannelId::B => 1,
        }
    }

    pub fn pins(self) -> ChannelPins {
        match self {
            ChannelId::A => ChannelPins {
                ss: pins::a::SS,
                clk: pins::a::CLK,
                miso: pins::a::MISO,
                ready: pins::a::READY,
                alt: PinFunction::Alt0,
            },
            ChannelId::B => ChannelPins {
                ss: pins::b::SS,
                clk: pins::b::CLK,
                miso: pins::b::MISO,
                ready: pins::b::READY,
                alt: PinFunction::Alt3,
            },
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::A => write!(f, "A"),
            ChannelId::B => write!(f, "B"),
        }
    }
}

/// GPIO assignment of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPins {
    pub ss: u8,
    pub clk: u8,
    pub miso: u8,
    pub ready: u8,
    /// Function routing CLK and MISO to the channel's SPI controller
    pub alt: PinFunction,
}

impl ChannelPins {
    pub fn ready_mask(&self) -> u32 {
        1 << self.ready
    }
}

/// Where a channel is in its packet capture cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// No transfer; a ready edge may start one
    Idle,
    /// Slot claimed and TA set, no bytes received yet
    Armed,
    /// Bytes are being drained from the RX FIFO
    Draining,
}

/// The active transfer of a channel
#[derive(Debug, Clone)]
pub struct Transfer {
    pub state: TransferState,
    /// Ring slot being filled
    pub slot: usize,
    /// Next byte offset inside the slot
    pub cursor: usize,
    pub tx_remaining: usize,
    pub rx_remaining: usize,
}

impl Transfer {
    fn idle() -> Self {
        Transfer {
            state: TransferState::Idle,
            slot: 0,
            cursor: 0,
            tx_remaining: 0,
            rx_remaining: 0,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.state != TransferState::Idle
    }

    /// Idle -> Armed on a ready edge.
    pub fn start(&mut self, slot: usize) {
        debug_assert!(!self.in_progress());
        self.state = TransferState::Armed;
        self.slot = slot;
        self.cursor = 0;
        self.tx_remaining = PACKET_SIZE;
        self.rx_remaining = PACKET_SIZE;
    }

    /// Account for `n` received bytes and return the slot offset they start at.
    pub fn received(&mut self, n: usize) -> usize {
        let offset = self.cursor;
        self.cursor += n;
        self.rx_remaining -= n;
        if n > 0 && self.state == TransferState::Armed {
            self.state = TransferState::Draining;
        }
        offset
    }

    pub fn finish(&mut self) {
        *self = Transfer::idle();
    }
}

pub struct Channel {
    pub id: ChannelId,
    pub pins: ChannelPins,
    pub transfer: Mutex<Transfer>,
}

impl Channel {
    pub fn new(id: ChannelId) -> Self {
        Channel {
            id,
            pins: id.pins(),
            transfer: Mutex::new(Transfer::idle()),
        }
    }

    pub fn state(&self) -> TransferState {
        self.transfer.lock().state
    }

    pub fn reset(&self) {
        self.transfer.lock().finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_cycle() {
        let mut t = Transfer::idle();
        assert!(!t.in_progress());

        t.start(7);
        assert_eq!(t.state, TransferState::Armed);
        assert_eq!(t.tx_remaining, PACKET_SIZE);
        assert_eq!(t.rx_remaining, PACKET_SIZE);

        assert_eq!(t.received(0), 0);
        assert_eq!(t.state, TransferState::Armed);
        assert_eq!(t.received(48), 0);
        assert_eq!(t.state, TransferState::Draining);
        assert_eq!(t.received(16), 48);
        assert_eq!(t.rx_remaining, PACKET_SIZE - 64);

        t.finish();
        assert_eq!(t.state, TransferState::Idle);
    }

    #[test]
    fn test_channel_pins() {
        let a = ChannelId::A.pins();
        let b = ChannelId::B.pins();
        assert_eq!(a.ready_mask(), 1 << 10);
        assert_eq!(b.ready_mask(), 1 << 20);
        assert_eq!(a.alt, PinFunction::Alt0);
        assert_eq!(b.alt, PinFunction::Alt3);
    }
}
