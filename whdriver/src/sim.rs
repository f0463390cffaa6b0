/// Simulated board
///
/// An in-memory model of the GPIO block, the two SPI controllers, the shared
/// interrupt status register and the two PICs, implementing [`Platform`] so
/// the driver runs unchanged on top of it.
///
/// SPI controllers follow the BCM2711 master: 64 byte FIFOs, DONE while TA is
/// set and the TX FIFO is empty, RXR at 3/4 full, INTD/INTR gating the
/// interrupt line. Bytes shift instantly whenever the RX FIFO has room.
///
/// A PIC holds its ready line low while it has a packet loaded and releases
/// it when chip select goes high after all 192 bytes were clocked out; the
/// next queued packet then produces a fresh falling edge.
///
/// Interrupts are delivered synchronously by [`SimBoard::pump`] on the
/// calling thread, never from inside a register access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::board::{memory, pins, transfer};
use crate::channel::ChannelId;
use crate::error::{DriverError, Result};
use crate::packet::{Packet, SYNC_BYTE};
use crate::platform::{IrqHandle, IrqHandler, IrqLine, IrqReturn, Platform, Trigger};
use crate::regs::{gpio_offsets, spi_offsets, RegisterWindow};

const CLEAR_TX: u32 = 1 << 4;
const CLEAR_RX: u32 = 1 << 5;
const TA: u32 = 1 << 7;
const INTD: u32 = 1 << 9;
const INTR: u32 = 1 << 10;
const DONE: u32 = 1 << 16;
const RXD: u32 = 1 << 17;
const TXD: u32 = 1 << 18;
const RXR: u32 = 1 << 19;
const CS_WRITABLE: u32 = 0xffff & !(CLEAR_TX | CLEAR_RX);

const RXR_LEVEL: usize = transfer::FIFO_DEPTH * 3 / 4;
const PACTL_SPI0: u32 = 1 << 0;
const PACTL_SPI6: u32 = 1 << 6;

const MAX_PUMP_ROUNDS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Gpio,
    Spi(usize),
    Pactl,
}

#[derive(Default)]
struct SpiModel {
    cs: u32,
    clk: u32,
    tx: VecDeque<u8>,
    rx: VecDeque<u8>,
}

impl SpiModel {
    fn status(&self) -> u32 {
        let mut value = self.cs;
        if self.cs & TA != 0 && self.tx.is_empty() {
            value |= DONE;
        }
        if !self.rx.is_empty() {
            value |= RXD;
        }
        if self.tx.len() < transfer::FIFO_DEPTH {
            value |= TXD;
        }
        if self.rx.len() >= RXR_LEVEL {
            value |= RXR;
        }
        value
    }

    fn interrupting(&self) -> bool {
        let status = self.status();
        status & TA != 0
            && ((status & INTD != 0 && status & DONE != 0)
                || (status & INTR != 0 && status & RXR != 0))
    }
}

#[derive(Default)]
struct ChipModel {
    queue: VecDeque<Packet>,
    current: Option<Packet>,
    pos: usize,
    selected: bool,
}

impl ChipModel {
    fn next_byte(&mut self) -> u8 {
        if !self.selected {
            return 0xff;
        }
        match &self.current {
            Some(packet) if self.pos < transfer::PACKET_SIZE => {
                let byte = packet.bytes[self.pos];
                self.pos += 1;
                byte
            }
            _ => 0,
        }
    }
}

#[derive(Default)]
struct Hardware {
    fsel: [u32; 6],
    outputs: u32,
    spi: [SpiModel; 2],
    chips: [ChipModel; 2],
    /// Ready pins with a falling edge not yet delivered
    edges: Vec<u8>,
}

impl Hardware {
    fn read(&mut self, block: Block, index: usize) -> u32 {
        match block {
            Block::Gpio => match index {
                i if i < 6 => self.fsel[i],
                gpio_offsets::GPLEV0 => self.levels(),
                _ => 0,
            },
            Block::Spi(i) => match index {
                spi_offsets::CS => self.spi[i].status(),
                spi_offsets::FIFO => {
                    let byte = self.spi[i].rx.pop_front().unwrap_or(0);
                    self.shift(i);
                    byte as u32
                }
                spi_offsets::CLK => self.spi[i].clk,
                _ => 0,
            },
            Block::Pactl => {
                let mut status = 0;
                if self.spi[0].interrupting() {
                    status |= PACTL_SPI0;
                }
                if self.spi[1].interrupting() {
                    status |= PACTL_SPI6;
                }
                status
            }
        }
    }

    fn write(&mut self, block: Block, index: usize, value: u32) {
        match block {
            Block::Gpio => match index {
                i if i < 6 => self.fsel[i] = value,
                gpio_offsets::GPSET0 => self.drive_high(value),
                gpio_offsets::GPCLR0 => self.drive_low(value),
                _ => {}
            },
            Block::Spi(i) => match index {
                spi_offsets::CS => {
                    let spi = &mut self.spi[i];
                    if value & CLEAR_TX != 0 {
                        spi.tx.clear();
                    }
                    if value & CLEAR_RX != 0 {
                        spi.rx.clear();
                    }
                    spi.cs = value & CS_WRITABLE;
                    self.shift(i);
                }
                spi_offsets::FIFO => {
                    let spi = &mut self.spi[i];
                    if spi.cs & TA != 0 && spi.tx.len() < transfer::FIFO_DEPTH {
                        spi.tx.push_back(value as u8);
                    }
                    self.shift(i);
                }
                spi_offsets::CLK => self.spi[i].clk = value,
                _ => {}
            },
            Block::Pactl => {}
        }
    }

    fn levels(&self) -> u32 {
        let mut levels = self.outputs;
        for id in ChannelId::ALL {
            let mask = id.pins().ready_mask();
            if self.chips[id.index()].current.is_some() {
                levels &= !mask;
            } else {
                levels |= mask;
            }
        }
        levels
    }

    fn shift(&mut self, i: usize) {
        let Hardware { spi, chips, .. } = self;
        let spi = &mut spi[i];
        while spi.cs & TA != 0 && !spi.tx.is_empty() && spi.rx.len() < transfer::FIFO_DEPTH {
            spi.tx.pop_front();
            spi.rx.push_back(chips[i].next_byte());
        }
    }

    fn drive_low(&mut self, mask: u32) {
        self.outputs &= !mask;
        if mask & (1 << pins::BOARD_RESET) != 0 {
            for chip in &mut self.chips {
                *chip = ChipModel::default();
            }
            self.edges.clear();
        }
        for id in ChannelId::ALL {
            if mask & (1 << id.pins().ss) != 0 {
                self.chips[id.index()].selected = true;
            }
        }
    }

    fn drive_high(&mut self, mask: u32) {
        self.outputs |= mask;
        for id in ChannelId::ALL {
            if mask & (1 << id.pins().ss) == 0 {
                continue;
            }
            let chip = &mut self.chips[id.index()];
            if !chip.selected {
                continue;
            }
            chip.selected = false;
            if chip.pos >= transfer::PACKET_SIZE {
                chip.current = None;
                chip.pos = 0;
                self.load_next(id);
            } else {
                // aborted mid-packet, the PIC will resend from the start
                chip.pos = 0;
            }
        }
    }

    fn load_next(&mut self, id: ChannelId) {
        let chip = &mut self.chips[id.index()];
        if chip.current.is_some() {
            return;
        }
        if let Some(packet) = chip.queue.pop_front() {
            chip.current = Some(packet);
            chip.pos = 0;
            self.edges.push(id.pins().ready);
        }
    }

    fn pending_completion(&self) -> bool {
        self.spi.iter().any(SpiModel::interrupting)
    }
}

struct Registration {
    handle: IrqHandle,
    trigger: Trigger,
    handler: IrqHandler,
}

#[derive(Default)]
struct Faults {
    map: Option<u64>,
    irq: Option<IrqLine>,
}

#[derive(Default)]
struct Inner {
    hw: Mutex<Hardware>,
    irqs: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    faults: Mutex<Faults>,
    mapped: AtomicUsize,
    delayed: Mutex<Duration>,
}

struct SimWindow {
    inner: Arc<Inner>,
    block: Block,
}

impl RegisterWindow for SimWindow {
    fn read_word(&self, index: usize) -> u32 {
        self.inner.hw.lock().read(self.block, index)
    }

    fn write_word(&self, index: usize, value: u32) {
        self.inner.hw.lock().write(self.block, index, value)
    }
}

impl Drop for SimWindow {
    fn drop(&mut self) {
        self.inner.mapped.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct SimBoard {
    inner: Arc<Inner>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet on a PIC. Its ready edge is delivered by the next pump.
    pub fn inject(&self, id: ChannelId, packet: Packet) {
        let mut hw = self.inner.hw.lock();
        hw.chips[id.index()].queue.push_back(packet);
        hw.load_next(id);
    }

    /// Deliver ready edges and service the completion line until the board
    /// is quiet. Returns the number of handler invocations.
    pub fn pump(&self) -> usize {
        let mut calls = 0;
        for _ in 0..MAX_PUMP_ROUNDS {
            let edges = self.deliver_edges();
            calls += edges;

            let level = self.inner.hw.lock().pending_completion();
            if level {
                let (n, handled) = self.fire_level();
                calls += n;
                if !handled {
                    warn!("sim: completion line asserted but no handler claimed it");
                    return calls;
                }
            }

            if edges == 0 && !level && self.inner.hw.lock().edges.is_empty() {
                return calls;
            }
        }
        warn!("sim: giving up after {} interrupt rounds", MAX_PUMP_ROUNDS);
        calls
    }

    /// Deliver pending ready edges only. Returns the number of handler
    /// invocations.
    pub fn deliver_edges(&self) -> usize {
        let edges = std::mem::take(&mut self.inner.hw.lock().edges);
        let mut calls = 0;
        for pin in edges {
            for handler in self.handlers(|line, trigger| {
                line == IrqLine::Gpio(pin) && trigger == Trigger::FallingEdge
            }) {
                handler();
                calls += 1;
            }
        }
        calls
    }

    fn fire_level(&self) -> (usize, bool) {
        let handlers = self.handlers(|line, trigger| {
            matches!(line, IrqLine::Number(_)) && trigger == Trigger::LevelHigh
        });
        let mut handled = false;
        for handler in &handlers {
            if handler() == IrqReturn::Handled {
                handled = true;
            }
        }
        (handlers.len(), handled)
    }

    fn handlers<F>(&self, wanted: F) -> Vec<IrqHandler>
    where
        F: Fn(IrqLine, Trigger) -> bool,
    {
        self.inner
            .irqs
            .lock()
            .iter()
            .filter(|r| wanted(r.handle.line, r.trigger))
            .map(|r| Arc::clone(&r.handler))
            .collect()
    }

    /// Make the next `map` of `base` fail.
    pub fn fail_map_at(&self, base: u64) {
        self.inner.faults.lock().map = Some(base);
    }

    /// Make requests for `line` fail.
    pub fn fail_irq_on(&self, line: IrqLine) {
        self.inner.faults.lock().irq = Some(line);
    }

    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = Faults::default();
    }

    pub fn mapped_blocks(&self) -> usize {
        self.inner.mapped.load(Ordering::SeqCst)
    }

    pub fn registered_irqs(&self) -> usize {
        self.inner.irqs.lock().len()
    }

    pub fn is_registered(&self, line: IrqLine) -> bool {
        self.inner.irqs.lock().iter().any(|r| r.handle.line == line)
    }

    pub fn pin_level(&self, pin: u8) -> bool {
        self.inner.hw.lock().levels() & (1 << pin) != 0
    }

    /// Function select code currently programmed for `pin`
    pub fn pin_function(&self, pin: u8) -> u32 {
        let word = self.inner.hw.lock().fsel[pin as usize / 10];
        (word >> ((pin as u32 % 10) * 3)) & 7
    }

    /// Writable bits of the controller's CS register
    pub fn spi_control(&self, id: ChannelId) -> u32 {
        self.inner.hw.lock().spi[id.index()].cs
    }

    pub fn spi_clock(&self, id: ChannelId) -> u32 {
        self.inner.hw.lock().spi[id.index()].clk
    }

    /// Packets loaded or queued on a PIC
    pub fn queued(&self, id: ChannelId) -> usize {
        let hw = self.inner.hw.lock();
        let chip = &hw.chips[id.index()];
        chip.queue.len() + chip.current.is_some() as usize
    }

    /// Sum of all delays requested by the driver
    pub fn total_delay(&self) -> Duration {
        *self.inner.delayed.lock()
    }
}

impl Platform for SimBoard {
    fn map(&self, base: u64, _len: usize) -> Result<Arc<dyn RegisterWindow>> {
        {
            let mut faults = self.inner.faults.lock();
            if faults.map == Some(base) {
                faults.map = None;
                return Err(DriverError::Map {
                    base,
                    reason: "injected fault".to_string(),
                });
            }
        }

        let block = match base {
            memory::GPIO_BASE => Block::Gpio,
            memory::SPI_A_BASE => Block::Spi(0),
            memory::SPI_B_BASE => Block::Spi(1),
            memory::PACTL_BASE => Block::Pactl,
            _ => {
                return Err(DriverError::Map {
                    base,
                    reason: "no simulated block at this address".to_string(),
                })
            }
        };
        self.inner.mapped.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimWindow {
            inner: Arc::clone(&self.inner),
            block,
        }))
    }

    fn request_irq(
        &self,
        line: IrqLine,
        trigger: Trigger,
        name: &str,
        handler: IrqHandler,
    ) -> Result<IrqHandle> {
        if self.inner.faults.lock().irq == Some(line) {
            return Err(DriverError::Irq {
                line: line.to_string(),
                reason: "injected fault".to_string(),
            });
        }
        let handle = IrqHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            line,
        };
        debug!("sim: {} attached to {} ({:?})", name, line, trigger);
        self.inner.irqs.lock().push(Registration {
            handle,
            trigger,
            handler,
        });
        Ok(handle)
    }

    fn free_irq(&self, handle: IrqHandle) {
        self.inner.irqs.lock().retain(|r| r.handle != handle);
    }

    fn delay(&self, duration: Duration) {
        *self.inner.delayed.lock() += duration;
    }
}

/// A well-formed packet for `receiver` (0..3) carrying sequence `seq` as
/// both its input and output sequence.
pub fn synth_packet(receiver: u8, seq: u8) -> Packet {
    synth_packet_with(receiver, seq, seq)
}

/// A well-formed packet with independent counters. The input sequence
/// counts per receiver, the output sequence per PIC.
pub fn synth_packet_with(receiver: u8, in_seq: u8, out_seq: u8) -> Packet {
    let mut bytes = [0u8; transfer::PACKET_SIZE];
    bytes[0] = SYNC_BYTE;
    bytes[1] = 0x01;
    bytes[2] = receiver;
    bytes[3] = 0x10 | (in_seq & 0x0f);
    for (i, b) in bytes[4..transfer::PAYLOAD_SIZE].iter_mut().enumerate() {
        *b = (i as u8).wrapping_add(in_seq).wrapping_mul(receiver | 1);
    }

    let in_seq = (in_seq & 0x0f) as u32;
    let out_seq = (out_seq & 0x0f) as u32;
    let status: u32 =
        1 << 8 | ((receiver & 3) as u32) << 12 | 1 << 17 | out_seq << 24 | in_seq << 28;
    bytes[transfer::PAYLOAD_SIZE..].copy_from_slice(&status.to_le_bytes());
    Packet::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_line_follows_chip() {
        let board = SimBoard::new();
        assert!(board.pin_level(pins::a::READY));
        board.inject(ChannelId::A, synth_packet(0, 0));
        assert!(!board.pin_level(pins::a::READY));
        assert!(board.pin_level(pins::b::READY));
        assert_eq!(board.queued(ChannelId::A), 1);
    }

    #[test]
    fn test_board_reset_clears_chips() {
        let board = SimBoard::new();
        board.inject(ChannelId::B, synth_packet(2, 0));
        let gpio = board.map(memory::GPIO_BASE, memory::BLOCK_SIZE).unwrap();
        gpio.write_word(gpio_offsets::GPCLR0, 1 << pins::BOARD_RESET);
        assert_eq!(board.queued(ChannelId::B), 0);
        assert!(board.pin_level(pins::b::READY));
    }

    #[test]
    fn test_spi_fifo_model() {
        let board = SimBoard::new();
        let spi = board.map(memory::SPI_A_BASE, memory::BLOCK_SIZE).unwrap();

        spi.write_word(spi_offsets::CS, TA);
        assert_ne!(spi.read_word(spi_offsets::CS) & DONE, 0);

        // 64 bytes fit the RX FIFO, the next 64 wait in TX
        for _ in 0..128 {
            spi.write_word(spi_offsets::FIFO, 0xff);
        }
        let cs = spi.read_word(spi_offsets::CS);
        assert_eq!(cs & TXD, 0);
        assert_ne!(cs & RXR, 0);
        assert_eq!(cs & DONE, 0);

        for _ in 0..128 {
            assert_ne!(spi.read_word(spi_offsets::CS) & RXD, 0);
            spi.read_word(spi_offsets::FIFO);
        }
        let cs = spi.read_word(spi_offsets::CS);
        assert_eq!(cs & RXD, 0);
        assert_ne!(cs & DONE, 0);
    }

    #[test]
    fn test_mapping_accounting() {
        let board = SimBoard::new();
        let a = board.map(memory::SPI_A_BASE, memory::BLOCK_SIZE).unwrap();
        let b = board.map(memory::SPI_B_BASE, memory::BLOCK_SIZE).unwrap();
        assert_eq!(board.mapped_blocks(), 2);
        drop(a);
        drop(b);
        assert_eq!(board.mapped_blocks(), 0);
        assert!(board.map(0x1000, memory::BLOCK_SIZE).is_err());
    }

    #[test]
    fn test_injected_faults() {
        let board = SimBoard::new();
        board.fail_map_at(memory::PACTL_BASE);
        assert!(board.map(memory::PACTL_BASE, memory::BLOCK_SIZE).is_err());
        assert!(board.map(memory::PACTL_BASE, memory::BLOCK_SIZE).is_ok());

        board.fail_irq_on(IrqLine::Number(5));
        let h: IrqHandler = Arc::new(|| IrqReturn::Handled);
        assert!(board
            .request_irq(IrqLine::Number(5), Trigger::LevelHigh, "x", h.clone())
            .is_err());
        assert!(board
            .request_irq(IrqLine::Gpio(10), Trigger::FallingEdge, "x", h)
            .is_ok());
        assert_eq!(board.registered_irqs(), 1);
    }

    #[test]
    fn test_synth_packet_shape() {
        let pkt = synth_packet(2, 0x13);
        assert!(pkt.has_sync());
        let status = pkt.status();
        assert!(status.valid());
        assert_eq!(status.receiver(), 2);
        assert_eq!(status.in_sequence(), 3);
        assert_eq!(status.out_sequence(), 3);
    }

    #[test]
    fn test_synth_packet_independent_counters() {
        let status = synth_packet_with(1, 0x02, 0x1e).status();
        assert_eq!(status.receiver(), 1);
        assert_eq!(status.in_sequence(), 2);
        assert_eq!(status.out_sequence(), 0x0e);
    }
}
