/// Interrupt-driven packet capture.
///
/// Two handlers move every packet:
///
/// - the ready-edge handler runs when either PIC pulls its ready line low,
///   claims a ring slot, selects the PIC and starts the SPI controller;
/// - the completion handler runs on the single interrupt line shared by both
///   SPI controllers, feeds dummy bytes into the TX FIFO, drains the RX FIFO
///   into the slot and publishes the slot once all 192 bytes are in.
///
/// Per channel the cycle is Idle -> Armed -> Draining -> Idle. A ready edge
/// for a channel that is not Idle is ignored; the PIC does not raise ready
/// again until the host has finished the previous transfer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{trace, warn};
use rppal::gpio::Level;

use crate::board::transfer::{DUMMY_TX, PACKET_SIZE};
use crate::channel::{Channel, ChannelId, Transfer};
use crate::gate::ReaderGate;
use crate::platform::IrqReturn;
use crate::regs::{GpioBlock, SpiBlock, StatusBlock, CS, PACTL_CS};
use crate::ring::Ring;

/// State shared between the interrupt handlers and the read path.
pub struct DriverState {
    pub channels: [Channel; 2],
    pub rings: [Ring; 2],
    pub gate: ReaderGate,
    pub counters: IrqCounters,
}

impl DriverState {
    pub fn new(ring_capacity: usize) -> Self {
        DriverState {
            channels: [Channel::new(ChannelId::A), Channel::new(ChannelId::B)],
            rings: [Ring::new(ring_capacity), Ring::new(ring_capacity)],
            gate: ReaderGate::new(),
            counters: IrqCounters::default(),
        }
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.index()]
    }

    pub fn ring(&self, id: ChannelId) -> &Ring {
        &self.rings[id.index()]
    }

    pub fn any_unread(&self) -> bool {
        self.rings.iter().any(Ring::has_unread)
    }

    /// Back to empty rings, idle channels and no pending read status.
    pub fn reset(&self) {
        for channel in &self.channels {
            channel.reset();
        }
        for ring in &self.rings {
            ring.reset();
        }
        self.gate.reset();
    }
}

/// Interrupt activity, for diagnostics
#[derive(Debug, Default)]
pub struct IrqCounters {
    pub ready_edges: AtomicU64,
    pub completions: AtomicU64,
    pub unhandled: AtomicU64,
    pub short_transfers: AtomicU64,
}

pub struct Engine {
    gpio: GpioBlock,
    spi: [SpiBlock; 2],
    status: StatusBlock,
    state: Arc<DriverState>,
    final_drain_spins: u32,
}

impl Engine {
    pub fn new(
        gpio: GpioBlock,
        spi: [SpiBlock; 2],
        status: StatusBlock,
        state: Arc<DriverState>,
        final_drain_spins: u32,
    ) -> Self {
        Engine {
            gpio,
            spi,
            status,
            state,
            final_drain_spins,
        }
    }

    pub fn gpio(&self) -> &GpioBlock {
        &self.gpio
    }

    pub fn spi(&self, id: ChannelId) -> &SpiBlock {
        &self.spi[id.index()]
    }

    /// Falling edge on either ready line. Both channels are checked on every
    /// call since edges can be coalesced.
    pub fn on_ready_edge(&self) -> IrqReturn {
        self.state.counters.ready_edges.fetch_add(1, Ordering::Relaxed);
        let levels = self.gpio.read_level_register();

        let mut started = 0;
        for id in ChannelId::ALL {
            if self.start_transfer(self.state.channel(id), levels) {
                started += 1;
            }
        }

        let ret = IrqReturn::from_count(started);
        if ret == IrqReturn::NotHandled {
            self.state.counters.unhandled.fetch_add(1, Ordering::Relaxed);
        }
        ret
    }

    fn start_transfer(&self, channel: &Channel, levels: u32) -> bool {
        let mut transfer = channel.transfer.lock();
        if transfer.in_progress() || levels & channel.pins.ready_mask() != 0 {
            return false;
        }

        let slot = self.state.ring(channel.id).claim();
        transfer.start(slot);
        self.gpio.set_pin(channel.pins.ss, Level::Low);
        self.spi(channel.id).modify_control(CS::TA::SET);
        trace!("channel {}: transfer into slot {}", channel.id, slot);
        true
    }

    /// Shared completion interrupt. The peripheral status register tells
    /// which controller raised it; both may be pending.
    pub fn on_completion(&self) -> IrqReturn {
        self.state.counters.completions.fetch_add(1, Ordering::Relaxed);
        let status = self.status.read();

        let pending: &[ChannelId] = match (
            status.is_set(PACTL_CS::SPI0),
            status.is_set(PACTL_CS::SPI6),
        ) {
            (false, false) => &[],
            (true, false) => &[ChannelId::A],
            (false, true) => &[ChannelId::B],
            (true, true) => &ChannelId::ALL,
        };

        let serviced: usize = pending.iter().map(|id| self.service(*id)).sum();

        let ret = IrqReturn::from_count(serviced);
        if ret == IrqReturn::NotHandled {
            self.state.counters.unhandled.fetch_add(1, Ordering::Relaxed);
        }
        ret
    }

    fn service(&self, id: ChannelId) -> usize {
        let channel = self.state.channel(id);
        let mut transfer = channel.transfer.lock();
        if !transfer.in_progress() {
            return 0;
        }

        let spi = self.spi(id);
        let mut serviced = 0;

        if spi.control().is_set(CS::RXR) {
            serviced += 1;
            self.drain(id, spi, &mut transfer);
        }

        if spi.control().is_set(CS::DONE) {
            serviced += 1;
            if transfer.tx_remaining == 0 {
                self.drain_final(id, spi, &mut transfer);
                spi.modify_control(CS::TA::CLEAR);
                let slot = transfer.slot;
                transfer.finish();
                self.state.ring(id).publish();
                self.state.gate.notify();
                self.gpio.set_pin(channel.pins.ss, Level::High);
                trace!("channel {}: slot {} published", id, slot);
            } else {
                while transfer.tx_remaining > 0 && spi.control().is_set(CS::TXD) {
                    spi.write_fifo(DUMMY_TX);
                    transfer.tx_remaining -= 1;
                }
            }
        }

        serviced
    }

    /// Move whatever the RX FIFO holds into the slot.
    fn drain(&self, id: ChannelId, spi: &SpiBlock, transfer: &mut Transfer) {
        let mut buf = [0u8; PACKET_SIZE];
        let mut n = 0;
        while n < transfer.rx_remaining && spi.control().is_set(CS::RXD) {
            buf[n] = spi.read_fifo();
            n += 1;
        }
        self.commit(id, transfer, &buf[..n]);
    }

    /// All dummy bytes are out; wait for the last received bytes to land.
    fn drain_final(&self, id: ChannelId, spi: &SpiBlock, transfer: &mut Transfer) {
        let mut buf = [0u8; PACKET_SIZE];
        let mut n = 0;
        let mut idle_polls = 0;
        while n < transfer.rx_remaining {
            if spi.control().is_set(CS::RXD) {
                buf[n] = spi.read_fifo();
                n += 1;
            } else {
                idle_polls += 1;
                if idle_polls > self.final_drain_spins {
                    warn!(
                        "channel {}: {} byte(s) never arrived, publishing short packet",
                        id,
                        transfer.rx_remaining - n
                    );
                    self.state
                        .counters
                        .short_transfers
                        .fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
        self.commit(id, transfer, &buf[..n]);
    }

    fn commit(&self, id: ChannelId, transfer: &mut Transfer, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let offset = transfer.received(bytes.len());
        self.state.ring(id).store(transfer.slot, offset, bytes);
    }
}
