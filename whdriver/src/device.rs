/// Device entry points: open, write, read, release.
///
/// A `Device` lives from driver load to driver unload (its `Drop`). The
/// hardware is armed by the first `open` after the shared completion
/// interrupt number has been written, and disarmed by `release`.
///
/// Only one reader is supported. Reads alternate between the two channels so
/// neither stream starves the other.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rppal::gpio::Level;

use crate::board::{interrupts, memory, pins, transfer::PACKET_SIZE};
use crate::channel::ChannelId;
use crate::config::DriverConfig;
use crate::engine::{DriverState, Engine};
use crate::error::{DriverError, Result};
use crate::gate::Abort;
use crate::platform::{IrqHandle, IrqLine, Platform, Trigger};
use crate::regs::{GpioBlock, PinFunction, SpiBlock, StatusBlock, CS};
use crate::watchdog::Watchdog;

/// Hardware held while the device is armed
struct Session {
    engine: Arc<Engine>,
    /// In request order: ready A, ready B, completion
    irqs: Vec<IrqHandle>,
}

/// Frees already attached interrupts if bring-up bails out half way.
struct IrqGuard<'a> {
    platform: &'a dyn Platform,
    handles: Vec<IrqHandle>,
}

impl IrqGuard<'_> {
    fn into_handles(mut self) -> Vec<IrqHandle> {
        std::mem::take(&mut self.handles)
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..).rev() {
            warn!("Releasing {} after failed bring-up", handle.line);
            self.platform.free_irq(handle);
        }
    }
}

/// Snapshot of driver counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub ready_edges: u64,
    pub completions: u64,
    pub unhandled: u64,
    pub short_transfers: u64,
    pub unread: [u32; 2],
}

pub struct Device {
    platform: Arc<dyn Platform>,
    config: DriverConfig,
    state: Arc<DriverState>,
    irq_number: AtomicU32,
    open_count: AtomicU32,
    /// Fairness toggle, persists across reads
    poll_count: AtomicU32,
    session: Mutex<Option<Session>>,
    watchdog: Watchdog,
}

impl Device {
    /// Driver load: allocate the rings and start the watchdog.
    pub fn load(platform: Arc<dyn Platform>, config: DriverConfig) -> Self {
        let state = Arc::new(DriverState::new(config.ring_capacity));

        let wd_state = Arc::clone(&state);
        let watchdog = Watchdog::start(config.tick_period(), config.timeout_ticks, move || {
            wd_state.gate.timeout_waiter()
        });

        info!(
            "whdriver loaded, {} slots of {} bytes per channel",
            config.ring_capacity, PACKET_SIZE
        );

        Device {
            platform,
            config,
            state,
            irq_number: AtomicU32::new(0),
            open_count: AtomicU32::new(0),
            poll_count: AtomicU32::new(0),
            session: Mutex::new(None),
            watchdog,
        }
    }

    /// Open the device; arms the hardware on the first open after the
    /// completion interrupt number is known.
    pub fn open(&self) -> Result<()> {
        let opens = self.open_count.fetch_add(1, Ordering::SeqCst) + 1;
        let irq = self.irq_number.load(Ordering::SeqCst);

        {
            let mut session = self.session.lock();
            if session.is_none() && irq != 0 {
                *session = Some(self.bring_up(irq)?);
            }
        }

        if irq == 0 {
            info!("Opened, but the completion interrupt number is not yet provided");
        }
        info!("Opened: {} time(s)", opens);
        Ok(())
    }

    /// Configure the shared completion interrupt number. Only 4 byte writes
    /// are accepted.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let raw: [u8; 4] = buf
            .try_into()
            .map_err(|_| DriverError::WriteLength(buf.len()))?;
        let irq = u32::from_le_bytes(raw);
        self.irq_number.store(irq, Ordering::SeqCst);
        info!("Completion interrupt number ({}) provided", irq);
        Ok(0)
    }

    /// Block until a packet is available on either channel, then copy it
    /// (payload and status word) into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.watchdog.reset();

        if self.irq_number.load(Ordering::SeqCst) == 0 {
            debug!("Read, but the completion interrupt number is not yet provided");
            return Err(DriverError::NotConfigured);
        }
        if buf.len() != PACKET_SIZE {
            debug!("Read with length {}", buf.len());
            return Err(DriverError::ReadLength(buf.len()));
        }

        let state = &self.state;
        loop {
            state.gate.wait(|| state.any_unread())?;
            // rings may have been reset by a reopen since the wake
            if self.fetch_fair(buf) {
                return Ok(PACKET_SIZE);
            }
        }
    }

    /// One pass over both rings: B on even polls, A on odd.
    fn fetch_fair(&self, buf: &mut [u8]) -> bool {
        (0..ChannelId::ALL.len()).any(|_| {
            let poll = self.poll_count.fetch_add(1, Ordering::SeqCst);
            let id = if poll & 1 == 0 { ChannelId::B } else { ChannelId::A };
            self.state.ring(id).fetch_into(buf)
        })
    }

    /// Close the device. Disarms the hardware if armed and wakes a parked
    /// reader with `Shutdown`. Closing an unarmed device does nothing.
    pub fn release(&self) -> Result<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            self.tear_down(session);
            self.irq_number.store(0, Ordering::SeqCst);
        }
        info!("Closed");
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn irq_number(&self) -> Option<u32> {
        match self.irq_number.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn stats(&self) -> DeviceStats {
        let c = &self.state.counters;
        DeviceStats {
            ready_edges: c.ready_edges.load(Ordering::Relaxed),
            completions: c.completions.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            short_transfers: c.short_transfers.load(Ordering::Relaxed),
            unread: [
                self.state.ring(ChannelId::A).available(),
                self.state.ring(ChannelId::B).available(),
            ],
        }
    }

    fn bring_up(&self, irq: u32) -> Result<Session> {
        self.state.reset();
        self.poll_count.store(0, Ordering::SeqCst);

        let map = |base| self.platform.map(base, memory::BLOCK_SIZE);
        let gpio = GpioBlock::new(map(memory::GPIO_BASE)?);
        let spi = [
            SpiBlock::new(map(memory::SPI_A_BASE)?),
            SpiBlock::new(map(memory::SPI_B_BASE)?),
        ];
        let status = StatusBlock::new(map(memory::PACTL_BASE)?);
        for id in ChannelId::ALL {
            info!(
                "SPI {} mapped, DC is {:#010x}",
                id,
                spi[id.index()].data_control()
            );
        }

        gpio.set_pin(pins::BOARD_RESET, Level::Low);
        gpio.configure_pin(pins::BOARD_RESET, PinFunction::Output);
        self.platform.delay(self.config.reset_hold());
        gpio.set_pin(pins::BOARD_RESET, Level::High);
        self.platform.delay(self.config.reset_settle());

        for id in ChannelId::ALL {
            let p = id.pins();
            gpio.configure_pin(p.ss, PinFunction::Output);
            gpio.configure_pin(p.clk, p.alt);
            gpio.configure_pin(p.miso, p.alt);
            gpio.configure_pin(p.ready, PinFunction::Input);
            gpio.set_pin(p.ss, Level::High);

            let s = &spi[id.index()];
            s.reset();
            s.set_clock_divider(self.config.clock_divider);
            s.write_control(CS::CLEAR_FIFO::Both + CS::CPOL::SET);
        }

        let engine = Arc::new(Engine::new(
            gpio,
            spi,
            status,
            Arc::clone(&self.state),
            self.config.final_drain_spins,
        ));

        let mut guard = IrqGuard {
            platform: &*self.platform,
            handles: Vec::with_capacity(3),
        };
        for (pin, name) in [
            (pins::a::READY, interrupts::READY_A_NAME),
            (pins::b::READY, interrupts::READY_B_NAME),
        ] {
            let e = Arc::clone(&engine);
            let handle = self.platform.request_irq(
                IrqLine::Gpio(pin),
                Trigger::FallingEdge,
                name,
                Arc::new(move || e.on_ready_edge()),
            )?;
            info!("Ready line GPIO {} attached", pin);
            guard.handles.push(handle);
        }

        let e = Arc::clone(&engine);
        let handle = self.platform.request_irq(
            IrqLine::Number(irq),
            Trigger::LevelHigh,
            interrupts::COMPLETION_NAME,
            Arc::new(move || e.on_completion()),
        )?;
        info!("SPI completion handlers attached to IRQ {}", irq);
        guard.handles.push(handle);

        for id in ChannelId::ALL {
            engine.spi(id).modify_control(CS::INTD::SET + CS::INTR::SET);
        }

        Ok(Session {
            engine,
            irqs: guard.into_handles(),
        })
    }

    fn tear_down(&self, session: Session) {
        self.state.gate.post(Abort::Shutdown);

        // Twice, in case a completion interrupt was in flight during the
        // first pass and re-enabled a transfer.
        for _ in 0..2 {
            for id in [ChannelId::B, ChannelId::A] {
                session.engine.spi(id).modify_control(
                    CS::INTD::CLEAR + CS::INTR::CLEAR + CS::CLEAR_FIFO::None + CS::TA::CLEAR,
                );
            }
            self.platform.delay(self.config.teardown_settle());
        }

        for handle in session.irqs.into_iter().rev() {
            self.platform.free_irq(handle);
        }
        for channel in &self.state.channels {
            channel.reset();
        }
        drop(session.engine);
        info!("Interrupts freed, registers unmapped");
    }
}

impl Drop for Device {
    /// Driver unload
    fn drop(&mut self) {
        self.watchdog.stop();
        let session = self.session.get_mut().take();
        if let Some(session) = session {
            info!("Device still open at unload");
            self.tear_down(session);
        }
        info!("whdriver unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TransferState;
    use crate::sim::{synth_packet, SimBoard};
    use std::thread;
    use std::time::{Duration, Instant};

    const IRQ: u32 = 57;

    fn test_config() -> DriverConfig {
        DriverConfig {
            tick_period_ms: 10,
            timeout_ticks: 5,
            ring_capacity: 16,
            final_drain_spins: 1000,
            ..DriverConfig::default()
        }
    }

    fn load(board: &SimBoard) -> Arc<Device> {
        let _ = env_logger::builder().is_test(true).try_init();
        Arc::new(Device::load(Arc::new(board.clone()), test_config()))
    }

    fn armed(board: &SimBoard) -> Arc<Device> {
        let dev = load(board);
        dev.open().unwrap();
        dev.write(&IRQ.to_le_bytes()).unwrap();
        dev.release().unwrap();
        dev.open().unwrap();
        dev.write(&IRQ.to_le_bytes()).unwrap();
        assert!(dev.is_armed());
        dev
    }

    fn wait_parked(dev: &Device) {
        let start = Instant::now();
        while !dev.state.gate.is_waiting() {
            assert!(start.elapsed() < Duration::from_secs(2), "reader never parked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_write_length() {
        let board = SimBoard::new();
        let dev = load(&board);
        assert!(matches!(dev.write(&[1, 2, 3]), Err(DriverError::WriteLength(3))));
        assert_eq!(dev.write(&[57, 0, 0, 0]).unwrap(), 0);
        assert_eq!(dev.irq_number(), Some(57));
    }

    #[test]
    fn test_open_without_irq_does_not_arm() {
        let board = SimBoard::new();
        let dev = load(&board);
        dev.open().unwrap();
        assert!(!dev.is_armed());
        assert_eq!(board.mapped_blocks(), 0);

        let mut buf = [0u8; PACKET_SIZE];
        assert!(matches!(dev.read(&mut buf), Err(DriverError::NotConfigured)));
    }

    #[test]
    fn test_bring_up_programs_hardware() {
        let board = SimBoard::new();
        let _dev = armed(&board);

        assert_eq!(board.mapped_blocks(), 4);
        assert_eq!(board.registered_irqs(), 3);
        assert!(board.is_registered(IrqLine::Gpio(pins::a::READY)));
        assert!(board.is_registered(IrqLine::Gpio(pins::b::READY)));
        assert!(board.is_registered(IrqLine::Number(IRQ)));

        for id in ChannelId::ALL {
            let p = id.pins();
            assert_eq!(board.pin_function(p.ss), PinFunction::Output.code());
            assert_eq!(board.pin_function(p.clk), p.alt.code());
            assert_eq!(board.pin_function(p.miso), p.alt.code());
            assert_eq!(board.pin_function(p.ready), PinFunction::Input.code());
            assert!(board.pin_level(p.ss));
            assert_eq!(board.spi_clock(id), 32);
            // CPOL, INTD, INTR
            assert_eq!(board.spi_control(id), (1 << 3) | (1 << 9) | (1 << 10));
        }
        assert!(board.pin_level(pins::BOARD_RESET));
        assert!(board.total_delay() >= Duration::from_millis(1100));
    }

    #[test]
    fn test_round_trip_verbatim() {
        let board = SimBoard::new();
        let dev = armed(&board);

        let pkt = synth_packet(1, 4);
        board.inject(ChannelId::A, pkt.clone());
        board.pump();

        let mut buf = [0u8; PACKET_SIZE];
        assert_eq!(dev.read(&mut buf).unwrap(), PACKET_SIZE);
        assert_eq!(buf, pkt.bytes);
        assert_eq!(dev.stats().unread, [0, 0]);
    }

    #[test]
    fn test_fair_alternation_b_first() {
        let board = SimBoard::new();
        let dev = armed(&board);

        for seq in 0..3u8 {
            board.inject(ChannelId::A, synth_packet(0, seq));
            board.inject(ChannelId::B, synth_packet(2, seq));
        }
        board.pump();

        let mut buf = [0u8; PACKET_SIZE];
        let mut order = Vec::new();
        for _ in 0..6 {
            dev.read(&mut buf).unwrap();
            let status = crate::packet::Packet::from_bytes(buf).status();
            order.push((status.receiver(), status.in_sequence()));
        }
        assert_eq!(
            order,
            vec![(2, 0), (0, 0), (2, 1), (0, 1), (2, 2), (0, 2)]
        );
    }

    #[test]
    fn test_single_channel_drains_in_order() {
        let board = SimBoard::new();
        let dev = armed(&board);

        for seq in 0..3u8 {
            board.inject(ChannelId::A, synth_packet(0, seq));
        }
        board.pump();

        let mut buf = [0u8; PACKET_SIZE];
        for seq in 0..3u8 {
            dev.read(&mut buf).unwrap();
            assert_eq!(buf, synth_packet(0, seq).bytes);
        }
    }

    #[test]
    fn test_read_length_checked_without_consuming() {
        let board = SimBoard::new();
        let dev = armed(&board);
        board.inject(ChannelId::B, synth_packet(2, 0));
        board.pump();

        let mut short = [0u8; 188];
        assert!(matches!(dev.read(&mut short), Err(DriverError::ReadLength(188))));
        assert_eq!(dev.stats().unread, [0, 1]);

        let mut buf = [0u8; PACKET_SIZE];
        assert_eq!(dev.read(&mut buf).unwrap(), PACKET_SIZE);
    }

    #[test]
    fn test_bad_read_length_returns_without_blocking() {
        let board = SimBoard::new();
        let cfg = DriverConfig {
            tick_period_ms: 500,
            timeout_ticks: 1000,
            ..test_config()
        };
        let dev = Device::load(Arc::new(board.clone()), cfg);
        dev.write(&IRQ.to_le_bytes()).unwrap();
        dev.open().unwrap();
        assert!(dev.is_armed());

        for len in [PACKET_SIZE - 1, PACKET_SIZE + 1] {
            let mut buf = vec![0u8; len];
            let start = Instant::now();
            let err = dev.read(&mut buf).unwrap_err();
            assert!(start.elapsed() < Duration::from_millis(100));
            assert!(matches!(err, DriverError::ReadLength(n) if n == len));
            assert_eq!(err.code(), -1);
        }
        assert_eq!(dev.stats().unread, [0, 0]);
        assert!(!dev.state.gate.is_waiting());
    }

    #[test]
    fn test_empty_pass_keeps_b_first_order() {
        let board = SimBoard::new();
        let dev = armed(&board);

        let mut buf = [0u8; PACKET_SIZE];
        assert!(!dev.fetch_fair(&mut buf));
        assert!(!dev.fetch_fair(&mut buf));
        assert_eq!(buf, [0u8; PACKET_SIZE]);

        board.inject(ChannelId::A, synth_packet(0, 0));
        board.inject(ChannelId::B, synth_packet(2, 0));
        board.pump();
        dev.read(&mut buf).unwrap();
        assert_eq!(buf, synth_packet(2, 0).bytes);
        dev.read(&mut buf).unwrap();
        assert_eq!(buf, synth_packet(0, 0).bytes);
    }

    #[test]
    fn test_timeout_after_watchdog_window() {
        let board = SimBoard::new();
        let dev = armed(&board);

        let start = Instant::now();
        let mut buf = [0u8; PACKET_SIZE];
        let err = dev.read(&mut buf).unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout());
        assert_eq!(err.code(), -5);
        // first tick may land at any phase of the period
        assert!(elapsed >= Duration::from_millis(40), "timed out after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(1), "timed out after {:?}", elapsed);
        // hardware untouched
        assert!(dev.is_armed());
    }

    #[test]
    fn test_blocked_read_woken_by_data() {
        let board = SimBoard::new();
        let cfg = DriverConfig {
            timeout_ticks: 1000,
            ..test_config()
        };
        let dev = Arc::new(Device::load(Arc::new(board.clone()), cfg));
        dev.write(&IRQ.to_le_bytes()).unwrap();
        dev.open().unwrap();

        let reader = {
            let dev = Arc::clone(&dev);
            thread::spawn(move || {
                let mut buf = [0u8; PACKET_SIZE];
                dev.read(&mut buf).map(|_| buf)
            })
        };
        wait_parked(&dev);

        let pkt = synth_packet(3, 7);
        board.inject(ChannelId::B, pkt.clone());
        board.pump();
        assert_eq!(reader.join().unwrap().unwrap(), pkt.bytes);
    }

    #[test]
    fn test_release_wakes_blocked_reader() {
        let board = SimBoard::new();
        let dev = Arc::new(Device::load(
            Arc::new(board.clone()),
            DriverConfig {
                timeout_ticks: u32::MAX,
                ..test_config()
            },
        ));
        dev.write(&IRQ.to_le_bytes()).unwrap();
        dev.open().unwrap();

        let reader = {
            let dev = Arc::clone(&dev);
            thread::spawn(move || {
                let mut buf = [0u8; PACKET_SIZE];
                dev.read(&mut buf)
            })
        };
        wait_parked(&dev);

        dev.release().unwrap();
        let err = reader.join().unwrap().unwrap_err();
        assert!(matches!(err, DriverError::Shutdown));
        assert_eq!(err.code(), -3);
    }

    #[test]
    fn test_release_disarms_and_is_idempotent() {
        let board = SimBoard::new();
        let dev = armed(&board);

        board.inject(ChannelId::A, synth_packet(0, 0));
        board.deliver_edges();
        assert_eq!(dev.state.channel(ChannelId::A).state(), TransferState::Armed);

        dev.release().unwrap();
        assert!(!dev.is_armed());
        assert_eq!(dev.irq_number(), None);
        assert_eq!(board.registered_irqs(), 0);
        assert_eq!(board.mapped_blocks(), 0);
        assert_eq!(dev.state.channel(ChannelId::A).state(), TransferState::Idle);
        for id in ChannelId::ALL {
            assert_eq!(board.spi_control(id), 1 << 3);
        }

        assert!(dev.release().is_ok());
        assert!(dev.release().is_ok());
    }

    #[test]
    fn test_reopen_resets_state() {
        let board = SimBoard::new();
        let dev = armed(&board);
        board.inject(ChannelId::A, synth_packet(0, 0));
        board.pump();
        assert_eq!(dev.stats().unread, [1, 0]);

        dev.release().unwrap();
        dev.write(&IRQ.to_le_bytes()).unwrap();
        dev.open().unwrap();
        assert!(dev.is_armed());
        assert_eq!(dev.stats().unread, [0, 0]);

        // pending shutdown from the release was cleared by bring-up
        board.inject(ChannelId::B, synth_packet(2, 1));
        board.pump();
        let mut buf = [0u8; PACKET_SIZE];
        assert_eq!(dev.read(&mut buf).unwrap(), PACKET_SIZE);
        assert_eq!(buf, synth_packet(2, 1).bytes);
    }

    #[test]
    fn test_irq_failure_leaves_nothing_armed() {
        let board = SimBoard::new();
        board.fail_irq_on(IrqLine::Number(IRQ));
        let dev = load(&board);
        dev.write(&IRQ.to_le_bytes()).unwrap();

        let err = dev.open().unwrap_err();
        assert!(matches!(err, DriverError::Irq { .. }));
        assert!(!dev.is_armed());
        assert_eq!(board.registered_irqs(), 0);
        assert_eq!(board.mapped_blocks(), 0);

        board.clear_faults();
        dev.open().unwrap();
        assert!(dev.is_armed());
    }

    #[test]
    fn test_map_failure_leaves_nothing_armed() {
        let board = SimBoard::new();
        board.fail_map_at(memory::SPI_B_BASE);
        let dev = load(&board);
        dev.write(&IRQ.to_le_bytes()).unwrap();

        assert!(matches!(dev.open(), Err(DriverError::Map { .. })));
        assert!(!dev.is_armed());
        assert_eq!(board.mapped_blocks(), 0);
        assert_eq!(board.registered_irqs(), 0);
    }

    #[test]
    fn test_unload_tears_down() {
        let board = SimBoard::new();
        let dev = armed(&board);
        drop(Arc::try_unwrap(dev).ok().expect("sole owner"));
        assert_eq!(board.registered_irqs(), 0);
        assert_eq!(board.mapped_blocks(), 0);
    }

    #[test]
    fn test_wraparound_through_read() {
        let board = SimBoard::new();
        let dev = armed(&board);
        let capacity = test_config().ring_capacity as u8;

        for seq in 0..=capacity {
            board.inject(ChannelId::A, synth_packet(0, seq));
        }
        board.pump();
        assert_eq!(dev.stats().unread[0], capacity as u32 + 1);

        let mut buf = [0u8; PACKET_SIZE];
        dev.read(&mut buf).unwrap();
        assert_eq!(buf, synth_packet(0, capacity).bytes);
    }
}
