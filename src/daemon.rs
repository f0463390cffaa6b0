use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use whdriver::board::transfer::PACKET_SIZE;
use whdriver::sim::synth_packet_with;
use whdriver::{ChannelId, Device, DriverError, LinuxPlatform, Packet, Platform, SimBoard};

use crate::config::{Config, PlatformConfig};
use crate::discovery;
use crate::monitor::{Monitor, Verdict};
use crate::output::Outputs;

const QUEUE_DEPTH: usize = 1024;
/// Stands in for the completion interrupt number on the simulated board
const SIM_IRQ: u32 = 1;

/// Opens the device the way the driver expects: the interrupt number is
/// written on two consecutive opens so it survives a stale close.
pub fn handshake(device: &Device, irq: u32) -> Result<()> {
    let irq = irq.to_le_bytes();
    device.open().context("First open failed")?;
    device.write(&irq).context("Failed to write IRQ number")?;
    device.release().context("Close after first write failed")?;
    device.open().context("Second open failed")?;
    device.write(&irq).context("Failed to write IRQ number")?;
    if !device.is_armed() {
        return Err(anyhow!("Device did not arm after the handshake"));
    }
    Ok(())
}

/// Blocking read loop, run off the async runtime
fn read_loop(device: Arc<Device>, tx: mpsc::Sender<Packet>) {
    let mut buf = [0u8; PACKET_SIZE];
    loop {
        match device.read(&mut buf) {
            Ok(_) => {
                if tx.blocking_send(Packet::from_bytes(buf)).is_err() {
                    debug!("Packet queue closed");
                    break;
                }
            }
            // both receivers idle
            Err(e) if e.is_timeout() => continue,
            Err(DriverError::Shutdown) | Err(DriverError::NotConfigured) => {
                info!("Device closed, reader stopping");
                break;
            }
            Err(e) => {
                error!("Read failed ({}): {}", e.code(), e);
                break;
            }
        }
    }
}

/// Packet order of the simulated board: receivers take turns, receivers
/// 0,1 sit behind PIC_A and 2,3 behind PIC_B. The input sequence counts per
/// receiver and the output sequence per PIC, as the real chips do.
#[derive(Debug, Default)]
struct FeedSequence {
    receiver: u8,
    in_seq: [u8; 4],
    out_seq: [u8; 2],
}

impl FeedSequence {
    fn next_packet(&mut self) -> (ChannelId, Packet) {
        let rx = self.receiver as usize;
        let chip = rx >> 1;
        let id = if chip == 0 { ChannelId::A } else { ChannelId::B };
        let packet = synth_packet_with(self.receiver, self.in_seq[rx], self.out_seq[chip]);

        self.in_seq[rx] = self.in_seq[rx].wrapping_add(1);
        self.out_seq[chip] = self.out_seq[chip].wrapping_add(1);
        self.receiver = (self.receiver + 1) % 4;
        (id, packet)
    }
}

/// Synthetic packet source for the simulated board
struct Feeder {
    should_stop: Arc<AtomicBool>,
    feed_thread: Option<thread::JoinHandle<()>>,
}

impl Feeder {
    fn start(board: SimBoard, packets_per_second: u32) -> Self {
        let should_stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&should_stop);
        let period = Duration::from_secs(1) / packets_per_second.max(1);

        let feed_thread = thread::spawn(move || {
            let mut sequence = FeedSequence::default();
            while !thread_stop.load(Ordering::SeqCst) {
                let (id, packet) = sequence.next_packet();
                board.inject(id, packet);
                board.pump();
                thread::sleep(period);
            }
        });

        Feeder {
            should_stop,
            feed_thread: Some(feed_thread),
        }
    }

    fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.feed_thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct Daemon {
    device: Arc<Device>,
    reader: Option<JoinHandle<()>>,
    packets: mpsc::Receiver<Packet>,
    feeder: Option<Feeder>,
    monitor: Monitor,
    outputs: Outputs,
    stats: Interval,
    config: Config,
}

fn stats_interval(secs: u64) -> Interval {
    let mut stats = interval(Duration::from_secs(secs.max(1)));
    stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stats
}

impl Daemon {
    pub async fn new(config: Config) -> Result<Self> {
        let (platform, irq, board): (Arc<dyn Platform>, u32, Option<SimBoard>) =
            match &config.platform {
                PlatformConfig::Linux { uio_device } => {
                    let irq = discovery::discover(&config.discovery)?;
                    let platform: Arc<dyn Platform> = Arc::new(
                        LinuxPlatform::new(uio_device.as_str())
                            .context("Failed to open the GPIO controller")?,
                    );
                    (platform, irq, None)
                }
                PlatformConfig::Simulate { packets_per_second } => {
                    info!("Simulated board, {} packets/s", packets_per_second);
                    let board = SimBoard::new();
                    let platform: Arc<dyn Platform> = Arc::new(board.clone());
                    (platform, SIM_IRQ, Some(board))
                }
            };

        let device = Arc::new(Device::load(platform, config.driver.clone()));
        // bring-up sleeps through the board reset
        let handshake_device = Arc::clone(&device);
        tokio::task::spawn_blocking(move || handshake(&handshake_device, irq))
            .await
            .context("Handshake task panicked")??;
        info!("Device armed on IRQ {}", irq);

        let outputs = Outputs::bind(&config.outputs).await?;

        let (tx, packets) = mpsc::channel(QUEUE_DEPTH);
        let reader_device = Arc::clone(&device);
        let reader = tokio::task::spawn_blocking(move || read_loop(reader_device, tx));

        let feeder = match (&config.platform, board) {
            (PlatformConfig::Simulate { packets_per_second }, Some(board)) => {
                Some(Feeder::start(board, *packets_per_second))
            }
            _ => None,
        };

        Ok(Daemon {
            device,
            reader: Some(reader),
            packets,
            feeder,
            monitor: Monitor::new(),
            outputs,
            stats: stats_interval(config.stats.interval_secs),
            config,
        })
    }

    /// Handle the next packet or stats tick. Safe to cancel.
    pub async fn poll(&mut self) -> Result<()> {
        tokio::select! {
            maybe_packet = self.packets.recv() => {
                let packet = maybe_packet.ok_or_else(|| anyhow!("Reader thread stopped"))?;
                self.handle(&packet).await;
            }
            _ = self.stats.tick() => self.log_status(),
        }
        Ok(())
    }

    async fn handle(&mut self, packet: &Packet) {
        match self.monitor.observe(packet) {
            Verdict::Forward(receiver) => self.outputs.forward(receiver, packet.payload()).await,
            Verdict::Corrupt(receiver) => debug!("Receiver {}: sync byte missing", receiver),
            Verdict::Dropped(_) => {}
        }
    }

    fn log_status(&self) {
        let stats = self.device.stats();
        let report = self.monitor.report(stats.unread, stats.short_transfers);
        match serde_json::to_string(&report) {
            Ok(json) => info!("status {}", json),
            Err(e) => warn!("Failed to encode status: {}", e),
        }
        debug!(
            "irq: {} ready edges, {} completions, {} unhandled, {} datagrams sent",
            stats.ready_edges,
            stats.completions,
            stats.unhandled,
            self.outputs.datagrams_sent()
        );
    }

    /// Outputs and the stats interval follow the new file; driver and
    /// platform settings need a restart.
    pub async fn reload_config(&mut self, new_config: Config) -> Result<()> {
        if new_config.platform != self.config.platform {
            warn!("Platform change ignored until restart");
        }
        self.outputs = Outputs::bind(&new_config.outputs).await?;
        self.stats = stats_interval(new_config.stats.interval_secs);
        self.config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Close the device and wait for the reader to finish.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.packets.close();
        let feeder = self.feeder.take();
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || {
            if let Some(mut feeder) = feeder {
                feeder.stop();
            }
            device.release()
        })
        .await
        .context("Close task panicked")?
        .context("Failed to close device")?;
        if let Some(reader) = self.reader.take() {
            reader.await.context("Reader task panicked")?;
        }
        self.log_status();
        Ok(())
    }
}
