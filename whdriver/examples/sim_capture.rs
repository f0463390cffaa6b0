/// Capture demo on the simulated board
/// Feeds both channels from a background thread and reads packets through
/// the device until Ctrl+C or the packet budget is reached.

use anyhow::Result;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use whdriver::board::transfer::PACKET_SIZE;
use whdriver::sim::synth_packet;
use whdriver::{ChannelId, Device, DriverConfig, Packet, SimBoard};

const PACKETS: usize = 64;

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .try_init()
        .ok();

    info!("Simulated capture demo starting...");

    let board = SimBoard::new();
    let config = DriverConfig {
        reset_settle_ms: 0,
        ..DriverConfig::default()
    };
    let device = Device::load(Arc::new(board.clone()), config);

    // Same handshake the receive daemon performs
    let irq = 57u32.to_le_bytes();
    device.open()?;
    device.write(&irq)?;
    device.release()?;
    device.open()?;
    device.write(&irq)?;

    let should_stop = Arc::new(AtomicBool::new(false));
    let should_stop_ctrl_c = Arc::clone(&should_stop);
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, stopping...");
        should_stop_ctrl_c.store(true, Ordering::SeqCst);
    })?;

    let feeder_stop = Arc::clone(&should_stop);
    let feeder_board = board.clone();
    let feeder = thread::spawn(move || {
        let mut seq = 0u8;
        while !feeder_stop.load(Ordering::SeqCst) {
            feeder_board.inject(ChannelId::A, synth_packet(0, seq));
            feeder_board.inject(ChannelId::B, synth_packet(2, seq));
            feeder_board.pump();
            seq = seq.wrapping_add(1);
            thread::sleep(Duration::from_millis(20));
        }
    });

    let mut buf = [0u8; PACKET_SIZE];
    let mut received = 0;
    while !should_stop.load(Ordering::SeqCst) && received < PACKETS {
        match device.read(&mut buf) {
            Ok(_) => {
                received += 1;
                let status = Packet::from_bytes(buf).status();
                info!(
                    "receiver {} seq {} sync {}",
                    status.receiver(),
                    status.in_sequence(),
                    buf[0] == whdriver::packet::SYNC_BYTE
                );
            }
            Err(e) if e.is_timeout() => warn!("No packet within the watchdog window"),
            Err(e) => {
                error!("Read failed: {}", e);
                break;
            }
        }
    }

    should_stop.store(true, Ordering::SeqCst);
    let _ = feeder.join();
    device.release()?;

    info!("Received {} packets, {:?}", received, device.stats());
    Ok(())
}
