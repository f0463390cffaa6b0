/// Per-receiver stream health, derived from the status word the PICs append
/// to every packet.

use serde::Serialize;
use whdriver::Packet;

pub const RECEIVERS: usize = 4;
const NULL_PID: u16 = 0x1fff;

/// What to do with a packet after it has been accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Valid transport stream packet for this receiver
    Forward(u8),
    /// Sync byte missing
    Corrupt(u8),
    /// Status word marks the packet invalid
    Dropped(u8),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    pub packets: u64,
    pub null_packets: u64,
    pub sync_errors: u64,
    pub in_sequence_errors: u64,
    pub restarts: u64,
    pub overflows: u64,
    pub invalid: u64,
    #[serde(skip)]
    last_in_sequence: Option<u8>,
}

/// Output sequence is counted per PIC, not per receiver
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChipStats {
    pub out_sequence_errors: u64,
    #[serde(skip)]
    last_out_sequence: Option<u8>,
}

#[derive(Debug, Default)]
pub struct Monitor {
    receivers: [ReceiverStats; RECEIVERS],
    chips: [ChipStats; 2],
}

#[derive(Debug, Serialize)]
pub struct StatusReport<'a> {
    pub receivers: &'a [ReceiverStats; RECEIVERS],
    pub chips: &'a [ChipStats; 2],
    pub unread: [u32; 2],
    pub short_transfers: u64,
}

/// True when `now` does not follow `last` on a 4 bit counter.
fn discontinuity(last: &mut Option<u8>, now: u8) -> bool {
    let broken = matches!(*last, Some(prev) if now.wrapping_sub(prev) & 0x0f != 1);
    *last = Some(now);
    broken
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, packet: &Packet) -> Verdict {
        let status = packet.status();
        let receiver = status.receiver();
        let rx = &mut self.receivers[receiver as usize];

        if !packet.has_sync() {
            rx.packets += 1;
            rx.sync_errors += 1;
            return Verdict::Corrupt(receiver);
        }
        if !status.valid() {
            rx.invalid += 1;
            return Verdict::Dropped(receiver);
        }
        rx.packets += 1;

        // receivers 0,1 sit behind one PIC, 2,3 behind the other
        let chip = &mut self.chips[(receiver as usize & 2) >> 1];
        if discontinuity(&mut chip.last_out_sequence, status.out_sequence()) {
            chip.out_sequence_errors += 1;
        }
        if discontinuity(&mut rx.last_in_sequence, status.in_sequence()) {
            rx.in_sequence_errors += 1;
        }
        if status.restart() {
            rx.restarts += 1;
        }
        if status.overflow() {
            rx.overflows += 1;
        }

        let payload = packet.payload();
        let pid = u16::from(payload[1] & 0x1f) << 8 | u16::from(payload[2]);
        rx.null_packets += u64::from(status.null_packets());
        rx.packets += u64::from(status.null_packets());
        if pid == NULL_PID {
            rx.null_packets += 1;
        }

        Verdict::Forward(receiver)
    }

    #[cfg(test)]
    pub fn receiver(&self, receiver: u8) -> &ReceiverStats {
        &self.receivers[receiver as usize]
    }

    #[cfg(test)]
    pub fn chip(&self, index: usize) -> &ChipStats {
        &self.chips[index]
    }

    pub fn report(&self, unread: [u32; 2], short_transfers: u64) -> StatusReport<'_> {
        StatusReport {
            receivers: &self.receivers,
            chips: &self.chips,
            unread,
            short_transfers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whdriver::board::transfer::{PACKET_SIZE, PAYLOAD_SIZE};
    use whdriver::sim::synth_packet;

    fn with_status(mut packet: Packet, f: impl Fn(u32) -> u32) -> Packet {
        let raw = packet.status().0;
        packet.bytes[PAYLOAD_SIZE..PACKET_SIZE].copy_from_slice(&f(raw).to_le_bytes());
        packet
    }

    #[test]
    fn test_in_order_stream_is_clean() {
        let mut monitor = Monitor::new();
        for seq in 0..40u8 {
            assert_eq!(monitor.observe(&synth_packet(1, seq)), Verdict::Forward(1));
        }
        let rx = monitor.receiver(1);
        assert_eq!(rx.packets, 40);
        assert_eq!(rx.in_sequence_errors, 0);
        assert_eq!(rx.sync_errors, 0);
        assert_eq!(monitor.chip(0).out_sequence_errors, 0);
    }

    #[test]
    fn test_gap_counts_once() {
        let mut monitor = Monitor::new();
        monitor.observe(&synth_packet(2, 0));
        monitor.observe(&synth_packet(2, 1));
        monitor.observe(&synth_packet(2, 5));
        monitor.observe(&synth_packet(2, 6));
        assert_eq!(monitor.receiver(2).in_sequence_errors, 1);
        assert_eq!(monitor.chip(1).out_sequence_errors, 1);
    }

    #[test]
    fn test_missing_sync() {
        let mut monitor = Monitor::new();
        let mut packet = synth_packet(3, 0);
        packet.bytes[0] = 0x00;
        assert_eq!(monitor.observe(&packet), Verdict::Corrupt(3));
        assert_eq!(monitor.receiver(3).sync_errors, 1);
        assert_eq!(monitor.receiver(3).packets, 1);
    }

    #[test]
    fn test_invalid_not_forwarded() {
        let mut monitor = Monitor::new();
        let packet = with_status(synth_packet(0, 0), |s| s & !(1 << 8));
        assert_eq!(monitor.observe(&packet), Verdict::Dropped(0));
        assert_eq!(monitor.receiver(0).invalid, 1);
        assert_eq!(monitor.receiver(0).packets, 0);
    }

    #[test]
    fn test_restart_and_null_accounting() {
        let mut monitor = Monitor::new();
        // restart flag, 3 stripped null packets
        let mut packet = with_status(synth_packet(0, 0), |s| s | 1 << 9 | 3 << 20);
        packet.bytes[1] = 0x1f;
        packet.bytes[2] = 0xff;
        monitor.observe(&packet);

        let rx = monitor.receiver(0);
        assert_eq!(rx.restarts, 1);
        assert_eq!(rx.null_packets, 4);
        assert_eq!(rx.packets, 4);
    }

    #[test]
    fn test_report_serializes() {
        let mut monitor = Monitor::new();
        monitor.observe(&synth_packet(0, 0));
        let json = serde_json::to_value(monitor.report([1, 2], 0)).unwrap();
        assert_eq!(json["receivers"][0]["packets"], 1);
        assert_eq!(json["unread"][1], 2);
        assert!(json["receivers"][0].get("last_in_sequence").is_none());
    }
}
