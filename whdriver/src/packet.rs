/// Packet slot - one 192 byte unit as clocked out of a PIC
///
/// 188 bytes of transport stream followed by the PIC's 32-bit status word.
/// The driver stores and returns these bytes verbatim; the accessors here
/// only decode them for consumers.

use crate::board::transfer::{PACKET_SIZE, PAYLOAD_SIZE, SENTINEL};

/// MPEG-TS sync byte expected at the start of every payload
pub const SYNC_BYTE: u8 = 0x47;

#[repr(C)]
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub bytes: [u8; PACKET_SIZE],
}

impl Packet {
    /// A slot as the ready-edge handler leaves it before any byte arrives
    pub fn sentinel() -> Self {
        Packet {
            bytes: [SENTINEL; PACKET_SIZE],
        }
    }

    pub fn from_bytes(bytes: [u8; PACKET_SIZE]) -> Self {
        Packet { bytes }
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[..PAYLOAD_SIZE]
    }

    pub fn status(&self) -> StatusWord {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[PAYLOAD_SIZE..]);
        StatusWord(u32::from_le_bytes(raw))
    }

    pub fn has_sync(&self) -> bool {
        self.bytes[0] == SYNC_BYTE
    }

    pub fn clear(&mut self) {
        self.bytes.fill(SENTINEL);
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::sentinel()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("head", &&self.bytes[..4])
            .field("status", &self.status())
            .finish()
    }
}

/// Status word appended by the PIC, packed LSB first
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StatusWord(pub u32);

impl StatusWord {
    fn bits(self, shift: u32, width: u32) -> u32 {
        (self.0 >> shift) & ((1 << width) - 1)
    }

    pub fn crc8(self) -> u8 {
        self.bits(0, 8) as u8
    }

    pub fn valid(self) -> bool {
        self.bits(8, 1) != 0
    }

    pub fn restart(self) -> bool {
        self.bits(9, 1) != 0
    }

    pub fn overflow(self) -> bool {
        self.bits(10, 1) != 0
    }

    pub fn filtering(self) -> bool {
        self.bits(11, 1) != 0
    }

    /// Receiver 0..3 on the board; bit 1 selects the PIC
    pub fn receiver(self) -> u8 {
        self.bits(12, 2) as u8
    }

    pub fn highwater(self) -> bool {
        self.bits(15, 1) != 0
    }

    /// CRC computed by the NIM rather than the PIC
    pub fn crc_from_nim(self) -> bool {
        self.bits(16, 1) != 0
    }

    pub fn crc_ok(self) -> bool {
        self.bits(17, 1) != 0
    }

    pub fn null_packets(self) -> u8 {
        self.bits(20, 4) as u8
    }

    pub fn out_sequence(self) -> u8 {
        self.bits(24, 4) as u8
    }

    pub fn in_sequence(self) -> u8 {
        self.bits(28, 4) as u8
    }
}

impl std::fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWord")
            .field("raw", &format_args!("{:#010x}", self.0))
            .field("valid", &self.valid())
            .field("receiver", &self.receiver())
            .field("in_seq", &self.in_sequence())
            .field("out_seq", &self.out_sequence())
            .finish()
    }
}
