/// Board description for the dual receiver add-on
///
/// Pin assignments, physical register addresses and transfer constants for
/// the two PIC packet sources. Everything here is fixed by the board layout
/// and the BCM2711 memory map.

/// Channel pin configuration (BCM GPIO numbers)
pub mod pins {
    /// PIC_A, wired to SPI0
    pub mod a {
        /// Chip select output (active low), header pin 24
        pub const SS: u8 = 8;

        /// Serial clock, header pin 23
        pub const CLK: u8 = 11;

        /// Data in from the PIC, header pin 21
        pub const MISO: u8 = 9;

        /// Packet ready input (active low), header pin 19
        pub const READY: u8 = 10;
    }

    /// PIC_B, wired to SPI6
    pub mod b {
        pub const SS: u8 = 18;
        pub const CLK: u8 = 21;
        pub const MISO: u8 = 19;
        pub const READY: u8 = 20;
    }

    /// Board reset output (active low)
    pub const BOARD_RESET: u8 = 7;
}

/// Physical addresses of the register blocks (BCM2711)
pub mod memory {
    /// GPIO controller
    pub const GPIO_BASE: u64 = 0xfe20_0000;

    /// SPI0, serving PIC_A
    pub const SPI_A_BASE: u64 = 0xfe20_4000;

    /// SPI6, serving PIC_B
    pub const SPI_B_BASE: u64 = 0xfe20_4c00;

    /// Shared interrupt status for the SPI/I2C/UART peripheral group
    pub const PACTL_BASE: u64 = 0xfe20_4e00;

    /// Every block is mapped as one page
    pub const BLOCK_SIZE: usize = 4096;

    /// All four blocks in bring-up order
    pub const BLOCKS: [u64; 4] = [GPIO_BASE, SPI_A_BASE, SPI_B_BASE, PACTL_BASE];
}

/// Transfer and storage constants
pub mod transfer {
    /// Transport stream payload carried by one packet
    pub const PAYLOAD_SIZE: usize = 188;

    /// Trailing status word appended by the PIC
    pub const STATUS_SIZE: usize = 4;

    /// Bytes clocked per ready edge, and the only valid read length
    pub const PACKET_SIZE: usize = PAYLOAD_SIZE + STATUS_SIZE;

    /// Slots per channel ring
    pub const RING_CAPACITY: usize = 4096;

    /// Fill pattern for a claimed slot, so a short transfer is visible
    pub const SENTINEL: u8 = 0xcd;

    /// Transmitted while clocking data in; the PICs ignore MOSI
    pub const DUMMY_TX: u8 = 0xff;

    /// Core clock divider, 16 MHz at the top RPi4 core clock
    pub const CLOCK_DIVIDER: u32 = 32;

    /// Depth of each SPI controller FIFO
    pub const FIFO_DEPTH: usize = 64;
}

/// Interrupt naming, as it appears in /proc/interrupts
pub mod interrupts {
    pub const READY_A_NAME: &str = "whdriver_picA_handler";
    pub const READY_B_NAME: &str = "whdriver_picB_handler";
    pub const COMPLETION_NAME: &str = "whdriver_spi_handler";
}
