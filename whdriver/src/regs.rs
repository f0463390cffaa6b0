/// Typed access to the GPIO, SPI and shared interrupt status registers.
///
/// All reads and writes funnel through [`read_word`] and [`write_word`],
/// which put a full fence on both sides of the access. A write is therefore
/// visible to the peripheral before any later read, and every poll of a
/// status bit observes the hardware afresh.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use rppal::gpio::Level;
use tock_registers::fields::FieldValue;
use tock_registers::{register_bitfields, LocalRegisterCopy};

register_bitfields![u32,
    /// SPI master control and status
    pub CS [
        /// Clock phase
        CPHA OFFSET(2) NUMBITS(1) [],
        /// Clock polarity, idle high when set
        CPOL OFFSET(3) NUMBITS(1) [],
        /// FIFO clear, self-clearing action bits
        CLEAR_FIFO OFFSET(4) NUMBITS(2) [
            None = 0,
            Tx = 1,
            Rx = 2,
            Both = 3
        ],
        /// Transfer active
        TA OFFSET(7) NUMBITS(1) [],
        /// Interrupt on DONE
        INTD OFFSET(9) NUMBITS(1) [],
        /// Interrupt on RXR
        INTR OFFSET(10) NUMBITS(1) [],
        /// Transfer done, TX FIFO empty while TA is set
        DONE OFFSET(16) NUMBITS(1) [],
        /// RX FIFO holds at least one byte
        RXD OFFSET(17) NUMBITS(1) [],
        /// TX FIFO can accept at least one byte
        TXD OFFSET(18) NUMBITS(1) [],
        /// RX FIFO needs reading (3/4 full)
        RXR OFFSET(19) NUMBITS(1) []
    ],

    /// Shared interrupt status of the SPI/I2C/UART peripheral group
    pub PACTL_CS [
        SPI0 OFFSET(0) NUMBITS(1) [],
        SPI3 OFFSET(3) NUMBITS(1) [],
        SPI4 OFFSET(4) NUMBITS(1) [],
        SPI5 OFFSET(5) NUMBITS(1) [],
        SPI6 OFFSET(6) NUMBITS(1) []
    ]
];

pub type Control = LocalRegisterCopy<u32, CS::Register>;
pub type PeripheralStatus = LocalRegisterCopy<u32, PACTL_CS::Register>;

/// Word offsets inside the GPIO block
pub mod gpio_offsets {
    pub const GPFSEL0: usize = 0x00 / 4;
    pub const GPSET0: usize = 0x1c / 4;
    pub const GPCLR0: usize = 0x28 / 4;
    pub const GPLEV0: usize = 0x34 / 4;
}

/// Word offsets inside an SPI block
pub mod spi_offsets {
    pub const CS: usize = 0x00 / 4;
    pub const FIFO: usize = 0x04 / 4;
    pub const CLK: usize = 0x08 / 4;
    pub const DLEN: usize = 0x0c / 4;
    pub const LTOH: usize = 0x10 / 4;
    pub const DC: usize = 0x14 / 4;
}

/// A mapped block of 32-bit registers, addressed by word index.
///
/// Implementations perform exactly one volatile access per call; ordering is
/// the caller's job and is handled by the typed blocks below.
pub trait RegisterWindow: Send + Sync {
    fn read_word(&self, index: usize) -> u32;
    fn write_word(&self, index: usize, value: u32);
}

#[inline]
fn read_word(window: &dyn RegisterWindow, index: usize) -> u32 {
    fence(Ordering::SeqCst);
    let value = window.read_word(index);
    fence(Ordering::SeqCst);
    value
}

#[inline]
fn write_word(window: &dyn RegisterWindow, index: usize, value: u32) {
    fence(Ordering::SeqCst);
    window.write_word(index, value);
    fence(Ordering::SeqCst);
}

/// GPIO function select codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFunction {
    Input,
    Output,
    Alt0,
    Alt1,
    Alt2,
    Alt3,
    Alt4,
    Alt5,
}

impl PinFunction {
    pub fn code(self) -> u32 {
        match self {
            PinFunction::Input => 0,
            PinFunction::Output => 1,
            PinFunction::Alt0 => 4,
            PinFunction::Alt1 => 5,
            PinFunction::Alt2 => 6,
            PinFunction::Alt3 => 7,
            PinFunction::Alt4 => 3,
            PinFunction::Alt5 => 2,
        }
    }
}

#[derive(Clone)]
pub struct GpioBlock {
    window: Arc<dyn RegisterWindow>,
}

impl GpioBlock {
    pub fn new(window: Arc<dyn RegisterWindow>) -> Self {
        GpioBlock { window }
    }

    /// Select the function of a pin. The field passes through input on the
    /// way so an output never glitches through an alternate function.
    pub fn configure_pin(&self, pin: u8, function: PinFunction) {
        let index = gpio_offsets::GPFSEL0 + (pin as usize / 10);
        let pos = (pin as u32 % 10) * 3;

        let mut fsel = read_word(&*self.window, index);
        fsel &= !(7 << pos);
        write_word(&*self.window, index, fsel);
        fsel |= function.code() << pos;
        write_word(&*self.window, index, fsel);
    }

    pub fn set_pin(&self, pin: u8, level: Level) {
        let mask = 1u32 << pin;
        match level {
            Level::High => write_word(&*self.window, gpio_offsets::GPSET0, mask),
            Level::Low => write_word(&*self.window, gpio_offsets::GPCLR0, mask),
        }
    }

    /// One snapshot of the input levels of GPIO 0..31.
    pub fn read_level_register(&self) -> u32 {
        read_word(&*self.window, gpio_offsets::GPLEV0)
    }
}

#[derive(Clone)]
pub struct SpiBlock {
    window: Arc<dyn RegisterWindow>,
}

impl SpiBlock {
    pub fn new(window: Arc<dyn RegisterWindow>) -> Self {
        SpiBlock { window }
    }

    pub fn control(&self) -> Control {
        Control::new(read_word(&*self.window, spi_offsets::CS))
    }

    /// Overwrite the control register with exactly `value`.
    pub fn write_control(&self, value: FieldValue<u32, CS::Register>) {
        write_word(&*self.window, spi_offsets::CS, value.value);
    }

    /// Read-modify-write of the control register.
    pub fn modify_control(&self, value: FieldValue<u32, CS::Register>) {
        let mut cs = self.control();
        cs.modify(value);
        write_word(&*self.window, spi_offsets::CS, cs.get());
    }

    pub fn reset(&self) {
        write_word(&*self.window, spi_offsets::CS, 0);
    }

    pub fn read_fifo(&self) -> u8 {
        read_word(&*self.window, spi_offsets::FIFO) as u8
    }

    pub fn write_fifo(&self, byte: u8) {
        write_word(&*self.window, spi_offsets::FIFO, byte as u32);
    }

    pub fn set_clock_divider(&self, divider: u32) {
        write_word(&*self.window, spi_offsets::CLK, divider);
    }

    /// DMA/interrupt threshold register, logged at bring-up.
    pub fn data_control(&self) -> u32 {
        read_word(&*self.window, spi_offsets::DC)
    }
}

#[derive(Clone)]
pub struct StatusBlock {
    window: Arc<dyn RegisterWindow>,
}

impl StatusBlock {
    pub fn new(window: Arc<dyn RegisterWindow>) -> Self {
        StatusBlock { window }
    }

    pub fn read(&self) -> PeripheralStatus {
        PeripheralStatus::new(read_word(&*self.window, 0))
    }
}
