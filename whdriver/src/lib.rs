/// WinterHill receive driver
///
/// Captures transport stream packets from the two receiver PICs over SPI and
/// hands them to a single blocking reader, with a simulated board for
/// running the whole path without hardware.

pub mod board;
pub mod channel;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod gate;
pub mod linux;
pub mod packet;
pub mod platform;
pub mod regs;
pub mod ring;
pub mod sim;
pub mod watchdog;

// Re-export main types for convenience
pub use channel::ChannelId;
pub use config::DriverConfig;
pub use device::{Device, DeviceStats};
pub use error::{DriverError, Result};
pub use linux::LinuxPlatform;
pub use packet::{Packet, StatusWord};
pub use platform::Platform;
pub use sim::SimBoard;
