/// Linux host: registers through /dev/mem, ready edges through the GPIO
/// character device (rppal), the shared completion interrupt through UIO.
///
/// The UIO device must be bound to the SPI completion interrupt, for example
/// with `uio_pdrv_genirq` and a device tree overlay. Reading it blocks until
/// the interrupt fires; writing 1 re-enables it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rppal::gpio::{Gpio, InputPin, Trigger as EdgeTrigger};

use crate::error::{DriverError, Result};
use crate::platform::{IrqHandle, IrqHandler, IrqLine, Platform, Trigger};
use crate::regs::RegisterWindow;

const PAGE_SIZE: u64 = 4096;
const UIO_POLL_MS: i32 = 50;

/// One mmap of /dev/mem, unmapped on drop
struct MappedRegion {
    page: *mut libc::c_void,
    len: usize,
    /// Word index of the requested base inside the page
    first_word: usize,
}

// The region is plain device memory; every access is a single volatile word.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn open(base: u64, len: usize) -> Result<Self> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")
            .map_err(|e| DriverError::Map {
                base,
                reason: format!("/dev/mem: {}", e),
            })?;

        let page_base = base & !(PAGE_SIZE - 1);
        let delta = (base - page_base) as usize;
        let map_len = delta + len;

        let page = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                mem.as_raw_fd(),
                page_base as libc::off_t,
            )
        };
        if page == libc::MAP_FAILED {
            return Err(DriverError::Map {
                base,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        debug!("Mapped {:#010x} (+{:#x}), {} bytes", page_base, delta, map_len);

        Ok(MappedRegion {
            page,
            len: map_len,
            first_word: delta / 4,
        })
    }

    fn word(&self, index: usize) -> *mut u32 {
        debug_assert!((self.first_word + index) * 4 < self.len);
        unsafe { (self.page as *mut u32).add(self.first_word + index) }
    }
}

impl RegisterWindow for MappedRegion {
    fn read_word(&self, index: usize) -> u32 {
        unsafe { ptr::read_volatile(self.word(index)) }
    }

    fn write_word(&self, index: usize, value: u32) {
        unsafe { ptr::write_volatile(self.word(index), value) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.page, self.len);
        }
    }
}

/// Thread blocking on a UIO device and calling the handler per interrupt
struct UioListener {
    should_stop: Arc<AtomicBool>,
    listen_thread: Option<thread::JoinHandle<()>>,
}

impl UioListener {
    fn start(path: &Path, line: IrqLine, handler: IrqHandler) -> Result<Self> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DriverError::Irq {
                line: line.to_string(),
                reason: format!("{}: {}", path.display(), e),
            })?;

        let should_stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&should_stop);
        let listen_thread = thread::Builder::new()
            .name(format!("uio-{}", line))
            .spawn(move || Self::loop_fn(device, thread_stop, handler))?;

        Ok(UioListener {
            should_stop,
            listen_thread: Some(listen_thread),
        })
    }

    fn loop_fn(mut device: File, should_stop: Arc<AtomicBool>, handler: IrqHandler) {
        let enable = 1u32.to_ne_bytes();
        if let Err(e) = device.write_all(&enable) {
            error!("Failed to enable UIO interrupt: {}", e);
            return;
        }

        let mut count = [0u8; 4];
        while !should_stop.load(Ordering::SeqCst) {
            let mut fds = libc::pollfd {
                fd: device.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut fds, 1, UIO_POLL_MS) };
            if ready < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("UIO poll failed: {}", err);
                break;
            }
            if ready == 0 {
                continue;
            }

            if let Err(e) = device.read_exact(&mut count) {
                error!("UIO read failed: {}", e);
                break;
            }
            handler();
            if let Err(e) = device.write_all(&enable) {
                error!("Failed to re-enable UIO interrupt: {}", e);
                break;
            }
        }
    }

    fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.listen_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UioListener {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Attachment {
    Edge(InputPin),
    Uio(UioListener),
}

pub struct LinuxPlatform {
    gpio: Gpio,
    uio_path: PathBuf,
    attachments: Mutex<HashMap<u64, Attachment>>,
    next_id: AtomicU64,
}

impl LinuxPlatform {
    /// `uio_path` is the UIO device bound to the shared completion interrupt.
    pub fn new(uio_path: impl Into<PathBuf>) -> Result<Self> {
        let gpio = Gpio::new()?;
        let uio_path = uio_path.into();
        info!("Linux platform, completion interrupt via {}", uio_path.display());
        Ok(LinuxPlatform {
            gpio,
            uio_path,
            attachments: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    fn attach_edge(&self, pin: u8, handler: IrqHandler) -> Result<InputPin> {
        let mut input = self.gpio.get(pin)?.into_input();
        // Function select is owned by the register layer
        input.set_reset_on_drop(false);
        input.set_async_interrupt(EdgeTrigger::FallingEdge, None, move |_| {
            handler();
        })?;
        Ok(input)
    }
}

impl Platform for LinuxPlatform {
    fn map(&self, base: u64, len: usize) -> Result<Arc<dyn RegisterWindow>> {
        Ok(Arc::new(MappedRegion::open(base, len)?))
    }

    fn request_irq(
        &self,
        line: IrqLine,
        trigger: Trigger,
        name: &str,
        handler: IrqHandler,
    ) -> Result<IrqHandle> {
        let attachment = match (line, trigger) {
            (IrqLine::Gpio(pin), Trigger::FallingEdge) => {
                Attachment::Edge(self.attach_edge(pin, handler).map_err(|e| {
                    DriverError::Irq {
                        line: line.to_string(),
                        reason: e.to_string(),
                    }
                })?)
            }
            (IrqLine::Number(n), Trigger::LevelHigh) => {
                debug!("IRQ {} served by {}", n, self.uio_path.display());
                Attachment::Uio(UioListener::start(&self.uio_path, line, handler)?)
            }
            _ => {
                return Err(DriverError::Irq {
                    line: line.to_string(),
                    reason: format!("{:?} is not supported on this line", trigger),
                })
            }
        };

        let handle = IrqHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            line,
        };
        self.attachments.lock().insert(handle.id, attachment);
        info!("{} attached to {}", name, line);
        Ok(handle)
    }

    fn free_irq(&self, handle: IrqHandle) {
        match self.attachments.lock().remove(&handle.id) {
            Some(Attachment::Edge(mut pin)) => {
                if let Err(e) = pin.clear_async_interrupt() {
                    warn!("Failed to clear interrupt on {}: {}", handle.line, e);
                }
            }
            Some(Attachment::Uio(listener)) => drop(listener),
            None => warn!("{} was not attached", handle.line),
        }
    }

    fn delay(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
