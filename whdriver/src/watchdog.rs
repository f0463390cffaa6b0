/// Read watchdog
/// Ticks on a fixed period and aborts a parked read that has waited too long

use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Periodic tick thread
pub struct Watchdog {
    ticks: Arc<AtomicU32>,
    should_stop: Arc<AtomicBool>,
    tick_thread: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    /// Start ticking every `period`. Once `limit` ticks have passed since the
    /// last `reset`, every tick calls `on_expire`, which returns true if it
    /// actually aborted a reader.
    pub fn start<F>(period: Duration, limit: u32, on_expire: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let ticks = Arc::new(AtomicU32::new(0));
        let should_stop = Arc::new(AtomicBool::new(false));

        let thread_ticks = Arc::clone(&ticks);
        let thread_stop = Arc::clone(&should_stop);
        let tick_thread = thread::spawn(move || {
            Self::loop_fn(period, limit, thread_ticks, thread_stop, on_expire);
        });

        info!("Watchdog started, {:?} x {} ticks", period, limit);
        Watchdog {
            ticks,
            should_stop,
            tick_thread: Some(tick_thread),
        }
    }

    /// A read is starting; its window begins now.
    pub fn reset(&self) {
        self.ticks.store(0, Ordering::SeqCst);
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Stop the tick thread and wait for it to exit
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.tick_thread.take() {
            let _ = thread.join();
            debug!("Watchdog stopped");
        }
    }

    fn loop_fn<F>(
        period: Duration,
        limit: u32,
        ticks: Arc<AtomicU32>,
        should_stop: Arc<AtomicBool>,
        on_expire: F,
    ) where
        F: Fn() -> bool,
    {
        loop {
            thread::sleep(period);
            if should_stop.load(Ordering::SeqCst) {
                break;
            }

            let now = ticks.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            if now >= limit && on_expire() {
                debug!("Watchdog aborted a read after {} ticks", now);
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
