use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use crate::buffer::atomic_buffer::AtomicBuffer;
use crate::common::config::ANALYZER_IDLE_WAIT;

/// Dedicated thread draining the record chain into the index.
///
/// Exactly one analyzer runs per chain; it parks on the chain's arrival signal when there
/// is nothing to analyze.
pub struct Analyzer {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Analyzer {
    pub fn spawn(buffer: Arc<AtomicBuffer>) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("perfstore-analyzer".into())
            .spawn(move || {
                debug!("Analyzer started");
                let mut processed: u64 = 0;
                while !flag.load(Ordering::Acquire) {
                    if buffer.analyze_next() {
                        processed += 1;
                    } else {
                        buffer.wait_for_arrivals(ANALYZER_IDLE_WAIT);
                    }
                }
                debug!("Analyzer stopped after {} elements", processed);
            })?;

        info!("Analyzer thread spawned");
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the thread to stop and joins it.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Analyzer thread panicked");
            }
        }
    }
}

impl Drop for Analyzer {
    fn drop(&mut self) {
        self.stop();
    }
}
