//! See [`CarrierThread`].

use {
    crate::{carrier::Carrier, handle::CarrierHandle},
    log::debug,
    std::{
        panic,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread::{self, JoinHandle},
    },
};

/// Background thread which keeps updating a [`Carrier`].
///
/// The thread updates the carrier, then sleeps for
/// [`CarrierConfig::thread_update_time`](crate::CarrierConfig::thread_update_time).
/// With [`CarrierConfig::thread_instant_response`](crate::CarrierConfig::thread_instant_response)
/// set, every handle command cuts the sleep short.
///
/// Interact with the carrier through [`CarrierThread::handle`], and get the
/// carrier back with [`CarrierThread::stop`].
pub struct CarrierThread {
    handle: CarrierHandle,
    running: Arc<AtomicBool>,
    thread: JoinHandle<Carrier>,
}

impl CarrierThread {
    /// Moves `carrier` onto a new thread and starts updating it.
    ///
    /// # Panics
    ///
    /// Panics if the OS fails to spawn a thread.
    #[must_use]
    pub fn spawn(mut carrier: Carrier) -> Self {
        let handle = carrier.handle();
        let running = Arc::new(AtomicBool::new(true));
        let thread = thread::Builder::new()
            .name(format!("carrier {}", carrier.local_addr()))
            .spawn({
                let running = running.clone();
                move || {
                    let update_time = carrier.config().thread_update_time;
                    while running.load(Ordering::Acquire) {
                        carrier.update();
                        carrier.wait(update_time);
                    }
                    debug!("carrier thread on {} stopped", carrier.local_addr());
                    carrier
                }
            })
            .expect("failed to spawn carrier thread");
        Self {
            handle,
            running,
            thread,
        }
    }

    /// Gets a handle to the carrier running on this thread.
    #[must_use]
    pub const fn handle(&self) -> &CarrierHandle {
        &self.handle
    }

    /// Stops the thread after its current update and returns the carrier.
    ///
    /// If the thread panicked, the panic resumes on this thread.
    #[must_use]
    pub fn stop(self) -> Carrier {
        self.running.store(false, Ordering::Release);
        self.handle.wake();
        match self.thread.join() {
            Ok(carrier) => carrier,
            Err(panic) => panic::resume_unwind(panic),
        }
    }
}
