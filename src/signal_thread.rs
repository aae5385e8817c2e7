//! Signal-driven worker threads.
//!
//! Each pipeline role runs one [`SignalThread`]. The worker sleeps until some
//! caller sets bits in its 32-bit signal word, then takes the whole pending word
//! at once and hands it to the role's [`SignalHandler`]. Setting a bit that is
//! already pending is a no-op, so bursts of the same event coalesce.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::traits::{CameraError, Result};

/// Stop the loop without dispatching anything else.
pub const SIGNAL_TERMINATE: u32 = 1 << 31;
/// Skip this iteration without dispatching.
pub const SIGNAL_PAUSE: u32 = 1 << 30;
/// Run the handler's teardown, then stop the loop.
pub const SIGNAL_RELEASE: u32 = 1 << 29;

const RESERVED: u32 = SIGNAL_TERMINATE | SIGNAL_PAUSE | SIGNAL_RELEASE;

/// Per-role behaviour plugged into a [`SignalThread`].
pub trait SignalHandler: Send + 'static {
    /// Handle one batch of role-specific signal bits. Never called with zero bits.
    fn on_signal(&mut self, signals: u32);

    /// Stage-specific teardown, run on the worker thread before it exits.
    fn on_release(&mut self) {}
}

#[derive(Default)]
struct SignalState {
    pending: u32,
    terminated: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<SignalState>,
    wake: Condvar,
}

/// Cloneable handle used to signal a [`SignalThread`] from any thread.
#[derive(Clone)]
pub struct Signaller {
    name: Arc<str>,
    shared: Arc<Shared>,
}

impl Signaller {
    /// Signal word for a worker that has not been started yet. Bits set
    /// before [`SignalThread::start`] stay pending until the worker runs.
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            shared: Arc::new(Shared::default()),
        }
    }

    /// OR `bits` into the pending word and wake the worker.
    pub fn set_signal(&self, bits: u32) {
        let mut state = self.shared.state.lock();
        if state.terminated {
            return;
        }
        state.pending |= bits;
        self.shared.wake.notify_one();
    }

    /// Name of the target thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker loop has exited.
    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated
    }
}

/// A named worker thread driven by signal bits.
pub struct SignalThread {
    signaller: Signaller,
    handle: Option<JoinHandle<()>>,
}

impl SignalThread {
    /// Spawn a worker. `make` builds the handler and receives the thread's own
    /// signaller so the handler can re-signal itself.
    pub fn spawn<H, F>(name: &str, make: F) -> Result<Self>
    where
        H: SignalHandler,
        F: FnOnce(Signaller) -> H,
    {
        let signaller = Signaller::new(name);
        let handler = make(signaller.clone());
        Self::start(signaller, handler)
    }

    /// Start a worker on a signaller created up front with [`Signaller::new`].
    pub fn start<H: SignalHandler>(signaller: Signaller, mut handler: H) -> Result<Self> {
        let worker = signaller.clone();
        let handle = thread::Builder::new()
            .name(signaller.name().to_owned())
            .spawn(move || run_loop(&worker, &mut handler))
            .map_err(|source| CameraError::ThreadSpawn {
                name: signaller.name().to_owned(),
                source,
            })?;

        Ok(Self {
            signaller,
            handle: Some(handle),
        })
    }

    /// Handle for signalling this thread.
    pub fn signaller(&self) -> Signaller {
        self.signaller.clone()
    }

    /// OR `bits` into the pending word and wake the worker.
    pub fn set_signal(&self, bits: u32) {
        self.signaller.set_signal(bits);
    }

    /// Whether the worker loop has exited.
    pub fn is_terminated(&self) -> bool {
        self.signaller.is_terminated()
    }

    /// Ask the worker to tear down and wait for it to exit.
    pub fn release(&mut self) {
        self.signaller.set_signal(SIGNAL_RELEASE);
        self.join();
    }

    /// Ask the worker to stop without teardown and wait for it to exit.
    pub fn terminate(&mut self) {
        self.signaller.set_signal(SIGNAL_TERMINATE);
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(name = self.signaller.name(), "signal thread panicked");
            }
        }
    }
}

impl Drop for SignalThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.release();
        }
    }
}

fn run_loop(signaller: &Signaller, handler: &mut dyn SignalHandler) {
    let name = signaller.name();
    info!(name, "signal thread started");
    loop {
        let processing = {
            let mut state = signaller.shared.state.lock();
            while state.pending == 0 {
                signaller.shared.wake.wait(&mut state);
            }
            std::mem::take(&mut state.pending)
        };

        if processing & SIGNAL_TERMINATE != 0 {
            debug!(name, "terminate signal");
            break;
        }
        if processing & SIGNAL_RELEASE != 0 {
            debug!(name, "release signal");
            handler.on_release();
            break;
        }
        if processing & SIGNAL_PAUSE != 0 {
            continue;
        }

        let bits = processing & !RESERVED;
        if bits != 0 {
            handler.on_signal(bits);
        }
    }
    signaller.shared.state.lock().terminated = true;
    info!(name, "signal thread exiting");
}
