//! Registry of live child processes, used for forced shutdown.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Delivers a signal to a process id.
pub trait SignalSender: Send + Sync {
    fn send(&self, pid: u32, signal: Signal) -> nix::Result<()>;
}

/// Signals the process group led by `pid`, falling back to the bare pid.
///
/// Supervised children are spawned as group leaders, so the group signal
/// also reaches the tools an agent started.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignals;

impl SignalSender for OsSignals {
    fn send(&self, pid: u32, sig: Signal) -> nix::Result<()> {
        let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
        if raw <= 1 {
            return Err(Errno::EINVAL);
        }
        match signal::killpg(Pid::from_raw(raw), sig) {
            Err(Errno::ESRCH) => signal::kill(Pid::from_raw(raw), sig),
            other => other,
        }
    }
}

/// Thread-safe set of live child pids.
pub struct ProcessRegistry {
    pids: Mutex<BTreeSet<u32>>,
    sender: Arc<dyn SignalSender>,
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("pids", &self.pids())
            .finish_non_exhaustive()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::with_sender(Arc::new(OsSignals))
    }

    pub fn with_sender(sender: Arc<dyn SignalSender>) -> Self {
        Self {
            pids: Mutex::new(BTreeSet::new()),
            sender,
        }
    }

    pub fn register(&self, pid: u32) {
        debug!(pid, "registering child process");
        self.lock().insert(pid);
    }

    pub fn unregister(&self, pid: u32) {
        debug!(pid, "unregistering child process");
        self.lock().remove(&pid);
    }

    /// Register `pid` for the lifetime of the returned guard.
    pub fn track(&self, pid: u32) -> Registration<'_> {
        self.register(pid);
        Registration {
            registry: self,
            pid,
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.lock().iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Send `sig` to every tracked pid, wait, then SIGKILL whatever is still
    /// registered. Delivery errors are logged and swallowed.
    pub fn kill_all(&self, sig: Signal, wait: Duration) {
        let targets = self.pids();
        if targets.is_empty() {
            return;
        }
        warn!(count = targets.len(), signal = ?sig, "signalling child processes");
        for pid in &targets {
            self.deliver(*pid, sig);
        }
        if !wait.is_zero() {
            thread::sleep(wait);
        }
        let survivors = self.pids();
        for pid in survivors {
            self.deliver(pid, Signal::SIGKILL);
        }
    }

    fn deliver(&self, pid: u32, sig: Signal) {
        match self.sender.send(pid, sig) {
            Ok(()) => debug!(pid, signal = ?sig, "signal delivered"),
            Err(Errno::ESRCH) => debug!(pid, "process already exited"),
            Err(err) => warn!(pid, signal = ?sig, err = %err, "failed to signal process"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unregisters its pid when dropped, however the supervising call exits.
#[derive(Debug)]
pub struct Registration<'a> {
    registry: &'a ProcessRegistry,
    pid: u32,
}

impl Registration<'_> {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.pid);
    }
}
