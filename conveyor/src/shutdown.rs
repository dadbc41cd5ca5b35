//! Two-tier interrupt handling.
//!
//! The first interrupt asks pipelines to stop at the next step boundary. The
//! second one signals every supervised child and kills what survives the
//! grace period.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tracing::{info, warn};

use crate::io::registry::ProcessRegistry;

/// Shared, read-mostly shutdown flag.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    interrupts: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Graceful,
    Forceful,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst) > 0
    }

    pub fn tier(&self) -> Option<Tier> {
        match self.interrupts.load(Ordering::SeqCst) {
            0 => None,
            1 => Some(Tier::Graceful),
            _ => Some(Tier::Forceful),
        }
    }

    /// Record one interrupt and return the tier it escalated to.
    pub fn request(&self) -> Tier {
        if self.interrupts.fetch_add(1, Ordering::SeqCst) == 0 {
            Tier::Graceful
        } else {
            Tier::Forceful
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    signal: Arc<ShutdownSignal>,
    registry: Arc<ProcessRegistry>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(signal: Arc<ShutdownSignal>, registry: Arc<ProcessRegistry>, grace: Duration) -> Self {
        Self {
            signal,
            registry,
            grace,
        }
    }

    pub fn signal(&self) -> &Arc<ShutdownSignal> {
        &self.signal
    }

    /// Record one interrupt and act on the tier it reached.
    pub fn handle_interrupt(&self) -> Tier {
        let tier = self.signal.request();
        self.respond(tier);
        tier
    }

    fn respond(&self, tier: Tier) {
        match tier {
            Tier::Graceful => {
                info!("interrupt received, finishing current steps");
                eprintln!("\nShutting down after the current step. Press Ctrl-C again to force.");
            }
            Tier::Forceful => {
                warn!(children = self.registry.pids().len(), "second interrupt, terminating child processes");
                eprintln!("\nForcing shutdown.");
                self.registry.kill_all(Signal::SIGTERM, self.grace);
            }
        }
    }

    /// Act on interrupt events from `events` until every sender is dropped.
    pub fn listen(self, events: Receiver<Tier>) -> JoinHandle<()> {
        thread::spawn(move || {
            for tier in events {
                self.respond(tier);
            }
        })
    }

    /// Route SIGINT and SIGTERM into an event channel drained by [`Self::listen`].
    ///
    /// The handler itself only bumps the shared counter and sends the tier.
    pub fn install(self) -> Result<JoinHandle<()>> {
        let (events, receiver) = mpsc::channel();
        let signal = Arc::clone(&self.signal);
        ctrlc::set_handler(move || {
            if events.send(signal.request()).is_err() {
                warn!("interrupt listener is gone");
            }
        })
        .context("failed to set interrupt handler")?;
        Ok(self.listen(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn tiers_escalate() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.tier(), None);
        assert!(!signal.is_shutting_down());
        assert_eq!(signal.request(), Tier::Graceful);
        assert!(signal.is_shutting_down());
        assert_eq!(signal.request(), Tier::Forceful);
        assert_eq!(signal.tier(), Some(Tier::Forceful));
    }

    #[test]
    fn first_interrupt_leaves_children_running() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let _tracked = registry.track(child.id());
        let coordinator = ShutdownCoordinator::new(Arc::new(ShutdownSignal::new()), Arc::clone(&registry), Duration::ZERO);

        assert_eq!(coordinator.handle_interrupt(), Tier::Graceful);
        assert!(child.try_wait().expect("try_wait").is_none());

        assert_eq!(coordinator.handle_interrupt(), Tier::Forceful);
        let status = child.wait().expect("wait");
        assert!(!status.success());
        assert!(coordinator.signal().is_shutting_down());
    }

    #[test]
    fn listener_kills_children_on_forceful_event() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let _tracked = registry.track(child.id());
        let signal = Arc::new(ShutdownSignal::new());
        let coordinator = ShutdownCoordinator::new(Arc::clone(&signal), Arc::clone(&registry), Duration::ZERO);
        let (events, receiver) = mpsc::channel();
        let listener = coordinator.listen(receiver);

        events.send(signal.request()).expect("send graceful");
        events.send(signal.request()).expect("send forceful");
        drop(events);
        listener.join().expect("listener thread");

        assert!(!child.wait().expect("wait").success());
        assert_eq!(signal.tier(), Some(Tier::Forceful));
    }
}
