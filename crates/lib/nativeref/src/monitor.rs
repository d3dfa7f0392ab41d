//! Monitors held by one native call.
//!
//! Monitors are entered and exited in strict LIFO order. Whatever is still
//! held when the call ends is exited in reverse order of entry.

use crate::host::{Handle, Host, HostFailure};

/// Proof of a successful [`MonitorStack::enter`]; hand it back to exit.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct MonitorToken {
    depth: usize,
    obj: Handle,
}

#[derive(Debug, Default)]
pub struct MonitorStack {
    held: Vec<Handle>,
}

impl MonitorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.held.len()
    }

    pub fn enter<H: Host>(&mut self, host: &mut H, obj: Handle) -> Result<MonitorToken, HostFailure> {
        host.monitor_enter(obj)?;
        self.held.push(obj);
        log::trace!("monitor enter {obj:?}, depth {}", self.held.len());
        Ok(MonitorToken {
            depth: self.held.len(),
            obj,
        })
    }

    pub fn exit<H: Host>(&mut self, host: &mut H, token: MonitorToken) -> Result<(), HostFailure> {
        debug_assert_eq!(token.depth, self.held.len(), "monitors must be exited in LIFO order");
        debug_assert_eq!(self.held.last(), Some(&token.obj));
        if let Some(pos) = self.held.iter().rposition(|h| *h == token.obj) {
            self.held.remove(pos);
        }
        log::trace!("monitor exit {:?}", token.obj);
        host.monitor_exit(token.obj)
    }

    /// Exits every held monitor, innermost first. An exception pending in
    /// the host survives.
    pub fn release_all<H: Host>(&mut self, host: &mut H) {
        if self.held.is_empty() {
            return;
        }
        let pending = host.exception_occurred();
        host.exception_clear();
        while let Some(obj) = self.held.pop() {
            log::warn!("monitor {obj:?} still held at scope exit");
            if host.monitor_exit(obj).is_err() {
                host.exception_clear();
            }
        }
        if let Some(e) = pending {
            if host.throw(e).is_err() {
                log::warn!("lost pending exception {e:?} while releasing monitors");
            }
            host.delete_local_ref(e);
        }
    }
}
