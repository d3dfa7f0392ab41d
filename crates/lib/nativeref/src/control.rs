//! Exceptions and early returns across native control flow.
//!
//! Native code reports a managed exception or an early return as an
//! [`Abrupt`] completion and lets `?` carry it to the nearest enclosing
//! [`ExceptionScope`]. The scope then offers the exception to its catch
//! clauses, runs the finally block exactly once, and decides what leaves the
//! scope: a pending exception always wins over a pending return.
//!
//! [`TryBlock`] wraps a scope in a closure-based builder:
//!
//! ```ignore
//! TryBlock::new(frame, |f| risky(f))
//!     .catch(arith_class, |f, e| recover(f, e))
//!     .finally(|f| cleanup(f))
//!     .end_local()?;
//! ```

use std::ops::ControlFlow;

use crate::host::{Handle, Host, HostContext};

/// Why a block of native code stopped early.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Abrupt<R> {
    Throw(Handle),
    Return(R),
}

pub type Completion<T, R> = Result<T, Abrupt<R>>;

/// An exception object produced by a failed runtime check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thrown(pub Handle);

impl<R> From<Thrown> for Abrupt<R> {
    fn from(t: Thrown) -> Self {
        Abrupt::Throw(t.0)
    }
}

pub fn throw_local<T, R>(exception: Handle) -> Completion<T, R> {
    Err(Abrupt::Throw(exception))
}

pub fn return_local<T, R>(value: R) -> Completion<T, R> {
    Err(Abrupt::Return(value))
}

/// Turns the host's pending exception, if any, into a local throw.
pub fn eat_host_exception<H: Host, R>(host: &mut H) -> Completion<(), R> {
    if !host.exception_check() {
        return Ok(());
    }
    match host.exception_occurred() {
        Some(e) => {
            host.exception_clear();
            throw_local(e)
        }
        None => Ok(()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    Try,
    Catch,
    Finally,
    Done,
}

#[derive(Debug)]
pub struct ExceptionScope<R> {
    marker: Marker,
    exception: Option<Handle>,
    ret: Option<R>,
    caught: Option<Handle>,
    finally_ran: bool,
}

impl<R> Default for ExceptionScope<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> ExceptionScope<R> {
    pub fn new() -> Self {
        Self {
            marker: Marker::Try,
            exception: None,
            ret: None,
            caught: None,
            finally_ran: false,
        }
    }

    pub fn marker(&self) -> Marker {
        self.marker
    }

    pub fn pending_exception(&self) -> Option<Handle> {
        self.exception
    }

    pub fn pending_return(&self) -> Option<&R> {
        self.ret.as_ref()
    }

    /// Records how the current phase ended and moves to the next one.
    pub fn resume<H: Host>(&mut self, host: &mut H, completion: Completion<(), R>) {
        let threw = match completion {
            Ok(()) => false,
            Err(Abrupt::Throw(e)) => {
                if let Some(old) = self.exception.replace(e) {
                    if old != e && Some(old) != self.caught {
                        host.delete_local_ref(old);
                    }
                }
                true
            }
            Err(Abrupt::Return(v)) => {
                self.ret = Some(v);
                false
            }
        };
        self.marker = match self.marker {
            Marker::Try if threw => Marker::Catch,
            Marker::Try | Marker::Catch => Marker::Finally,
            Marker::Finally | Marker::Done => Marker::Done,
        };
    }

    /// Hands the pending exception to a catch clause for `class`.
    ///
    /// Only the first matching clause of a scope gets it.
    pub fn catch<H: Host>(&mut self, host: &mut H, class: Handle) -> Option<Handle> {
        if self.marker != Marker::Catch || self.caught.is_some() {
            return None;
        }
        let e = self.exception?;
        if !host.is_instance_of(e, class) {
            return None;
        }
        self.exception = None;
        self.caught = Some(e);
        Some(e)
    }

    /// Whether the finally block should run now. True once per scope.
    pub fn run_finally(&mut self) -> bool {
        if self.finally_ran || self.marker == Marker::Done {
            return false;
        }
        self.finally_ran = true;
        self.marker = Marker::Finally;
        true
    }

    /// Releases the caught exception, unless it was rethrown and is pending
    /// again.
    pub fn end_try<H: Host>(&mut self, host: &mut H) {
        if let Some(c) = self.caught.take() {
            if self.exception != Some(c) {
                host.delete_local_ref(c);
            }
        }
        self.marker = Marker::Done;
    }

    /// Leaves a nested scope: the pending exception, else the pending return,
    /// else normal completion.
    pub fn end_local<H: Host>(mut self, host: &mut H) -> Completion<(), R> {
        self.end_try(host);
        match (self.exception.take(), self.ret.take()) {
            (Some(e), _) => throw_local(e),
            (None, Some(v)) => return_local(v),
            (None, None) => Ok(()),
        }
    }

    /// Leaves the outermost scope of a native call. A pending exception is
    /// thrown into the host and the call returns `R::default()`.
    pub fn end_global<H: Host>(mut self, host: &mut H) -> ControlFlow<R>
    where
        R: Default,
    {
        self.end_try(host);
        match (self.exception.take(), self.ret.take()) {
            (Some(e), _) => {
                rethrow_into_host(host, e);
                ControlFlow::Break(R::default())
            }
            (None, Some(v)) => ControlFlow::Break(v),
            (None, None) => ControlFlow::Continue(()),
        }
    }
}

/// Makes `exception` the host's pending exception and drops the local
/// reference to it.
pub fn rethrow_into_host<H: Host>(host: &mut H, exception: Handle) {
    if host.throw(exception).is_err() {
        host.fatal_error("cannot rethrow pending exception");
    }
    host.delete_local_ref(exception);
}

/// Closure-based try/catch/finally over a [`HostContext`].
pub struct TryBlock<'c, C: HostContext, R> {
    ctx: &'c mut C,
    scope: ExceptionScope<R>,
}

impl<'c, C: HostContext, R> TryBlock<'c, C, R> {
    pub fn new(ctx: &'c mut C, body: impl FnOnce(&mut C) -> Completion<(), R>) -> Self {
        let mut scope = ExceptionScope::new();
        let completion = body(&mut *ctx);
        scope.resume(ctx.host_mut(), completion);
        Self { ctx, scope }
    }

    pub fn catch(
        mut self,
        class: Handle,
        handler: impl FnOnce(&mut C, Handle) -> Completion<(), R>,
    ) -> Self {
        if let Some(e) = self.scope.catch(self.ctx.host_mut(), class) {
            let completion = handler(&mut *self.ctx, e);
            self.scope.resume(self.ctx.host_mut(), completion);
        }
        self
    }

    pub fn finally(mut self, block: impl FnOnce(&mut C) -> Completion<(), R>) -> Self {
        if self.scope.run_finally() {
            let completion = block(&mut *self.ctx);
            self.scope.resume(self.ctx.host_mut(), completion);
        }
        self
    }

    pub fn end_local(self) -> Completion<(), R> {
        self.scope.end_local(self.ctx.host_mut())
    }

    pub fn end_global(self) -> ControlFlow<R>
    where
        R: Default,
    {
        self.scope.end_global(self.ctx.host_mut())
    }
}
