//! Reference management for native code bound to a managed VM.
//!
//! **nativeref** sits between compiled native code and the VM's native
//! interface. It multiplexes the VM's local references through a fixed table
//! of refcounted slots ([`slots`]), pins each managed primitive array at most
//! once no matter how many references point to it ([`arrays`]), and carries
//! managed exceptions and early returns through native control flow as
//! ordinary `Result` values ([`control`]).
//!
//! The VM itself is abstracted by the [`host::Host`] trait.
//! [`host::memory::MemoryHost`] implements it in memory and backs the test
//! suite and the command line driver.
//!
//! A [`Runtime`] is created once per process and initialized with
//! [`Runtime::init`]. Each native call then works through a [`frame::Frame`].

pub mod arrays;
pub mod control;
pub mod frame;
pub mod host;
pub mod interner;
pub mod linker;
pub mod monitor;
pub mod slots;
pub mod utils;

pub use log;

use arrays::{ArrayCache, CacheConfig};
use control::Completion;
use frame::Frame;
use host::{Handle, Host};
use linker::{BuiltinClass, BuiltinMethod, LinkMode, Linker};
use utils::error::{self, NativeError};

/// Configuration for the runtime and the frames it opens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub cache: CacheConfig,
    pub link_mode: LinkMode,
    /// Number of handle slots in each frame.
    pub slot_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            link_mode: LinkMode::default(),
            slot_capacity: 64,
        }
    }
}

/// Process-wide state: the array cache, the linker and the preallocated
/// out-of-memory error.
///
/// [`Runtime::init`] and [`Runtime::finalize`] are refcounted so that several
/// native libraries may share one runtime.
#[derive(Debug)]
pub struct Runtime {
    config: Config,
    cache: ArrayCache,
    linker: Linker,
    init_count: usize,
    oom_error: Option<Handle>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cache: ArrayCache::new(config.cache),
            linker: Linker::new(),
            init_count: 0,
            oom_error: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn cache(&self) -> &ArrayCache {
        &self.cache
    }
    pub fn cache_mut(&mut self) -> &mut ArrayCache {
        &mut self.cache
    }
    pub fn linker(&self) -> &Linker {
        &self.linker
    }
    pub fn linker_mut(&mut self) -> &mut Linker {
        &mut self.linker
    }
    pub fn is_initialized(&self) -> bool {
        self.init_count > 0
    }

    /// Links the built-in table and preallocates the out-of-memory error on
    /// the first call. Later calls only count.
    #[track_caller]
    pub fn init<H: Host>(&mut self, host: &mut H) -> Result<(), NativeError> {
        self.init_count += 1;
        if self.init_count > 1 {
            return Ok(());
        }
        let prepared = self
            .linker
            .link_builtins(host)
            .and_then(|()| self.create_oom_error(host));
        match prepared {
            Ok(oom) => {
                self.oom_error = Some(oom);
                log::debug!("runtime initialized");
                Ok(())
            }
            Err(e) => {
                self.init_count -= 1;
                self.linker.unlink(host);
                Err(e)
            }
        }
    }

    #[track_caller]
    fn create_oom_error<H: Host>(&mut self, host: &mut H) -> Result<Handle, NativeError> {
        let class = self
            .linker
            .class(host, BuiltinClass::OutOfMemoryError.index())?;
        let ctor = self
            .linker
            .method(host, BuiltinMethod::OutOfMemoryInit.index())?;
        let message = host
            .new_string_utf("unable to create exception object")
            .ok_or_else(|| NativeError::out_of_memory("cannot create error message"))?;
        let local = host.new_object(class, ctor, &[Some(message)]);
        host.delete_local_ref(message);
        let local = local.ok_or_else(|| NativeError::out_of_memory("cannot create error object"))?;
        let global = host.new_global_ref(local);
        host.delete_local_ref(local);
        global.ok_or_else(|| NativeError::out_of_memory("cannot keep error object"))
    }

    /// Undoes one [`Runtime::init`]. The last call tears the cache down and
    /// releases everything the linker resolved.
    pub fn finalize<H: Host>(&mut self, host: &mut H) {
        match self.init_count {
            0 => log::warn!("finalize called on an uninitialized runtime"),
            1 => {
                self.init_count = 0;
                self.cache.release_all(host);
                if let Some(oom) = self.oom_error.take() {
                    host.delete_global_ref(oom);
                }
                self.linker.unlink(host);
                log::debug!("runtime finalized");
            }
            _ => self.init_count -= 1,
        }
    }

    /// Resolves declared symbols ahead of use as configured.
    #[track_caller]
    pub fn link<H: Host>(&mut self, host: &mut H) -> Result<(), NativeError> {
        self.linker.link(host, self.config.link_mode)
    }

    /// Makes `err` the host's pending exception.
    pub fn raise<H: Host>(&self, host: &mut H, err: &NativeError) {
        let (class, fallback) = self.exception_classes(err);
        error::throw_described(
            host,
            class,
            fallback,
            self.oom_error,
            err.1,
            &err.0.to_string(),
        );
    }

    /// Creates the exception object for `err` without leaving it pending.
    pub fn new_exception<H: Host>(&self, host: &mut H, err: &NativeError) -> Handle {
        let (class, fallback) = self.exception_classes(err);
        error::new_exception(
            host,
            class,
            fallback,
            self.oom_error,
            err.1,
            &err.0.to_string(),
        )
    }

    fn exception_classes(&self, err: &NativeError) -> (Option<Handle>, Option<Handle>) {
        let class = err
            .kind()
            .exception_class()
            .and_then(|c| self.linker.builtin(c));
        (class, self.linker.builtin(BuiltinClass::UnknownError))
    }

    /// Opens a frame for one native call. The runtime must have been
    /// initialized with [`Runtime::init`].
    pub fn frame<'rt, H: Host>(&'rt mut self, host: &'rt mut H) -> Frame<'rt, H> {
        Frame::new(self, host)
    }

    pub fn frame_with_capacity<'rt, H: Host>(
        &'rt mut self,
        host: &'rt mut H,
        capacity: usize,
    ) -> Frame<'rt, H> {
        Frame::with_capacity(self, host, capacity)
    }

    /// Runs `body` as one native call. An exception that escapes it is left
    /// pending in the host and `R::default()` is returned.
    pub fn call<H: Host, R: Default>(
        &mut self,
        host: &mut H,
        body: impl FnOnce(&mut Frame<'_, H>) -> Completion<R, R>,
    ) -> R {
        self.frame(host).run(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;
    use crate::utils::error::ErrorKind;

    #[test]
    fn init_is_refcounted() {
        let mut host = MemoryHost::new();
        let mut rt = Runtime::new(Config::default());
        rt.init(&mut host).unwrap();
        rt.init(&mut host).unwrap();
        let globals = host.live_global_refs();
        assert!(globals > 0);
        rt.finalize(&mut host);
        assert!(rt.is_initialized());
        assert_eq!(host.live_global_refs(), globals);
        rt.finalize(&mut host);
        assert!(!rt.is_initialized());
        assert_eq!(host.live_global_refs(), 0);
    }

    #[test]
    fn failed_init_rolls_back() {
        let mut host = MemoryHost::new();
        host.fail_class(
            BuiltinClass::ClassCastException.name(),
            BuiltinClass::NoClassDefFoundError,
        );
        let mut rt = Runtime::new(Config::default());
        let err = rt.init(&mut host).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Linkage(_)));
        assert!(!rt.is_initialized());
        assert_eq!(host.live_global_refs(), 0);
    }

    #[test]
    fn raise_uses_builtin_class() {
        let mut host = MemoryHost::new();
        let mut rt = Runtime::new(Config::default());
        rt.init(&mut host).unwrap();
        rt.raise(&mut host, &NativeError::new(ErrorKind::Arithmetic));
        let e = host.exception_occurred().unwrap();
        host.exception_clear();
        assert_eq!(
            host.class_name_of(e).as_deref(),
            Some(BuiltinClass::ArithmeticException.name())
        );
        let message = host.exception_message(e).unwrap();
        assert!(message.ends_with("division by zero"));
        assert!(message.contains("lib.rs"));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "uninitialized runtime")]
    fn call_needs_init() {
        let mut host = MemoryHost::new();
        let mut rt = Runtime::new(Config::default());
        let _: i32 = rt.call(&mut host, |f| Ok(f.integer_division(1, 0)?));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "uninitialized runtime")]
    fn frame_after_finalize_is_rejected() {
        let mut host = MemoryHost::new();
        let mut rt = Runtime::new(Config::default());
        rt.init(&mut host).unwrap();
        rt.finalize(&mut host);
        let _frame = rt.frame(&mut host);
    }

    #[test]
    fn call_leaves_escaping_exception_pending() {
        let mut host = MemoryHost::new();
        let mut rt = Runtime::new(Config::default());
        rt.init(&mut host).unwrap();
        let r: i32 = rt.call(&mut host, |f| {
            let q = f.integer_division(7, 0)?;
            Ok(q)
        });
        assert_eq!(r, 0);
        assert!(host.exception_check());
    }
}
