//! Shared helpers for the integration tests of `nativeref`.

use nativeref::{
    Config, Runtime,
    arrays::{CacheConfig, element::PrimitiveElement},
    frame::Frame,
    host::{Handle, Host, memory::MemoryHost},
    linker::BuiltinClass,
    log,
    slots::SlotIdx,
};

/// Routes `log` output of the runtime to the test harness.
pub fn init_logger() {
    let _ = colog::default_builder()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

/// An initialized runtime over a fresh in-memory host.
pub fn setup(config: Config) -> (MemoryHost, Runtime) {
    init_logger();
    let mut host = MemoryHost::new();
    let mut runtime = Runtime::new(config);
    if let Err(e) = runtime.init(&mut host) {
        panic!("runtime failed to initialize: {e}");
    }
    (host, runtime)
}

pub fn setup_default() -> (MemoryHost, Runtime) {
    setup(Config::default())
}

/// Configuration whose initial generation (size 3) holds a single record, so
/// the second distinct array grows the cache.
pub fn small_cache_config() -> Config {
    Config {
        cache: CacheConfig {
            initial_size_index: 0,
            load_factor: 0.5,
            ..CacheConfig::default()
        },
        ..Config::default()
    }
}

/// Installs `handle` in the frame and binds it once.
pub fn bind<H: Host>(frame: &mut Frame<'_, H>, handle: Handle) -> Option<SlotIdx> {
    let mut binding = None;
    if frame.assign_simple(&mut binding, Some(handle)).is_err() {
        panic!("cannot bind {handle:?}");
    }
    binding
}

pub fn new_array<E: PrimitiveElement>(host: &mut MemoryHost, values: &[E::Managed]) -> Handle {
    host.new_array_from::<E>(values)
}

/// Takes the host's pending exception and returns its class name and message.
pub fn take_exception(host: &mut MemoryHost) -> Option<(String, String)> {
    let e = host.exception_occurred()?;
    host.exception_clear();
    let class = host.class_name_of(e).unwrap_or_default();
    let message = host.exception_message(e).unwrap_or_default();
    host.delete_local_ref(e);
    Some((class, message))
}

/// Class name and message of an exception object held by native code.
pub fn describe(host: &mut MemoryHost, exception: Handle) -> (String, String) {
    (
        host.class_name_of(exception).unwrap_or_default(),
        host.exception_message(exception).unwrap_or_default(),
    )
}

pub fn builtin(runtime: &Runtime, class: BuiltinClass) -> Handle {
    match runtime.linker().builtin(class) {
        Some(h) => h,
        None => panic!("{} is not linked", class.name()),
    }
}

/// Asserts that nothing pinned or viewed is left in the host.
pub fn assert_released(host: &MemoryHost) {
    assert_eq!(host.outstanding_pins(), 0, "pins left behind");
    assert_eq!(host.outstanding_utf8_views(), 0, "string views left behind");
    assert_eq!(
        host.stats().utf16_views,
        host.stats().utf16_releases,
        "utf16 views left behind"
    );
}
