//! Scenario driver for `nativeref`.
//!
//! Each scenario runs a small native call against the in-memory host and
//! reports what happened to the array cache and the host's reference and pin
//! counters.

use clap::ValueEnum;
use itertools::Itertools;
use nativeref::{
    Config, Runtime,
    arrays::{
        CacheConfig,
        element::{Int, PinStrategy},
    },
    control::TryBlock,
    host::{Host, memory::MemoryHost},
    linker::{BuiltinClass, LinkMode},
    log,
    utils::error::NativeError,
};

#[derive(clap::Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Scenario to run
    #[arg(long, value_enum, default_value_t = Scenario::All)]
    pub scenario: Scenario,

    /// Number of distinct arrays the growth scenario inserts.
    #[arg(long, default_value_t = 32)]
    pub arrays: usize,

    /// Fill ratio at which a cache generation stops accepting records.
    #[arg(long, default_value_t = 0.75)]
    pub load_factor: f64,

    /// Index into the prime table for the size of the first generation.
    #[arg(long, default_value_t = 0)]
    pub initial_size_index: usize,

    /// Pin arrays with the critical region API instead of per-type access.
    #[arg(long, default_value_t = false)]
    pub critical: bool,

    /// When declared classes and members are resolved.
    #[arg(long, value_enum, default_value_t = LinkModeArg::Lazy)]
    pub link_mode: LinkModeArg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    Dedup,
    Growth,
    Exceptions,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LinkModeArg {
    Lazy,
    Medium,
    Eager,
}

impl From<LinkModeArg> for LinkMode {
    fn from(value: LinkModeArg) -> Self {
        match value {
            LinkModeArg::Lazy => LinkMode::Lazy,
            LinkModeArg::Medium => LinkMode::Medium,
            LinkModeArg::Eager => LinkMode::Eager,
        }
    }
}

impl Args {
    pub fn to_config(&self) -> Config {
        Config {
            cache: CacheConfig {
                initial_size_index: self.initial_size_index,
                load_factor: self.load_factor,
                pin_strategy: if self.critical {
                    PinStrategy::Critical
                } else {
                    PinStrategy::Standard
                },
                ..CacheConfig::default()
            },
            link_mode: self.link_mode.into(),
            slot_capacity: Config::default().slot_capacity.max(self.arrays + 1),
        }
    }
}

/// What a scenario observed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Report {
    pub name: &'static str,
    pub lines: Vec<String>,
}

impl Report {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            lines: vec![],
        }
    }
    fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "[{}]", self.name)?;
        for line in &self.lines {
            writeln!(f, "  {line}")?;
        }
        Ok(())
    }
}

fn cache_summary(rt: &Runtime) -> String {
    let cache = rt.cache();
    format!(
        "generations: {} [{}], live records: {}",
        cache.generation_count(),
        cache.generations().iter().join(", "),
        cache.live_records()
    )
}

fn host_summary(host: &MemoryHost) -> String {
    let stats = host.stats();
    format!(
        "pins {}/{} critical {}/{} utf8 {}/{} identity hashes {}",
        stats.pins,
        stats.unpins,
        stats.critical_pins,
        stats.critical_unpins,
        stats.utf8_views,
        stats.utf8_releases,
        stats.identity_hashes
    )
}

/// Many references to one array end up in a single pinned record.
pub fn run_dedup(rt: &mut Runtime, host: &mut MemoryHost) -> Result<Report, NativeError> {
    let mut report = Report::new("dedup");
    let array = host.new_array_from::<Int>(&[1, 2, 3, 4, 5]);
    let pointers = rt.call(host, |f| {
        let mut bindings = vec![];
        let mut pointers = vec![];
        for _ in 0..4 {
            let local = f.host().new_local_ref(array);
            let mut binding = None;
            f.assign_simple(&mut binding, local)?;
            pointers.push(f.array_ptr::<Int>(binding)?.as_ptr() as usize);
            bindings.push(binding);
        }
        for mut b in bindings {
            f.release(&mut b);
        }
        Ok(pointers)
    });
    report.push(format!(
        "{} references, {} distinct element pointers",
        pointers.len(),
        pointers.iter().unique().count()
    ));
    report.push(cache_summary(rt));
    report.push(host_summary(host));
    host.delete_local_ref(array);
    Ok(report)
}

/// Distinct arrays fill the cache until new generations are appended.
pub fn run_growth(
    rt: &mut Runtime,
    host: &mut MemoryHost,
    count: usize,
) -> Result<Report, NativeError> {
    let mut report = Report::new("growth");
    let arrays = (0..count)
        .map(|i| host.new_array_from::<Int>(&[i as i32]))
        .collect::<Vec<_>>();
    let mut frame = rt.frame(host);
    let mut bindings = Vec::with_capacity(count);
    for &a in &arrays {
        let local = frame.host().new_local_ref(a);
        let mut binding = None;
        if frame.assign_simple(&mut binding, local).is_err()
            || frame.install_array(binding).is_err()
        {
            log::warn!("growth stopped after {} arrays", bindings.len());
            break;
        }
        bindings.push(binding);
    }
    report.push(format!("inserted {} arrays", bindings.len()));
    report.push(format!(
        "sizes: {}",
        frame.runtime().cache().generation_sizes().iter().join(" -> ")
    ));
    for mut b in bindings {
        frame.release(&mut b);
    }
    drop(frame);
    report.push(cache_summary(rt));
    for a in arrays {
        host.delete_local_ref(a);
    }
    Ok(report)
}

/// Exceptions raised by runtime checks are caught, or escape to the host.
pub fn run_exceptions(rt: &mut Runtime, host: &mut MemoryHost) -> Result<Report, NativeError> {
    let mut report = Report::new("exceptions");
    let arith = rt
        .linker_mut()
        .class(host, BuiltinClass::ArithmeticException.index())?;
    let mut caught = None;
    let r: i32 = rt.call(host, |f| {
        TryBlock::<_, i32>::new(f, |f| {
            f.integer_division(1, 0)?;
            Ok(())
        })
        .catch(arith, |f, e| {
            caught = f.host().exception_message(e);
            Ok(())
        })
        .end_local()?;
        Ok(1)
    });
    report.push(format!(
        "caught -> returned {r}, message: {:?}",
        caught.as_deref().map(str::trim)
    ));

    let array = host.new_array_from::<Int>(&[0; 3]);
    let r: i32 = rt.call(host, |f| {
        let mut binding = None;
        f.assign_simple(&mut binding, Some(array))?;
        f.check_bounds(binding, 3)?;
        Ok(1)
    });
    let escaped = host.exception_occurred();
    host.exception_clear();
    let description = escaped
        .map(|e| {
            let class = host.class_name_of(e).unwrap_or_default();
            let message = host.exception_message(e).unwrap_or_default();
            host.delete_local_ref(e);
            format!("{class}:{}", message.replace('\n', " "))
        })
        .unwrap_or_else(|| "nothing".to_string());
    report.push(format!("escaped -> returned {r}, pending {description}"));
    report.push(host_summary(host));
    Ok(report)
}

/// Runs the selected scenarios on a fresh runtime.
pub fn run(args: &Args) -> Result<Vec<Report>, NativeError> {
    let mut host = MemoryHost::new();
    let mut rt = Runtime::new(args.to_config());
    rt.init(&mut host)?;
    let result = run_selected(args, &mut rt, &mut host);
    rt.finalize(&mut host);
    result
}

fn run_selected(
    args: &Args,
    rt: &mut Runtime,
    host: &mut MemoryHost,
) -> Result<Vec<Report>, NativeError> {
    rt.link(host)?;
    let mut reports = vec![];
    if matches!(args.scenario, Scenario::Dedup | Scenario::All) {
        reports.push(run_dedup(rt, host)?);
    }
    if matches!(args.scenario, Scenario::Growth | Scenario::All) {
        reports.push(run_growth(rt, host, args.arrays)?);
    }
    if matches!(args.scenario, Scenario::Exceptions | Scenario::All) {
        reports.push(run_exceptions(rt, host)?);
    }
    Ok(reports)
}
