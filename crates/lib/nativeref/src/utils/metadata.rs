use std::fmt::{self, Display};

/// Source position of the native code that caused an error.
///
/// Captured with `#[track_caller]`, so the location reported in an exception
/// message is the caller of the public operation rather than the inside of
/// this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    pub fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    #[track_caller]
    pub fn caller() -> Self {
        let loc = std::panic::Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }

    pub fn internal() -> Self {
        Self {
            file: "internal",
            line: 0,
        }
    }
}

impl Default for CallSite {
    fn default() -> Self {
        Self::internal()
    }
}

impl Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
