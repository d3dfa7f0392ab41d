use std::fmt::Write;

use thiserror::Error;

use super::metadata::CallSite;
use crate::host::{Handle, Host};
use crate::linker::{BuiltinClass, LinkageError};

/// Prefix of every message built by [`throw_described`].
pub const MESSAGE_PREFIX: &str = "nativeref";

/// Original messages of a replaced pending exception are cut to this many
/// characters.
const ORIGINAL_MESSAGE_LIMIT: usize = 256;

/// An error that knows where in native code it happened.
pub trait ReportableError: std::error::Error {
    fn get_message(&self) -> String {
        self.to_string()
    }
    fn get_site(&self) -> CallSite;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("{0}")]
    OutOfMemory(String),
    #[error("{0}")]
    NullReference(String),
    #[error("Array index out of range: {index}")]
    IndexOutOfBounds { index: i32 },
    #[error("{dimension}: {size}")]
    NegativeArraySize { dimension: usize, size: i32 },
    #[error("division by zero")]
    Arithmetic,
    #[error("Object is not of type {expected}")]
    ClassCast { expected: String },
    #[error(transparent)]
    Linkage(#[from] LinkageError),
    #[error("{0}")]
    Unknown(String),
}

impl ErrorKind {
    /// The built-in class an exception for this error is raised with.
    ///
    /// `None` means "reuse the class of the exception the host already has
    /// pending, or fall back to the unknown-error class".
    pub fn exception_class(&self) -> Option<BuiltinClass> {
        match self {
            ErrorKind::OutOfMemory(_) => Some(BuiltinClass::OutOfMemoryError),
            ErrorKind::NullReference(_) => Some(BuiltinClass::NullPointerException),
            ErrorKind::IndexOutOfBounds { .. } => {
                Some(BuiltinClass::ArrayIndexOutOfBoundsException)
            }
            ErrorKind::NegativeArraySize { .. } => Some(BuiltinClass::NegativeArraySizeException),
            ErrorKind::Arithmetic => Some(BuiltinClass::ArithmeticException),
            ErrorKind::ClassCast { .. } => Some(BuiltinClass::ClassCastException),
            ErrorKind::Linkage(_) | ErrorKind::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct NativeError(pub ErrorKind, pub CallSite);

impl NativeError {
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        Self(kind, CallSite::caller())
    }
    #[track_caller]
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfMemory(message.into()))
    }
    #[track_caller]
    pub fn null_reference(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NullReference(message.into()))
    }
    #[track_caller]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown(message.into()))
    }
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

impl ReportableError for NativeError {
    fn get_site(&self) -> CallSite {
        self.1
    }
}

/// Makes `class` the host's pending exception with a message describing
/// `site` and `message`.
///
/// An exception that is already pending is cleared first; its message is
/// appended and, when `class` is `None`, its class is reused. Without any
/// class the `fallback` class is used. If the host cannot construct the
/// exception, `oom` (a preallocated out-of-memory object) is thrown instead,
/// and if even that fails the host is asked to abort.
pub fn throw_described<H: Host>(
    host: &mut H,
    class: Option<Handle>,
    fallback: Option<Handle>,
    oom: Option<Handle>,
    site: CallSite,
    message: &str,
) {
    let mut text = format!("\n{MESSAGE_PREFIX}: {site}: {message}");
    let mut class = class;
    let mut pending_class = None;
    if let Some(pending) = host.exception_occurred() {
        host.exception_clear();
        if class.is_none() {
            pending_class = host.class_of(pending);
            class = pending_class;
        }
        if let Some(original) = host.exception_message(pending) {
            let _ = write!(
                text,
                "\nOriginal message: {:.*}",
                ORIGINAL_MESSAGE_LIMIT, original
            );
        }
        host.delete_local_ref(pending);
    }
    let thrown = match class.or(fallback) {
        Some(class) => host.throw_new(class, &text).is_ok(),
        None => false,
    };
    if let Some(c) = pending_class {
        host.delete_local_ref(c);
    }
    if thrown {
        return;
    }
    log::warn!("could not construct exception, falling back: {}", text.trim());
    if let Some(oom) = oom {
        if host.throw(oom).is_ok() {
            return;
        }
    }
    host.fatal_error(&text)
}

/// Raises like [`throw_described`], then takes the exception back out of the
/// host so it can be held as a local value.
pub fn new_exception<H: Host>(
    host: &mut H,
    class: Option<Handle>,
    fallback: Option<Handle>,
    oom: Option<Handle>,
    site: CallSite,
    message: &str,
) -> Handle {
    throw_described(host, class, fallback, oom, site, message);
    match host.exception_occurred() {
        Some(exception) => {
            host.exception_clear();
            exception
        }
        None => host.fatal_error("raised exception is not pending"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;

    #[test]
    fn message_names_site() {
        let mut host = MemoryHost::new();
        let npe = host.class_by_name(BuiltinClass::NullPointerException.name());
        let site = CallSite::new("foo.c", 12);
        let e = new_exception(&mut host, npe, None, None, site, "null array reference");
        assert!(!host.exception_check());
        assert_eq!(
            host.exception_message(e).as_deref(),
            Some("\nnativeref: foo.c:12: null array reference")
        );
        assert_eq!(host.class_name_of(e).as_deref(), Some(BuiltinClass::NullPointerException.name()));
    }

    #[test]
    fn pending_exception_is_chained() {
        let mut host = MemoryHost::new();
        let arith = host.class_by_name(BuiltinClass::ArithmeticException.name()).unwrap();
        host.throw_new(arith, "first").unwrap();
        let unknown = host.class_by_name(BuiltinClass::UnknownError.name());
        let e = new_exception(&mut host, None, unknown, None, CallSite::new("bar.c", 3), "second");
        // class of the replaced exception is kept when none is given
        assert_eq!(host.class_name_of(e).as_deref(), Some(BuiltinClass::ArithmeticException.name()));
        assert_eq!(
            host.exception_message(e).as_deref(),
            Some("\nnativeref: bar.c:3: second\nOriginal message: first")
        );
    }

    #[test]
    fn falls_back_to_preallocated_error() {
        let mut host = MemoryHost::new();
        let oom_class = host.class_by_name(BuiltinClass::OutOfMemoryError.name()).unwrap();
        host.throw_new(oom_class, "preallocated").unwrap();
        let oom = host.exception_occurred().unwrap();
        host.exception_clear();
        let oom = host.new_global_ref(oom).unwrap();
        host.fail_throw_new(true);
        let e = new_exception(&mut host, Some(oom_class), None, Some(oom), CallSite::internal(), "boom");
        assert!(host.is_same_object(e, oom));
    }

    #[test]
    fn kinds_map_to_builtin_classes() {
        assert_eq!(
            ErrorKind::IndexOutOfBounds { index: 5 }.exception_class(),
            Some(BuiltinClass::ArrayIndexOutOfBoundsException)
        );
        assert_eq!(ErrorKind::Unknown("x".into()).exception_class(), None);
        assert_eq!(
            ErrorKind::IndexOutOfBounds { index: 5 }.to_string(),
            "Array index out of range: 5"
        );
        assert_eq!(
            ErrorKind::NegativeArraySize { dimension: 1, size: -3 }.to_string(),
            "1: -3"
        );
    }
}
