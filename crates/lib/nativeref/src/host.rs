//! The managed runtime, seen from native code.
//!
//! Everything this crate needs from the virtual machine goes through the
//! [`Host`] trait: identity hashing and comparison, exceptions, array pinning,
//! string contents, monitors and symbol lookup. [`memory::MemoryHost`] is a
//! self-contained implementation used by the tests and the command line tool.

use std::{
    fmt,
    num::NonZeroU64,
    ptr::NonNull,
};

use thiserror::Error;

use crate::arrays::element::ElementType;

pub mod memory;

/// Opaque, non-null reference to a managed object issued by the host.
///
/// Nullable references are spelled `Option<Handle>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU64);

impl Handle {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

/// Resolved field or method identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemberId(pub NonZeroU64);

/// Pointer and element count of string contents lent out by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawChars<T> {
    pub ptr: NonNull<T>,
    pub len: usize,
}

/// A host operation failed. Unless documented otherwise the host has an
/// exception pending afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("host operation failed")]
pub struct HostFailure;

/// Capabilities of the managed runtime.
///
/// Handles returned by methods documented as "new local reference" are owned
/// by the caller, who releases them with [`Host::delete_local_ref`] or leaves
/// them to the host's bulk reclamation when the native call returns.
///
/// Pointers returned by the pin and string methods stay valid until the
/// matching release method is called with the same pointer.
pub trait Host {
    // symbol lookup; on failure an exception describing the cause is pending
    fn find_class(&mut self, name: &str) -> Option<Handle>;
    fn field_id(
        &mut self,
        class: Handle,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> Option<MemberId>;
    fn method_id(
        &mut self,
        class: Handle,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> Option<MemberId>;
    /// New local reference to the canonical string object for `utf8`.
    fn intern_string(&mut self, utf8: &str) -> Option<Handle>;
    fn new_string_utf(&mut self, utf8: &str) -> Option<Handle>;
    fn new_object(
        &mut self,
        class: Handle,
        constructor: MemberId,
        args: &[Option<Handle>],
    ) -> Option<Handle>;

    // references
    fn new_local_ref(&mut self, obj: Handle) -> Option<Handle>;
    fn delete_local_ref(&mut self, obj: Handle);
    fn new_global_ref(&mut self, obj: Handle) -> Option<Handle>;
    fn new_weak_global_ref(&mut self, obj: Handle) -> Option<Handle>;
    fn delete_global_ref(&mut self, obj: Handle);
    fn delete_weak_global_ref(&mut self, obj: Handle);

    // identity
    fn identity_hash(&mut self, obj: Handle) -> i32;
    fn is_same_object(&self, a: Handle, b: Handle) -> bool;
    fn is_instance_of(&self, obj: Handle, class: Handle) -> bool;
    /// New local reference to the class of `obj`.
    fn class_of(&mut self, obj: Handle) -> Option<Handle>;

    // exceptions
    fn throw(&mut self, exception: Handle) -> Result<(), HostFailure>;
    fn throw_new(&mut self, class: Handle, message: &str) -> Result<(), HostFailure>;
    /// New local reference to the pending exception, which stays pending.
    fn exception_occurred(&mut self) -> Option<Handle>;
    fn exception_check(&self) -> bool;
    fn exception_clear(&mut self);
    fn exception_message(&mut self, exception: Handle) -> Option<String>;
    fn fatal_error(&mut self, message: &str) -> !;

    // arrays
    fn array_length(&mut self, array: Handle) -> i32;
    fn pin_array(&mut self, array: Handle, ty: ElementType) -> Option<NonNull<u8>>;
    fn unpin_array(&mut self, array: Handle, ty: ElementType, elements: NonNull<u8>);
    fn pin_critical(&mut self, array: Handle) -> Option<NonNull<u8>>;
    fn unpin_critical(&mut self, array: Handle, elements: NonNull<u8>);
    fn new_primitive_array(&mut self, ty: ElementType, length: i32) -> Option<Handle>;
    fn new_object_array(&mut self, length: i32, element_class: Handle) -> Option<Handle>;
    fn set_object_array_element(
        &mut self,
        array: Handle,
        index: i32,
        value: Option<Handle>,
    ) -> Result<(), HostFailure>;

    // strings
    fn string_utf16(&mut self, s: Handle) -> Option<RawChars<u16>>;
    fn release_string_utf16(&mut self, s: Handle, chars: NonNull<u16>);
    /// NUL-terminated modified UTF-8; `len` excludes the terminator.
    fn string_utf8(&mut self, s: Handle) -> Option<RawChars<u8>>;
    fn release_string_utf8(&mut self, s: Handle, chars: NonNull<u8>);

    // monitors
    fn monitor_enter(&mut self, obj: Handle) -> Result<(), HostFailure>;
    fn monitor_exit(&mut self, obj: Handle) -> Result<(), HostFailure>;
}

/// Something that can lend out the host, so control-flow helpers can run
/// over a bare host as well as over a [`crate::frame::Frame`].
pub trait HostContext {
    type Host: Host;
    fn host_mut(&mut self) -> &mut Self::Host;
}
