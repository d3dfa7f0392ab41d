//! Per-call view of the runtime.
//!
//! A [`Frame`] is opened when a native call starts and dropped when it
//! returns. It owns the call's handle slots and held monitors, borrows the
//! process-wide array cache and linker, and turns every failed runtime check
//! into a managed exception object ([`Thrown`]) that `?` can carry to the
//! enclosing [`crate::control::ExceptionScope`].
//!
//! Dropping the frame releases whatever the call forgot to release: slots that
//! are still bound, array pins, string views and monitors.

use std::{ffi::CStr, ptr::NonNull};

use num_traits::{CheckedRem, PrimInt, Zero};

use crate::{
    Runtime,
    arrays::{
        RecordId,
        element::{ElementType, PrimitiveElement},
    },
    control::{Abrupt, Completion, Thrown, eat_host_exception, rethrow_into_host},
    host::{Handle, Host, HostContext, MemberId},
    linker::{ClassIdx, FieldIdx, MethodIdx, StringIdx},
    monitor::{MonitorStack, MonitorToken},
    slots::{SlotIdx, SlotTable, simple_compare},
    utils::error::{ErrorKind, NativeError},
};

/// One dimension of an array built by [`Frame::new_array`].
#[derive(Clone, Copy, Debug)]
pub struct Dimension {
    pub length: i32,
    /// Class of the elements of this dimension's arrays. Not needed for the
    /// innermost dimension of a primitive array.
    pub element_class: Option<Handle>,
}

pub struct Frame<'rt, H: Host> {
    host: &'rt mut H,
    runtime: &'rt mut Runtime,
    slots: SlotTable,
    monitors: MonitorStack,
}

impl<'rt, H: Host> Frame<'rt, H> {
    pub fn new(runtime: &'rt mut Runtime, host: &'rt mut H) -> Self {
        let capacity = runtime.config().slot_capacity;
        Self::with_capacity(runtime, host, capacity)
    }

    pub fn with_capacity(runtime: &'rt mut Runtime, host: &'rt mut H, capacity: usize) -> Self {
        debug_assert!(
            runtime.is_initialized(),
            "frame opened on an uninitialized runtime"
        );
        Self {
            host,
            runtime,
            slots: SlotTable::new(capacity),
            monitors: MonitorStack::new(),
        }
    }

    pub fn host(&mut self) -> &mut H {
        &mut *self.host
    }

    pub fn runtime(&self) -> &Runtime {
        &*self.runtime
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    // exceptions

    /// Materializes `err` as an exception object.
    pub fn raise(&mut self, err: NativeError) -> Thrown {
        Thrown(self.runtime.new_exception(&mut *self.host, &err))
    }

    fn lift<T>(&mut self, result: Result<T, NativeError>) -> Result<T, Thrown> {
        result.map_err(|e| self.raise(e))
    }

    /// The host's pending exception, or `fallback` raised when there is none.
    fn take_pending(&mut self, fallback: NativeError) -> Thrown {
        match self.host.exception_occurred() {
            Some(e) => {
                self.host.exception_clear();
                Thrown(e)
            }
            None => self.raise(fallback),
        }
    }

    /// Converts an exception the host has pending into a local throw.
    pub fn check(&mut self) -> Result<(), Thrown> {
        match eat_host_exception::<_, ()>(&mut *self.host) {
            Err(Abrupt::Throw(e)) => Err(Thrown(e)),
            _ => Ok(()),
        }
    }

    /// Calls into the host and checks for an exception afterwards.
    pub fn with_host<T>(&mut self, f: impl FnOnce(&mut H) -> T) -> Result<T, Thrown> {
        let value = f(&mut *self.host);
        self.check()?;
        Ok(value)
    }

    // handles

    #[track_caller]
    pub fn install(&mut self, handle: Option<Handle>) -> Result<Option<SlotIdx>, Thrown> {
        let installed = self
            .slots
            .install(&mut *self.host, self.runtime.cache_mut(), handle);
        self.lift(installed)
    }

    pub fn increment(&mut self, idx: SlotIdx) {
        self.slots.increment(idx);
    }

    pub fn decrement(&mut self, idx: SlotIdx) {
        self.slots
            .decrement(&mut *self.host, self.runtime.cache_mut(), idx);
    }

    pub fn deref(&self, idx: Option<SlotIdx>) -> Option<Handle> {
        self.slots.deref(idx)
    }

    #[track_caller]
    pub fn assign_simple(
        &mut self,
        binding: &mut Option<SlotIdx>,
        handle: Option<Handle>,
    ) -> Result<(), Thrown> {
        let assigned =
            self.slots
                .assign_simple(&mut *self.host, self.runtime.cache_mut(), binding, handle);
        self.lift(assigned)
    }

    pub fn assign_multi(&mut self, binding: &mut Option<SlotIdx>, source: Option<SlotIdx>) {
        self.slots
            .assign_multi(&mut *self.host, self.runtime.cache_mut(), binding, source);
    }

    /// Unbinds `binding`.
    pub fn release(&mut self, binding: &mut Option<SlotIdx>) {
        self.assign_multi(binding, None);
    }

    pub fn simple_compare(&self, a: Option<Handle>, b: Option<Handle>) -> bool {
        simple_compare(&*self.host, a, b)
    }

    pub fn multiref_compare(&self, a: Option<SlotIdx>, b: Option<SlotIdx>) -> bool {
        self.slots
            .multiref_compare(&*self.host, self.runtime.cache(), a, b)
    }

    // arrays

    #[track_caller]
    fn non_null(&mut self, slot: Option<SlotIdx>, what: &str) -> Result<SlotIdx, Thrown> {
        match slot {
            Some(idx) => Ok(idx),
            None => Err(self.raise(NativeError::null_reference(format!("null {what} reference")))),
        }
    }

    #[track_caller]
    pub fn install_array(&mut self, slot: Option<SlotIdx>) -> Result<RecordId, Thrown> {
        let idx = self.non_null(slot, "array")?;
        let installed = self
            .slots
            .install_array(&mut *self.host, self.runtime.cache_mut(), idx);
        self.lift(installed)
    }

    #[track_caller]
    pub fn array_length(&mut self, slot: Option<SlotIdx>) -> Result<i32, Thrown> {
        let idx = self.non_null(slot, "array")?;
        let len = self
            .slots
            .length(&mut *self.host, self.runtime.cache_mut(), idx);
        self.lift(len)
    }

    #[track_caller]
    pub fn check_bounds(&mut self, slot: Option<SlotIdx>, index: i32) -> Result<(), Thrown> {
        let idx = self.non_null(slot, "array")?;
        let checked =
            self.slots
                .check_bounds(&mut *self.host, self.runtime.cache_mut(), idx, index);
        self.lift(checked)
    }

    /// Bounds check on an array that is not held in a slot.
    #[track_caller]
    pub fn check_handle_bounds(&mut self, array: Option<Handle>, index: i32) -> Result<(), Thrown> {
        let array = self.ensure_not_null(array, "null array reference")?;
        let len = self.host.array_length(array);
        if (0..len).contains(&index) {
            Ok(())
        } else {
            Err(self.raise(NativeError::new(ErrorKind::IndexOutOfBounds { index })))
        }
    }

    /// Managed elements of the array in `slot`, pinned on first use.
    #[track_caller]
    pub fn array_ptr<E: PrimitiveElement>(
        &mut self,
        slot: Option<SlotIdx>,
    ) -> Result<NonNull<E::Managed>, Thrown> {
        let id = self.install_array(slot)?;
        let ptr = self
            .runtime
            .cache_mut()
            .get_native_pointer::<E, H>(&mut *self.host, id);
        self.lift(ptr)
    }

    /// Elements of the array in `slot` in their native representation.
    #[track_caller]
    pub fn converted_ptr<E: PrimitiveElement>(
        &mut self,
        slot: Option<SlotIdx>,
    ) -> Result<NonNull<E::Native>, Thrown> {
        let id = self.install_array(slot)?;
        let ptr = self
            .runtime
            .cache_mut()
            .get_converted_pointer::<E, H>(&mut *self.host, id);
        self.lift(ptr)
    }

    #[track_caller]
    pub fn elements<E: PrimitiveElement>(
        &mut self,
        slot: Option<SlotIdx>,
    ) -> Result<&mut [E::Managed], Thrown> {
        let ptr = self.array_ptr::<E>(slot)?;
        let len = usize::try_from(self.array_length(slot)?).unwrap_or(0);
        // SAFETY: the pin holds `len` elements until the record is released,
        // which needs `&mut self`.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }

    #[track_caller]
    pub fn native_elements<E: PrimitiveElement>(
        &mut self,
        slot: Option<SlotIdx>,
    ) -> Result<&mut [E::Native], Thrown> {
        let ptr = self.converted_ptr::<E>(slot)?;
        let len = usize::try_from(self.array_length(slot)?).unwrap_or(0);
        // SAFETY: as for `elements`; a converted copy has the same length.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }

    /// Creates a possibly nested array, one [`Dimension`] per level. With
    /// `innermost` set, the last dimension is a primitive array of that type.
    #[track_caller]
    pub fn new_array(
        &mut self,
        dims: &[Dimension],
        innermost: Option<ElementType>,
    ) -> Result<Handle, Thrown> {
        for (i, d) in dims.iter().enumerate() {
            self.ensure_array_size_nonnegative(i, d.length)?;
        }
        match build_array(&mut *self.host, dims, innermost) {
            Ok(array) => Ok(array),
            Err(()) => Err(self.take_pending(NativeError::out_of_memory("cannot create an array"))),
        }
    }

    // strings

    #[track_caller]
    pub fn utf16(&mut self, slot: Option<SlotIdx>) -> Result<&[u16], Thrown> {
        let idx = self.non_null(slot, "string")?;
        let loaded = self.slots.load_utf16(&mut *self.host, idx);
        self.lift(loaded)?;
        Ok(self.slots.utf16(idx).unwrap_or_default())
    }

    #[track_caller]
    pub fn utf8(&mut self, slot: Option<SlotIdx>) -> Result<&CStr, Thrown> {
        let idx = self.non_null(slot, "string")?;
        let loaded = self.slots.load_utf8(&mut *self.host, idx);
        self.lift(loaded)?;
        Ok(self.slots.utf8(idx).unwrap_or_default())
    }

    // checks

    #[track_caller]
    pub fn ensure_not_null(&mut self, obj: Option<Handle>, message: &str) -> Result<Handle, Thrown> {
        match obj {
            Some(h) => Ok(h),
            None => Err(self.raise(NativeError::null_reference(message))),
        }
    }

    #[track_caller]
    pub fn ensure_divisor_not_zero<T: Zero>(&mut self, divisor: T) -> Result<(), Thrown> {
        if divisor.is_zero() {
            Err(self.raise(NativeError::new(ErrorKind::Arithmetic)))
        } else {
            Ok(())
        }
    }

    /// Integer division that raises on a zero divisor and wraps on overflow.
    #[track_caller]
    pub fn integer_division<T: PrimInt>(&mut self, lhs: T, rhs: T) -> Result<T, Thrown> {
        self.ensure_divisor_not_zero(rhs)?;
        // only MIN / -1 overflows, and it wraps back to MIN
        Ok(lhs.checked_div(&rhs).unwrap_or(lhs))
    }

    #[track_caller]
    pub fn integer_remainder<T: PrimInt + CheckedRem>(&mut self, lhs: T, rhs: T) -> Result<T, Thrown> {
        self.ensure_divisor_not_zero(rhs)?;
        Ok(lhs.checked_rem(&rhs).unwrap_or(T::zero()))
    }

    #[track_caller]
    pub fn ensure_array_size_nonnegative(&mut self, dimension: usize, size: i32) -> Result<(), Thrown> {
        if size < 0 {
            Err(self.raise(NativeError::new(ErrorKind::NegativeArraySize { dimension, size })))
        } else {
            Ok(())
        }
    }

    /// Instance test where null is never an instance.
    pub fn is_instance_of(&self, obj: Option<Handle>, class: Handle) -> bool {
        obj.is_some_and(|o| self.host.is_instance_of(o, class))
    }

    /// Cast check where null always passes.
    #[track_caller]
    pub fn cast_check(&mut self, obj: Option<Handle>, class: ClassIdx) -> Result<(), Thrown> {
        let Some(obj) = obj else {
            return Ok(());
        };
        let class_handle = self.class(class)?;
        if self.host.is_instance_of(obj, class_handle) {
            Ok(())
        } else {
            let expected = self.runtime.linker().class_name(class);
            Err(self.raise(NativeError::new(ErrorKind::ClassCast { expected })))
        }
    }

    // linking

    #[track_caller]
    pub fn class(&mut self, idx: ClassIdx) -> Result<Handle, Thrown> {
        let class = self.runtime.linker_mut().class(&mut *self.host, idx);
        self.lift(class)
    }

    #[track_caller]
    pub fn field(&mut self, idx: FieldIdx) -> Result<MemberId, Thrown> {
        let field = self.runtime.linker_mut().field(&mut *self.host, idx);
        self.lift(field)
    }

    #[track_caller]
    pub fn method(&mut self, idx: MethodIdx) -> Result<MemberId, Thrown> {
        let method = self.runtime.linker_mut().method(&mut *self.host, idx);
        self.lift(method)
    }

    #[track_caller]
    pub fn string(&mut self, idx: StringIdx) -> Result<Handle, Thrown> {
        let s = self.runtime.linker_mut().string(&mut *self.host, idx);
        self.lift(s)
    }

    // monitors

    #[track_caller]
    pub fn monitor_enter(&mut self, obj: Handle) -> Result<MonitorToken, Thrown> {
        match self.monitors.enter(&mut *self.host, obj) {
            Ok(token) => Ok(token),
            Err(_) => Err(self.take_pending(NativeError::unknown("cannot enter monitor"))),
        }
    }

    #[track_caller]
    pub fn monitor_exit(&mut self, token: MonitorToken) -> Result<(), Thrown> {
        match self.monitors.exit(&mut *self.host, token) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.take_pending(NativeError::unknown("cannot exit monitor"))),
        }
    }

    /// Runs `body` holding the monitor of `obj`. The monitor is exited on
    /// every path; an exception from exiting replaces the body's outcome.
    #[track_caller]
    pub fn synchronized<T, R>(
        &mut self,
        obj: Handle,
        body: impl FnOnce(&mut Self) -> Completion<T, R>,
    ) -> Completion<T, R> {
        let token = self.monitor_enter(obj)?;
        let result = body(self);
        match self.monitor_exit(token) {
            Ok(()) => result,
            Err(thrown) => {
                if let Err(Abrupt::Throw(e)) = result {
                    self.host.delete_local_ref(e);
                }
                Err(thrown.into())
            }
        }
    }

    // call boundary

    /// Ends the native call: a pending exception is thrown into the host and
    /// `R::default()` is returned in its place.
    pub fn finish<R: Default>(self, completion: Completion<R, R>) -> R {
        match completion {
            Ok(v) | Err(Abrupt::Return(v)) => v,
            Err(Abrupt::Throw(e)) => {
                rethrow_into_host(&mut *self.host, e);
                R::default()
            }
        }
    }

    pub fn run<R: Default>(mut self, body: impl FnOnce(&mut Self) -> Completion<R, R>) -> R {
        let completion = body(&mut self);
        self.finish(completion)
    }
}

fn build_array<H: Host>(
    host: &mut H,
    dims: &[Dimension],
    innermost: Option<ElementType>,
) -> Result<Handle, ()> {
    let Some((dim, rest)) = dims.split_first() else {
        return Err(());
    };
    match (rest.is_empty(), innermost) {
        (true, Some(ty)) => return host.new_primitive_array(ty, dim.length).ok_or(()),
        (true, None) => {
            let class = dim.element_class.ok_or(())?;
            return host.new_object_array(dim.length, class).ok_or(());
        }
        _ => {}
    }
    let class = dim.element_class.ok_or(())?;
    let array = host.new_object_array(dim.length, class).ok_or(())?;
    for i in 0..dim.length {
        let filled = build_array(host, rest, innermost).and_then(|sub| {
            let set = host.set_object_array_element(array, i, Some(sub));
            host.delete_local_ref(sub);
            set.map_err(|_| ())
        });
        if filled.is_err() {
            host.delete_local_ref(array);
            return Err(());
        }
    }
    Ok(array)
}

impl<H: Host> HostContext for Frame<'_, H> {
    type Host = H;
    fn host_mut(&mut self) -> &mut H {
        &mut *self.host
    }
}

impl<H: Host> Drop for Frame<'_, H> {
    fn drop(&mut self) {
        self.slots
            .release_all(&mut *self.host, self.runtime.cache_mut());
        self.monitors.release_all(&mut *self.host);
    }
}
