//! A [`Host`] that keeps its whole object model in memory.
//!
//! Objects and references live in two slot maps. Every reference handed out
//! is a distinct key, so two local references to the same object compare
//! unequal as handles and equal through [`Host::is_same_object`], like in a
//! real virtual machine. The class hierarchy contains the built-in classes the
//! runtime links against. Counters and failure switches let tests observe
//! pin/unpin symmetry and drive the error paths.

use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroU64,
    ptr::NonNull,
};

use slotmap::{Key, KeyData, SlotMap};

use super::{Handle, Host, HostContext, HostFailure, MemberId, RawChars};
use crate::arrays::element::{ElementType, PrimitiveElement};
use crate::linker::{BuiltinClass, BuiltinMethod};

slotmap::new_key_type! {
    pub struct ObjectKey;
    pub struct RefKey;
}

#[derive(Debug, Clone, PartialEq)]
struct Member {
    name: String,
    signature: String,
    is_static: bool,
    is_method: bool,
    id: MemberId,
}

#[derive(Debug)]
enum Payload {
    Class {
        name: String,
        superclass: Option<ObjectKey>,
        members: Vec<Member>,
    },
    Plain,
    Throwable {
        message: Option<String>,
    },
    Str {
        utf16: Vec<u16>,
    },
    Primitive {
        ty: ElementType,
        len: usize,
        words: Vec<u64>,
    },
    Objects(Vec<Option<ObjectKey>>),
}

#[derive(Debug)]
struct Object {
    class: Option<ObjectKey>,
    payload: Payload,
    hash: i32,
    monitor_depth: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    Local,
    Global,
    WeakGlobal,
}

#[derive(Clone, Copy, Debug)]
struct Reference {
    object: ObjectKey,
    kind: RefKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorOp {
    Enter,
    Exit,
}

/// Counters of host calls, for asserting release symmetry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    pub pins: usize,
    pub unpins: usize,
    pub critical_pins: usize,
    pub critical_unpins: usize,
    pub local_refs_deleted: usize,
    pub utf16_views: usize,
    pub utf16_releases: usize,
    pub utf8_views: usize,
    pub utf8_releases: usize,
    pub identity_hashes: usize,
}

#[derive(Debug, Default)]
struct Failures {
    next_pin: bool,
    allocations: bool,
    throw_new: bool,
    monitor_exit: bool,
    classes: HashMap<String, BuiltinClass>,
}

#[derive(Debug)]
pub struct MemoryHost {
    objects: SlotMap<ObjectKey, Object>,
    refs: SlotMap<RefKey, Reference>,
    classes: BTreeMap<String, ObjectKey>,
    interned: HashMap<String, ObjectKey>,
    utf8_views: HashMap<usize, Box<[u8]>>,
    pending: Option<ObjectKey>,
    outstanding_pins: HashMap<ObjectKey, usize>,
    monitor_log: Vec<(MonitorOp, ObjectKey)>,
    stats: HostStats,
    failures: Failures,
    next_hash: u32,
    next_member: u64,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        let mut host = Self {
            objects: SlotMap::with_key(),
            refs: SlotMap::with_key(),
            classes: BTreeMap::new(),
            interned: HashMap::new(),
            utf8_views: HashMap::new(),
            pending: None,
            outstanding_pins: HashMap::new(),
            monitor_log: vec![],
            stats: HostStats::default(),
            failures: Failures::default(),
            next_hash: 0x1234_5678,
            next_member: 0,
        };
        let b = |c: BuiltinClass| c.name();
        let hierarchy: [(&str, Option<&str>); 22] = [
            (b(BuiltinClass::Object), None),
            (b(BuiltinClass::String), Some(b(BuiltinClass::Object))),
            (b(BuiltinClass::Throwable), Some(b(BuiltinClass::Object))),
            ("lang/Error", Some(b(BuiltinClass::Throwable))),
            ("lang/Exception", Some(b(BuiltinClass::Throwable))),
            ("lang/RuntimeException", Some("lang/Exception")),
            ("lang/LinkageError", Some("lang/Error")),
            (b(BuiltinClass::UnknownError), Some("lang/Error")),
            (b(BuiltinClass::InternalError), Some("lang/Error")),
            (b(BuiltinClass::OutOfMemoryError), Some("lang/Error")),
            (b(BuiltinClass::NoClassDefFoundError), Some("lang/LinkageError")),
            (b(BuiltinClass::ClassFormatError), Some("lang/LinkageError")),
            (b(BuiltinClass::ClassCircularityError), Some("lang/LinkageError")),
            (b(BuiltinClass::ExceptionInInitializerError), Some("lang/LinkageError")),
            (b(BuiltinClass::NoSuchFieldError), Some("lang/LinkageError")),
            (b(BuiltinClass::NoSuchMethodError), Some("lang/LinkageError")),
            (b(BuiltinClass::NullPointerException), Some("lang/RuntimeException")),
            (b(BuiltinClass::ArrayIndexOutOfBoundsException), Some("lang/RuntimeException")),
            (b(BuiltinClass::NegativeArraySizeException), Some("lang/RuntimeException")),
            (b(BuiltinClass::ArithmeticException), Some("lang/RuntimeException")),
            (b(BuiltinClass::ClassCastException), Some("lang/RuntimeException")),
            ("lang/IllegalMonitorStateException", Some("lang/RuntimeException")),
        ];
        for (name, superclass) in hierarchy {
            host.define_class(name, superclass);
        }
        for method in BuiltinMethod::ALL {
            host.define_method(
                method.class().name(),
                method.name(),
                method.signature(),
                method.is_static(),
            );
        }
        host
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    pub fn monitor_log(&self) -> &[(MonitorOp, ObjectKey)] {
        &self.monitor_log
    }

    /// Number of pins (of either kind) not yet released.
    pub fn outstanding_pins(&self) -> usize {
        self.outstanding_pins.values().sum()
    }

    pub fn outstanding_utf8_views(&self) -> usize {
        self.utf8_views.len()
    }

    pub fn live_local_refs(&self) -> usize {
        self.refs
            .values()
            .filter(|r| r.kind == RefKind::Local)
            .count()
    }

    pub fn live_global_refs(&self) -> usize {
        self.refs
            .values()
            .filter(|r| r.kind != RefKind::Local)
            .count()
    }

    pub fn is_live(&self, h: Handle) -> bool {
        self.reference(h).is_some()
    }

    pub fn ref_kind(&self, h: Handle) -> Option<RefKind> {
        self.reference(h).map(|r| r.kind)
    }

    pub fn object_key(&self, h: Handle) -> Option<ObjectKey> {
        self.reference(h).map(|r| r.object)
    }

    pub fn monitor_depth(&self, h: Handle) -> u32 {
        self.object_of(h).map_or(0, |o| o.monitor_depth)
    }

    // failure injection

    pub fn fail_next_pin(&mut self) {
        self.failures.next_pin = true;
    }
    pub fn fail_allocations(&mut self, fail: bool) {
        self.failures.allocations = fail;
    }
    pub fn fail_throw_new(&mut self, fail: bool) {
        self.failures.throw_new = fail;
    }
    pub fn fail_monitor_exit(&mut self, fail: bool) {
        self.failures.monitor_exit = fail;
    }
    /// Makes [`Host::find_class`] fail for `name`, leaving an instance of
    /// `cause` pending.
    pub fn fail_class(&mut self, name: &str, cause: BuiltinClass) {
        self.failures.classes.insert(name.to_string(), cause);
    }
    pub fn set_identity_hash(&mut self, h: Handle, hash: i32) {
        if let Some(obj) = self.object_of_mut(h) {
            obj.hash = hash;
        }
    }

    // object model setup

    pub fn define_class(&mut self, name: &str, superclass: Option<&str>) -> ObjectKey {
        let superclass = superclass.and_then(|s| self.classes.get(s).copied());
        let key = self.alloc(
            None,
            Payload::Class {
                name: name.to_string(),
                superclass,
                members: vec![],
            },
        );
        self.classes.insert(name.to_string(), key);
        key
    }

    pub fn define_field(&mut self, class: &str, name: &str, signature: &str, is_static: bool) {
        self.define_member(class, name, signature, is_static, false);
    }

    pub fn define_method(&mut self, class: &str, name: &str, signature: &str, is_static: bool) {
        self.define_member(class, name, signature, is_static, true);
    }

    fn define_member(
        &mut self,
        class: &str,
        name: &str,
        signature: &str,
        is_static: bool,
        is_method: bool,
    ) {
        self.next_member += 1;
        let Some(id) = NonZeroU64::new(self.next_member).map(MemberId) else {
            return;
        };
        let Some(&key) = self.classes.get(class) else {
            log::warn!("define_member: unknown class {class}");
            return;
        };
        if let Some(Object {
            payload: Payload::Class { members, .. },
            ..
        }) = self.objects.get_mut(key)
        {
            members.push(Member {
                name: name.to_string(),
                signature: signature.to_string(),
                is_static,
                is_method,
                id,
            });
        }
    }

    /// New local reference to the class named `name`, without failure
    /// injection or pending exceptions.
    pub fn class_by_name(&mut self, name: &str) -> Option<Handle> {
        let key = self.classes.get(name).copied()?;
        Some(self.new_ref(key, RefKind::Local))
    }

    pub fn class_name_of(&self, h: Handle) -> Option<String> {
        let class = self.object_of(h)?.class?;
        match &self.objects.get(class)?.payload {
            Payload::Class { name, .. } => Some(name.clone()),
            _ => None,
        }
    }

    pub fn new_string(&mut self, s: &str) -> Handle {
        let key = self.alloc_string(s);
        self.new_ref(key, RefKind::Local)
    }

    pub fn string_value(&self, h: Handle) -> Option<String> {
        match &self.object_of(h)?.payload {
            Payload::Str { utf16 } => Some(String::from_utf16_lossy(utf16)),
            _ => None,
        }
    }

    pub fn new_array_from<E: PrimitiveElement>(&mut self, values: &[E::Managed]) -> Handle {
        let key = self.alloc_primitive(E::TYPE, values.len());
        if let Some(Object {
            payload: Payload::Primitive { words, .. },
            ..
        }) = self.objects.get_mut(key)
        {
            let dst = words.as_mut_ptr().cast::<E::Managed>();
            for (i, v) in values.iter().enumerate() {
                // SAFETY: the buffer was sized for `values.len()` elements.
                unsafe { dst.add(i).write(*v) };
            }
        }
        self.new_ref(key, RefKind::Local)
    }

    pub fn array_elements<E: PrimitiveElement>(&self, h: Handle) -> Vec<E::Managed> {
        match self.object_of(h).map(|o| &o.payload) {
            Some(Payload::Primitive { ty, len, words }) if *ty == E::TYPE => {
                let src = words.as_ptr().cast::<E::Managed>();
                // SAFETY: `words` holds `len` elements of this type.
                (0..*len).map(|i| unsafe { src.add(i).read() }).collect()
            }
            _ => vec![],
        }
    }

    pub fn object_array_element(&mut self, array: Handle, index: usize) -> Option<Handle> {
        let key = match &self.object_of(array)?.payload {
            Payload::Objects(elems) => (*elems.get(index)?)?,
            _ => return None,
        };
        Some(self.new_ref(key, RefKind::Local))
    }

    pub fn element_type_of(&self, array: Handle) -> Option<ElementType> {
        match self.object_of(array)?.payload {
            Payload::Primitive { ty, .. } => Some(ty),
            _ => None,
        }
    }

    // internals

    fn handle_for(key: RefKey) -> Handle {
        Handle::from_raw(key.data().as_ffi()).expect("occupied slot map keys are never zero")
    }

    fn reference(&self, h: Handle) -> Option<&Reference> {
        self.refs.get(RefKey::from(KeyData::from_ffi(h.as_raw())))
    }

    fn object_of(&self, h: Handle) -> Option<&Object> {
        let r = self.reference(h)?;
        self.objects.get(r.object)
    }

    fn object_of_mut(&mut self, h: Handle) -> Option<&mut Object> {
        let r = *self.reference(h)?;
        self.objects.get_mut(r.object)
    }

    fn new_ref(&mut self, object: ObjectKey, kind: RefKind) -> Handle {
        Self::handle_for(self.refs.insert(Reference { object, kind }))
    }

    fn alloc(&mut self, class: Option<ObjectKey>, payload: Payload) -> ObjectKey {
        self.next_hash = self
            .next_hash
            .wrapping_mul(1_103_515_245)
            .wrapping_add(12_345);
        self.objects.insert(Object {
            class,
            payload,
            hash: (self.next_hash >> 1) as i32,
            monitor_depth: 0,
        })
    }

    fn alloc_string(&mut self, s: &str) -> ObjectKey {
        let class = self.classes.get(BuiltinClass::String.name()).copied();
        self.alloc(
            class,
            Payload::Str {
                utf16: s.encode_utf16().collect(),
            },
        )
    }

    fn alloc_primitive(&mut self, ty: ElementType, len: usize) -> ObjectKey {
        let words = vec![0u64; (len * ty.size()).div_ceil(8)];
        self.alloc(None, Payload::Primitive { ty, len, words })
    }

    fn is_subclass(&self, mut class: ObjectKey, ancestor: ObjectKey) -> bool {
        loop {
            if class == ancestor {
                return true;
            }
            match self.objects.get(class).map(|o| &o.payload) {
                Some(Payload::Class {
                    superclass: Some(s),
                    ..
                }) => class = *s,
                _ => return false,
            }
        }
    }

    fn find_member(
        &self,
        class: Handle,
        name: &str,
        signature: &str,
        is_static: bool,
        is_method: bool,
    ) -> Option<MemberId> {
        let mut class = self.reference(class)?.object;
        loop {
            let Payload::Class {
                members,
                superclass,
                ..
            } = &self.objects.get(class)?.payload
            else {
                return None;
            };
            let found = members.iter().find(|m| {
                m.name == name
                    && m.signature == signature
                    && m.is_static == is_static
                    && m.is_method == is_method
            });
            if let Some(m) = found {
                return Some(m.id);
            }
            class = (*superclass)?;
        }
    }

    fn raise(&mut self, class: &str, message: &str) {
        let class = self.classes.get(class).copied();
        let key = self.alloc(
            class,
            Payload::Throwable {
                message: Some(message.to_string()),
            },
        );
        self.pending = Some(key);
    }
}

/// Encodes UTF-16 code units one by one, with NUL as two bytes.
fn modified_utf8(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len() + 1);
    for &u in units {
        match u {
            0 => out.extend_from_slice(&[0xc0, 0x80]),
            0x01..=0x7f => out.push(u as u8),
            0x80..=0x7ff => {
                out.push(0xc0 | (u >> 6) as u8);
                out.push(0x80 | (u & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (u >> 12) as u8);
                out.push(0x80 | ((u >> 6) & 0x3f) as u8);
                out.push(0x80 | (u & 0x3f) as u8);
            }
        }
    }
    out
}

impl Host for MemoryHost {
    fn find_class(&mut self, name: &str) -> Option<Handle> {
        if let Some(cause) = self.failures.classes.get(name).copied() {
            self.raise(cause.name(), name);
            return None;
        }
        match self.classes.get(name).copied() {
            Some(key) => Some(self.new_ref(key, RefKind::Local)),
            None => {
                self.raise(BuiltinClass::NoClassDefFoundError.name(), name);
                None
            }
        }
    }

    fn field_id(
        &mut self,
        class: Handle,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> Option<MemberId> {
        let id = self.find_member(class, name, signature, is_static, false);
        if id.is_none() {
            self.raise(BuiltinClass::NoSuchFieldError.name(), name);
        }
        id
    }

    fn method_id(
        &mut self,
        class: Handle,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> Option<MemberId> {
        let id = self.find_member(class, name, signature, is_static, true);
        if id.is_none() {
            self.raise(BuiltinClass::NoSuchMethodError.name(), name);
        }
        id
    }

    fn intern_string(&mut self, utf8: &str) -> Option<Handle> {
        let key = match self.interned.get(utf8) {
            Some(&key) => key,
            None => {
                if self.failures.allocations {
                    self.raise(BuiltinClass::OutOfMemoryError.name(), "intern");
                    return None;
                }
                let key = self.alloc_string(utf8);
                self.interned.insert(utf8.to_string(), key);
                key
            }
        };
        Some(self.new_ref(key, RefKind::Local))
    }

    fn new_string_utf(&mut self, utf8: &str) -> Option<Handle> {
        if self.failures.allocations {
            self.raise(BuiltinClass::OutOfMemoryError.name(), "string");
            return None;
        }
        Some(self.new_string(utf8))
    }

    fn new_object(
        &mut self,
        class: Handle,
        _constructor: MemberId,
        args: &[Option<Handle>],
    ) -> Option<Handle> {
        let class = self.reference(class)?.object;
        let throwable = self.classes.get(BuiltinClass::Throwable.name()).copied();
        let payload = if throwable.is_some_and(|t| self.is_subclass(class, t)) {
            let message = args
                .first()
                .copied()
                .flatten()
                .and_then(|m| self.string_value(m));
            Payload::Throwable { message }
        } else {
            Payload::Plain
        };
        let key = self.alloc(Some(class), payload);
        Some(self.new_ref(key, RefKind::Local))
    }

    fn new_local_ref(&mut self, obj: Handle) -> Option<Handle> {
        let object = self.reference(obj)?.object;
        Some(self.new_ref(object, RefKind::Local))
    }

    fn delete_local_ref(&mut self, obj: Handle) {
        let key = RefKey::from(KeyData::from_ffi(obj.as_raw()));
        match self.refs.get(key) {
            Some(r) if r.kind == RefKind::Local => {
                self.refs.remove(key);
                self.stats.local_refs_deleted += 1;
            }
            Some(r) => log::warn!("delete_local_ref: {obj:?} is a {:?} reference", r.kind),
            None => log::warn!("delete_local_ref: stale handle {obj:?}"),
        }
    }

    fn new_global_ref(&mut self, obj: Handle) -> Option<Handle> {
        let object = self.reference(obj)?.object;
        Some(self.new_ref(object, RefKind::Global))
    }

    fn new_weak_global_ref(&mut self, obj: Handle) -> Option<Handle> {
        let object = self.reference(obj)?.object;
        Some(self.new_ref(object, RefKind::WeakGlobal))
    }

    fn delete_global_ref(&mut self, obj: Handle) {
        let key = RefKey::from(KeyData::from_ffi(obj.as_raw()));
        if self.refs.get(key).is_some_and(|r| r.kind == RefKind::Global) {
            self.refs.remove(key);
        } else {
            log::warn!("delete_global_ref: {obj:?} is not a global reference");
        }
    }

    fn delete_weak_global_ref(&mut self, obj: Handle) {
        let key = RefKey::from(KeyData::from_ffi(obj.as_raw()));
        if self
            .refs
            .get(key)
            .is_some_and(|r| r.kind == RefKind::WeakGlobal)
        {
            self.refs.remove(key);
        } else {
            log::warn!("delete_weak_global_ref: {obj:?} is not a weak global reference");
        }
    }

    fn identity_hash(&mut self, obj: Handle) -> i32 {
        self.stats.identity_hashes += 1;
        self.object_of(obj).map_or(0, |o| o.hash)
    }

    fn is_same_object(&self, a: Handle, b: Handle) -> bool {
        match (self.reference(a), self.reference(b)) {
            (Some(a), Some(b)) => a.object == b.object,
            _ => false,
        }
    }

    fn is_instance_of(&self, obj: Handle, class: Handle) -> bool {
        let (Some(obj), Some(class)) = (self.object_of(obj), self.reference(class)) else {
            return false;
        };
        obj.class.is_some_and(|c| self.is_subclass(c, class.object))
    }

    fn class_of(&mut self, obj: Handle) -> Option<Handle> {
        let class = self.object_of(obj)?.class?;
        Some(self.new_ref(class, RefKind::Local))
    }

    fn throw(&mut self, exception: Handle) -> Result<(), HostFailure> {
        let object = self.reference(exception).ok_or(HostFailure)?.object;
        self.pending = Some(object);
        Ok(())
    }

    fn throw_new(&mut self, class: Handle, message: &str) -> Result<(), HostFailure> {
        if self.failures.throw_new {
            return Err(HostFailure);
        }
        let class = self.reference(class).ok_or(HostFailure)?.object;
        let key = self.alloc(
            Some(class),
            Payload::Throwable {
                message: Some(message.to_string()),
            },
        );
        self.pending = Some(key);
        Ok(())
    }

    fn exception_occurred(&mut self) -> Option<Handle> {
        let pending = self.pending?;
        Some(self.new_ref(pending, RefKind::Local))
    }

    fn exception_check(&self) -> bool {
        self.pending.is_some()
    }

    fn exception_clear(&mut self) {
        self.pending = None;
    }

    fn exception_message(&mut self, exception: Handle) -> Option<String> {
        match &self.object_of(exception)?.payload {
            Payload::Throwable { message } => message.clone(),
            _ => None,
        }
    }

    fn fatal_error(&mut self, message: &str) -> ! {
        panic!("fatal error: {message}")
    }

    fn array_length(&mut self, array: Handle) -> i32 {
        match self.object_of(array).map(|o| &o.payload) {
            Some(Payload::Primitive { len, .. }) => *len as i32,
            Some(Payload::Objects(elems)) => elems.len() as i32,
            _ => {
                log::warn!("array_length: {array:?} is not an array");
                0
            }
        }
    }

    fn pin_array(&mut self, array: Handle, ty: ElementType) -> Option<NonNull<u8>> {
        if std::mem::take(&mut self.failures.next_pin) {
            self.raise(BuiltinClass::OutOfMemoryError.name(), "pin");
            return None;
        }
        let key = self.reference(array)?.object;
        let ptr = match &mut self.objects.get_mut(key)?.payload {
            Payload::Primitive {
                ty: actual, words, ..
            } if *actual == ty => NonNull::new(words.as_mut_ptr().cast::<u8>())?,
            _ => {
                log::warn!("pin_array: {array:?} is not a {ty} array");
                return None;
            }
        };
        self.stats.pins += 1;
        *self.outstanding_pins.entry(key).or_default() += 1;
        Some(ptr)
    }

    fn unpin_array(&mut self, array: Handle, _ty: ElementType, _elements: NonNull<u8>) {
        let Some(key) = self.reference(array).map(|r| r.object) else {
            log::warn!("unpin_array: stale handle {array:?}");
            return;
        };
        self.stats.unpins += 1;
        if let Some(n) = self.outstanding_pins.get_mut(&key) {
            *n = n.saturating_sub(1);
        }
    }

    fn pin_critical(&mut self, array: Handle) -> Option<NonNull<u8>> {
        if std::mem::take(&mut self.failures.next_pin) {
            self.raise(BuiltinClass::OutOfMemoryError.name(), "pin");
            return None;
        }
        let key = self.reference(array)?.object;
        let ptr = match &mut self.objects.get_mut(key)?.payload {
            Payload::Primitive { words, .. } => NonNull::new(words.as_mut_ptr().cast::<u8>())?,
            _ => return None,
        };
        self.stats.critical_pins += 1;
        *self.outstanding_pins.entry(key).or_default() += 1;
        Some(ptr)
    }

    fn unpin_critical(&mut self, array: Handle, _elements: NonNull<u8>) {
        let Some(key) = self.reference(array).map(|r| r.object) else {
            log::warn!("unpin_critical: stale handle {array:?}");
            return;
        };
        self.stats.critical_unpins += 1;
        if let Some(n) = self.outstanding_pins.get_mut(&key) {
            *n = n.saturating_sub(1);
        }
    }

    fn new_primitive_array(&mut self, ty: ElementType, length: i32) -> Option<Handle> {
        if length < 0 {
            self.raise(
                BuiltinClass::NegativeArraySizeException.name(),
                &length.to_string(),
            );
            return None;
        }
        if self.failures.allocations {
            self.raise(BuiltinClass::OutOfMemoryError.name(), "array");
            return None;
        }
        let key = self.alloc_primitive(ty, length as usize);
        Some(self.new_ref(key, RefKind::Local))
    }

    fn new_object_array(&mut self, length: i32, element_class: Handle) -> Option<Handle> {
        if length < 0 {
            self.raise(
                BuiltinClass::NegativeArraySizeException.name(),
                &length.to_string(),
            );
            return None;
        }
        if self.failures.allocations {
            self.raise(BuiltinClass::OutOfMemoryError.name(), "array");
            return None;
        }
        self.reference(element_class)?;
        let key = self.alloc(None, Payload::Objects(vec![None; length as usize]));
        Some(self.new_ref(key, RefKind::Local))
    }

    fn set_object_array_element(
        &mut self,
        array: Handle,
        index: i32,
        value: Option<Handle>,
    ) -> Result<(), HostFailure> {
        let value = value.and_then(|v| self.reference(v).map(|r| r.object));
        let in_bounds = match self.object_of_mut(array).map(|o| &mut o.payload) {
            Some(Payload::Objects(elems)) => match usize::try_from(index)
                .ok()
                .and_then(|i| elems.get_mut(i))
            {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => return Err(HostFailure),
        };
        if in_bounds {
            Ok(())
        } else {
            self.raise(
                BuiltinClass::ArrayIndexOutOfBoundsException.name(),
                &index.to_string(),
            );
            Err(HostFailure)
        }
    }

    fn string_utf16(&mut self, s: Handle) -> Option<RawChars<u16>> {
        let chars = match &mut self.object_of_mut(s)?.payload {
            Payload::Str { utf16 } => RawChars {
                ptr: NonNull::new(utf16.as_mut_ptr())?,
                len: utf16.len(),
            },
            _ => return None,
        };
        self.stats.utf16_views += 1;
        Some(chars)
    }

    fn release_string_utf16(&mut self, _s: Handle, _chars: NonNull<u16>) {
        self.stats.utf16_releases += 1;
    }

    fn string_utf8(&mut self, s: Handle) -> Option<RawChars<u8>> {
        let mut bytes = match &self.object_of(s)?.payload {
            Payload::Str { utf16 } => modified_utf8(utf16),
            _ => return None,
        };
        let len = bytes.len();
        bytes.push(0);
        let mut bytes = bytes.into_boxed_slice();
        let ptr = NonNull::new(bytes.as_mut_ptr())?;
        self.utf8_views.insert(ptr.as_ptr() as usize, bytes);
        self.stats.utf8_views += 1;
        Some(RawChars { ptr, len })
    }

    fn release_string_utf8(&mut self, _s: Handle, chars: NonNull<u8>) {
        if self.utf8_views.remove(&(chars.as_ptr() as usize)).is_none() {
            log::warn!("release_string_utf8: unknown buffer {chars:?}");
        }
        self.stats.utf8_releases += 1;
    }

    fn monitor_enter(&mut self, obj: Handle) -> Result<(), HostFailure> {
        let key = self.reference(obj).ok_or(HostFailure)?.object;
        let o = self.objects.get_mut(key).ok_or(HostFailure)?;
        o.monitor_depth += 1;
        self.monitor_log.push((MonitorOp::Enter, key));
        Ok(())
    }

    fn monitor_exit(&mut self, obj: Handle) -> Result<(), HostFailure> {
        let key = self.reference(obj).ok_or(HostFailure)?.object;
        let depth = self.objects.get(key).map_or(0, |o| o.monitor_depth);
        if self.failures.monitor_exit || depth == 0 {
            self.raise("lang/IllegalMonitorStateException", "monitor not held");
            return Err(HostFailure);
        }
        if let Some(o) = self.objects.get_mut(key) {
            o.monitor_depth -= 1;
        }
        self.monitor_log.push((MonitorOp::Exit, key));
        Ok(())
    }
}

impl HostContext for MemoryHost {
    type Host = MemoryHost;
    fn host_mut(&mut self) -> &mut MemoryHost {
        self
    }
}
