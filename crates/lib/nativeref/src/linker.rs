//! Symbolic references to classes, members and string literals.
//!
//! Native code declares what it needs up front and receives small indices.
//! Each declaration is resolved through the host the first time it is used
//! (or earlier, depending on [`LinkMode`]) and the result is kept for the
//! life of the runtime. When resolution fails the host's pending exception is
//! inspected to tell the caller why.

use thiserror::Error;

use crate::{
    host::{Handle, Host, MemberId},
    interner::{Symbol, ToSymbol},
    utils::error::NativeError,
};

/// When declared symbols are resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkMode {
    /// On first use.
    #[default]
    Lazy,
    /// Classes at link time, members and strings on first use.
    Medium,
    /// Everything at link time.
    Eager,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassIdx(usize);
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldIdx(usize);
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MethodIdx(usize);
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StringIdx(usize);

/// Classes the runtime itself raises or links against. They occupy the first
/// class indices of every [`Linker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinClass {
    Object,
    Throwable,
    UnknownError,
    InternalError,
    OutOfMemoryError,
    NoClassDefFoundError,
    ClassFormatError,
    ClassCircularityError,
    ExceptionInInitializerError,
    NoSuchFieldError,
    NoSuchMethodError,
    NullPointerException,
    ArrayIndexOutOfBoundsException,
    NegativeArraySizeException,
    ArithmeticException,
    ClassCastException,
    String,
}

impl BuiltinClass {
    pub const ALL: [BuiltinClass; 17] = [
        BuiltinClass::Object,
        BuiltinClass::Throwable,
        BuiltinClass::UnknownError,
        BuiltinClass::InternalError,
        BuiltinClass::OutOfMemoryError,
        BuiltinClass::NoClassDefFoundError,
        BuiltinClass::ClassFormatError,
        BuiltinClass::ClassCircularityError,
        BuiltinClass::ExceptionInInitializerError,
        BuiltinClass::NoSuchFieldError,
        BuiltinClass::NoSuchMethodError,
        BuiltinClass::NullPointerException,
        BuiltinClass::ArrayIndexOutOfBoundsException,
        BuiltinClass::NegativeArraySizeException,
        BuiltinClass::ArithmeticException,
        BuiltinClass::ClassCastException,
        BuiltinClass::String,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinClass::Object => "lang/Object",
            BuiltinClass::Throwable => "lang/Throwable",
            BuiltinClass::UnknownError => "lang/UnknownError",
            BuiltinClass::InternalError => "lang/InternalError",
            BuiltinClass::OutOfMemoryError => "lang/OutOfMemoryError",
            BuiltinClass::NoClassDefFoundError => "lang/NoClassDefFoundError",
            BuiltinClass::ClassFormatError => "lang/ClassFormatError",
            BuiltinClass::ClassCircularityError => "lang/ClassCircularityError",
            BuiltinClass::ExceptionInInitializerError => "lang/ExceptionInInitializerError",
            BuiltinClass::NoSuchFieldError => "lang/NoSuchFieldError",
            BuiltinClass::NoSuchMethodError => "lang/NoSuchMethodError",
            BuiltinClass::NullPointerException => "lang/NullPointerException",
            BuiltinClass::ArrayIndexOutOfBoundsException => "lang/ArrayIndexOutOfBoundsException",
            BuiltinClass::NegativeArraySizeException => "lang/NegativeArraySizeException",
            BuiltinClass::ArithmeticException => "lang/ArithmeticException",
            BuiltinClass::ClassCastException => "lang/ClassCastException",
            BuiltinClass::String => "lang/String",
        }
    }

    pub fn index(self) -> ClassIdx {
        ClassIdx(self as usize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinMethod {
    ObjectHashCode,
    ThrowableGetMessage,
    OutOfMemoryInit,
    NullPointerInit,
    StringIntern,
}

impl BuiltinMethod {
    pub const ALL: [BuiltinMethod; 5] = [
        BuiltinMethod::ObjectHashCode,
        BuiltinMethod::ThrowableGetMessage,
        BuiltinMethod::OutOfMemoryInit,
        BuiltinMethod::NullPointerInit,
        BuiltinMethod::StringIntern,
    ];

    pub fn class(self) -> BuiltinClass {
        match self {
            BuiltinMethod::ObjectHashCode => BuiltinClass::Object,
            BuiltinMethod::ThrowableGetMessage => BuiltinClass::Throwable,
            BuiltinMethod::OutOfMemoryInit => BuiltinClass::OutOfMemoryError,
            BuiltinMethod::NullPointerInit => BuiltinClass::NullPointerException,
            BuiltinMethod::StringIntern => BuiltinClass::String,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltinMethod::ObjectHashCode => "hashCode",
            BuiltinMethod::ThrowableGetMessage => "getMessage",
            BuiltinMethod::OutOfMemoryInit | BuiltinMethod::NullPointerInit => "<init>",
            BuiltinMethod::StringIntern => "intern",
        }
    }

    pub fn signature(self) -> &'static str {
        match self {
            BuiltinMethod::ObjectHashCode => "()I",
            BuiltinMethod::ThrowableGetMessage | BuiltinMethod::StringIntern => {
                "()Llang/String;"
            }
            BuiltinMethod::OutOfMemoryInit | BuiltinMethod::NullPointerInit => {
                "(Llang/String;)V"
            }
        }
    }

    pub fn is_static(self) -> bool {
        false
    }

    pub fn index(self) -> MethodIdx {
        MethodIdx(self as usize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassFailure {
    Format,
    Circularity,
    NotFound,
    OutOfMemory,
    Unknown,
}

impl ClassFailure {
    pub fn description(self) -> &'static str {
        match self {
            ClassFailure::Format => "has not been recognized by the VM as a valid class",
            ClassFailure::Circularity => "is its own superclass",
            ClassFailure::NotFound => "cannot be found by the VM",
            ClassFailure::OutOfMemory => "cannot be loaded as the VM ran out of memory",
            ClassFailure::Unknown => "can't be loaded - unknown error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberFailure {
    NotFound,
    Initializer,
    OutOfMemory,
    Unknown,
}

impl MemberFailure {
    pub fn description(self, is_method: bool) -> &'static str {
        match (self, is_method) {
            (MemberFailure::NotFound, false) => "field can't be found",
            (MemberFailure::NotFound, true) => "method can't be found",
            (MemberFailure::Initializer, _) => {
                "exception occurred during initialization of the class"
            }
            (MemberFailure::OutOfMemory, _) => "out of memory",
            (MemberFailure::Unknown, _) => "unknown error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkageError {
    #[error("class {name} {}", .reason.description())]
    Class { name: String, reason: ClassFailure },
    #[error("unable to make global reference to class {name}")]
    GlobalRef { name: String },
    #[error("cannot link field {name} ({signature}) in class {class}: {}", .reason.description(false))]
    Field {
        class: String,
        name: String,
        signature: String,
        reason: MemberFailure,
    },
    #[error("cannot link method {name}{signature} in class {class}: {}", .reason.description(true))]
    Method {
        class: String,
        name: String,
        signature: String,
        reason: MemberFailure,
    },
    #[error("cannot link string literal \"{literal}\"")]
    String { literal: String },
}

#[derive(Debug)]
struct ClassEntry {
    name: Symbol,
    weak: bool,
    id: Option<Handle>,
}

#[derive(Debug)]
struct MemberEntry {
    class: ClassIdx,
    name: Symbol,
    signature: Symbol,
    is_static: bool,
    id: Option<MemberId>,
}

#[derive(Debug)]
struct StringEntry {
    text: Symbol,
    id: Option<Handle>,
}

#[derive(Debug)]
pub struct Linker {
    classes: Vec<ClassEntry>,
    fields: Vec<MemberEntry>,
    methods: Vec<MemberEntry>,
    strings: Vec<StringEntry>,
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

impl Linker {
    /// A linker with the built-in classes and methods declared.
    pub fn new() -> Self {
        let mut linker = Self {
            classes: vec![],
            fields: vec![],
            methods: vec![],
            strings: vec![],
        };
        for class in BuiltinClass::ALL {
            linker.declare_class(class.name(), false);
        }
        for method in BuiltinMethod::ALL {
            linker.declare_method(
                method.class().index(),
                method.name(),
                method.signature(),
                method.is_static(),
            );
        }
        linker
    }

    /// Declares a class. Declaring the same name twice yields the same index.
    pub fn declare_class(&mut self, name: &str, weak: bool) -> ClassIdx {
        let name = name.to_symbol();
        if let Some(i) = self
            .classes
            .iter()
            .position(|c| c.name == name && c.weak == weak)
        {
            return ClassIdx(i);
        }
        self.classes.push(ClassEntry {
            name,
            weak,
            id: None,
        });
        ClassIdx(self.classes.len() - 1)
    }

    pub fn declare_field(
        &mut self,
        class: ClassIdx,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> FieldIdx {
        self.fields
            .push(MemberEntry::new(class, name, signature, is_static));
        FieldIdx(self.fields.len() - 1)
    }

    pub fn declare_method(
        &mut self,
        class: ClassIdx,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> MethodIdx {
        self.methods
            .push(MemberEntry::new(class, name, signature, is_static));
        MethodIdx(self.methods.len() - 1)
    }

    pub fn declare_string(&mut self, text: &str) -> StringIdx {
        self.strings.push(StringEntry {
            text: text.to_symbol(),
            id: None,
        });
        StringIdx(self.strings.len() - 1)
    }

    pub fn class_name(&self, idx: ClassIdx) -> String {
        self.classes[idx.0].name.to_string()
    }

    /// The class, if it has been resolved already.
    pub fn loaded(&self, idx: ClassIdx) -> Option<Handle> {
        self.classes.get(idx.0).and_then(|c| c.id)
    }

    pub fn builtin(&self, class: BuiltinClass) -> Option<Handle> {
        self.loaded(class.index())
    }

    #[track_caller]
    pub fn class<H: Host>(&mut self, host: &mut H, idx: ClassIdx) -> Result<Handle, NativeError> {
        let entry = &self.classes[idx.0];
        if let Some(id) = entry.id {
            return Ok(id);
        }
        let (name, weak) = (entry.name.to_string(), entry.weak);
        let Some(local) = host.find_class(&name) else {
            let reason = self.classify_class_failure(host);
            log::debug!("class {name} failed to link: {reason:?}");
            return Err(NativeError::new(
                LinkageError::Class { name, reason }.into(),
            ));
        };
        let global = if weak {
            host.new_weak_global_ref(local)
        } else {
            host.new_global_ref(local)
        };
        host.delete_local_ref(local);
        let Some(global) = global else {
            return Err(NativeError::new(LinkageError::GlobalRef { name }.into()));
        };
        log::debug!("linked class {name}");
        self.classes[idx.0].id = Some(global);
        Ok(global)
    }

    #[track_caller]
    pub fn field<H: Host>(&mut self, host: &mut H, idx: FieldIdx) -> Result<MemberId, NativeError> {
        if let Some(id) = self.fields[idx.0].id {
            return Ok(id);
        }
        let class_idx = self.fields[idx.0].class;
        let class = self.class(host, class_idx)?;
        let entry = &self.fields[idx.0];
        let (name, signature) = (entry.name.to_string(), entry.signature.to_string());
        match host.field_id(class, &name, &signature, entry.is_static) {
            Some(id) => {
                self.fields[idx.0].id = Some(id);
                Ok(id)
            }
            None => {
                let reason = self.classify_member_failure(host);
                Err(NativeError::new(
                    LinkageError::Field {
                        class: self.class_name(class_idx),
                        name,
                        signature,
                        reason,
                    }
                    .into(),
                ))
            }
        }
    }

    #[track_caller]
    pub fn method<H: Host>(
        &mut self,
        host: &mut H,
        idx: MethodIdx,
    ) -> Result<MemberId, NativeError> {
        if let Some(id) = self.methods[idx.0].id {
            return Ok(id);
        }
        let class_idx = self.methods[idx.0].class;
        let class = self.class(host, class_idx)?;
        let entry = &self.methods[idx.0];
        let (name, signature) = (entry.name.to_string(), entry.signature.to_string());
        match host.method_id(class, &name, &signature, entry.is_static) {
            Some(id) => {
                self.methods[idx.0].id = Some(id);
                Ok(id)
            }
            None => {
                let reason = self.classify_member_failure(host);
                Err(NativeError::new(
                    LinkageError::Method {
                        class: self.class_name(class_idx),
                        name,
                        signature,
                        reason,
                    }
                    .into(),
                ))
            }
        }
    }

    /// Global reference to the canonical string object for a literal.
    #[track_caller]
    pub fn string<H: Host>(&mut self, host: &mut H, idx: StringIdx) -> Result<Handle, NativeError> {
        let entry = &self.strings[idx.0];
        if let Some(id) = entry.id {
            return Ok(id);
        }
        let literal = entry.text.to_string();
        let global = host.intern_string(&literal).and_then(|local| {
            let global = host.new_global_ref(local);
            host.delete_local_ref(local);
            global
        });
        match global {
            Some(id) => {
                self.strings[idx.0].id = Some(id);
                Ok(id)
            }
            None => Err(NativeError::new(LinkageError::String { literal }.into())),
        }
    }

    /// Resolves the built-in table.
    #[track_caller]
    pub fn link_builtins<H: Host>(&mut self, host: &mut H) -> Result<(), NativeError> {
        for class in BuiltinClass::ALL {
            self.class(host, class.index())?;
        }
        for method in BuiltinMethod::ALL {
            self.method(host, method.index())?;
        }
        Ok(())
    }

    /// Resolves declarations ahead of use, as far as `mode` asks for.
    #[track_caller]
    pub fn link<H: Host>(&mut self, host: &mut H, mode: LinkMode) -> Result<(), NativeError> {
        if mode == LinkMode::Lazy {
            return Ok(());
        }
        for i in 0..self.classes.len() {
            self.class(host, ClassIdx(i))?;
        }
        if mode == LinkMode::Eager {
            for i in 0..self.fields.len() {
                self.field(host, FieldIdx(i))?;
            }
            for i in 0..self.methods.len() {
                self.method(host, MethodIdx(i))?;
            }
            for i in 0..self.strings.len() {
                self.string(host, StringIdx(i))?;
            }
        }
        Ok(())
    }

    /// Drops every resolved reference; declarations stay.
    pub fn unlink<H: Host>(&mut self, host: &mut H) {
        for class in &mut self.classes {
            match (class.id.take(), class.weak) {
                (Some(id), true) => host.delete_weak_global_ref(id),
                (Some(id), false) => host.delete_global_ref(id),
                (None, _) => {}
            }
        }
        for s in &mut self.strings {
            if let Some(id) = s.id.take() {
                host.delete_global_ref(id);
            }
        }
        self.fields
            .iter_mut()
            .chain(self.methods.iter_mut())
            .for_each(|m| m.id = None);
    }

    fn cause_is<H: Host>(&self, host: &H, cause: Handle, class: BuiltinClass) -> bool {
        self.builtin(class)
            .is_some_and(|c| host.is_instance_of(cause, c))
    }

    fn classify_class_failure<H: Host>(&self, host: &mut H) -> ClassFailure {
        let Some(cause) = host.exception_occurred() else {
            return ClassFailure::Unknown;
        };
        let reason = [
            (BuiltinClass::ClassFormatError, ClassFailure::Format),
            (BuiltinClass::ClassCircularityError, ClassFailure::Circularity),
            (BuiltinClass::NoClassDefFoundError, ClassFailure::NotFound),
            (BuiltinClass::OutOfMemoryError, ClassFailure::OutOfMemory),
        ]
        .into_iter()
        .find(|(class, _)| self.cause_is(host, cause, *class))
        .map_or(ClassFailure::Unknown, |(_, reason)| reason);
        host.delete_local_ref(cause);
        reason
    }

    fn classify_member_failure<H: Host>(&self, host: &mut H) -> MemberFailure {
        let Some(cause) = host.exception_occurred() else {
            return MemberFailure::Unknown;
        };
        let reason = [
            (BuiltinClass::NoSuchFieldError, MemberFailure::NotFound),
            (BuiltinClass::NoSuchMethodError, MemberFailure::NotFound),
            (BuiltinClass::ExceptionInInitializerError, MemberFailure::Initializer),
            (BuiltinClass::OutOfMemoryError, MemberFailure::OutOfMemory),
        ]
        .into_iter()
        .find(|(class, _)| self.cause_is(host, cause, *class))
        .map_or(MemberFailure::Unknown, |(_, reason)| reason);
        host.delete_local_ref(cause);
        reason
    }
}

impl MemberEntry {
    fn new(class: ClassIdx, name: &str, signature: &str, is_static: bool) -> Self {
        Self {
            class,
            name: name.to_symbol(),
            signature: signature.to_symbol(),
            is_static,
            id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{MemoryHost, RefKind};

    fn linked() -> (MemoryHost, Linker) {
        let mut host = MemoryHost::new();
        let mut linker = Linker::new();
        linker.link_builtins(&mut host).unwrap();
        (host, linker)
    }

    #[test]
    fn builtins_resolve() {
        let (host, linker) = linked();
        for class in BuiltinClass::ALL {
            let h = linker.builtin(class).unwrap();
            assert_eq!(host.ref_kind(h), Some(RefKind::Global));
        }
        assert_eq!(linker.class_name(BuiltinClass::String.index()), "lang/String");
    }

    #[test]
    fn class_failures_are_classified() {
        let cases = [
            (BuiltinClass::ClassFormatError, "has not been recognized by the VM as a valid class"),
            (BuiltinClass::ClassCircularityError, "is its own superclass"),
            (BuiltinClass::NoClassDefFoundError, "cannot be found by the VM"),
            (BuiltinClass::OutOfMemoryError, "cannot be loaded as the VM ran out of memory"),
            (BuiltinClass::InternalError, "can't be loaded - unknown error"),
        ];
        for (cause, text) in cases {
            let (mut host, mut linker) = linked();
            host.fail_class("app/Broken", cause);
            let idx = linker.declare_class("app/Broken", false);
            let err = linker.class(&mut host, idx).unwrap_err();
            assert_eq!(err.to_string(), format!("class app/Broken {text}"));
            // the cause stays pending for the raise that follows
            assert!(host.exception_check());
        }
    }

    #[test]
    fn member_failures_are_classified() {
        let (mut host, mut linker) = linked();
        host.define_class("app/Point", Some("lang/Object"));
        host.define_field("app/Point", "x", "I", false);
        let point = linker.declare_class("app/Point", true);
        let x = linker.declare_field(point, "x", "I", false);
        let y = linker.declare_field(point, "y", "I", false);
        let m = linker.declare_method(point, "norm", "()D", false);
        assert!(linker.field(&mut host, x).is_ok());
        assert_eq!(
            host.ref_kind(linker.loaded(point).unwrap()),
            Some(RefKind::WeakGlobal)
        );
        let err = linker.field(&mut host, y).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot link field y (I) in class app/Point: field can't be found"
        );
        host.exception_clear();
        let err = linker.method(&mut host, m).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot link method norm()D in class app/Point: method can't be found"
        );
    }

    #[test]
    fn link_modes() {
        let (mut host, mut linker) = linked();
        host.define_class("app/A", Some("lang/Object"));
        let a = linker.declare_class("app/A", false);
        let s = linker.declare_string("hello");
        linker.link(&mut host, LinkMode::Lazy).unwrap();
        assert_eq!(linker.loaded(a), None);
        linker.link(&mut host, LinkMode::Medium).unwrap();
        assert!(linker.loaded(a).is_some());
        assert_eq!(linker.strings[s.0].id, None);
        linker.link(&mut host, LinkMode::Eager).unwrap();
        let h = linker.string(&mut host, s).unwrap();
        assert_eq!(host.string_value(h).as_deref(), Some("hello"));
    }

    #[test]
    fn unlink_releases_globals() {
        let (mut host, mut linker) = linked();
        let s = linker.declare_string("x");
        linker.string(&mut host, s).unwrap();
        assert!(host.live_global_refs() > 0);
        linker.unlink(&mut host);
        assert_eq!(host.live_global_refs(), 0);
        assert_eq!(linker.builtin(BuiltinClass::Object), None);
    }

    #[test]
    fn declaring_twice_reuses_index() {
        let mut linker = Linker::new();
        let a = linker.declare_class("app/A", false);
        assert_eq!(linker.declare_class("app/A", false), a);
        assert_eq!(
            linker.declare_class(BuiltinClass::Object.name(), false),
            BuiltinClass::Object.index()
        );
    }
}
