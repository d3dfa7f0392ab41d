//! Interned names of classes, members and string literals.
//!
//! Symbolic references are declared once and compared often, so their names
//! are kept in a thread-local interner and passed around as [`Symbol`]s.

use std::{
    cell::RefCell,
    fmt::{self, Display},
};

use string_interner::{StringInterner, backend::StringBackend};

thread_local!(static SYMBOL_INTERNER: RefCell<StringInterner<StringBackend<usize>>> =
    RefCell::new(StringInterner::new()));

#[derive(Default, Copy, Clone, PartialEq, Hash, Eq, PartialOrd, Ord)]
pub struct Symbol(pub usize);

pub trait ToSymbol {
    fn to_symbol(&self) -> Symbol;
}

impl<T: AsRef<str>> ToSymbol for T {
    fn to_symbol(&self) -> Symbol {
        Symbol(SYMBOL_INTERNER.with_borrow_mut(|interner| interner.get_or_intern(self.as_ref())))
    }
}

impl Symbol {
    /// Runs `f` on the interned text. Unknown symbols read as "".
    pub fn with_str<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        SYMBOL_INTERNER.with_borrow(|interner| f(interner.resolve(self.0).unwrap_or_default()))
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_str(|s| write!(f, "{s}"))
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_str(|s| write!(f, "{s}({})", self.0))
    }
}
