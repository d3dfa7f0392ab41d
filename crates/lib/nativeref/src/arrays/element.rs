//! Per-element-type access strategies for primitive arrays.
//!
//! Each of the eight managed primitive types has a strategy type implementing
//! [`PrimitiveElement`]. It names the managed representation, the native C
//! representation and the [`ElementType`] used to ask the host for a pin.
//! Whether the two representations can share memory is decided once per
//! strategy by [`layout_compatible`]; when they cannot, [`convert`] produces an
//! element-wise copy.

use std::{
    collections::TryReserveError,
    ffi::{c_double, c_float, c_int, c_long, c_schar, c_short, c_uchar, c_ushort},
    fmt,
    ops::Div,
    ptr::NonNull,
    sync::OnceLock,
};

use num_traits::{AsPrimitive, Bounded, NumCast, One, Zero};

use crate::host::{Handle, Host};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl ElementType {
    pub const ALL: [ElementType; 8] = [
        ElementType::Boolean,
        ElementType::Byte,
        ElementType::Char,
        ElementType::Short,
        ElementType::Int,
        ElementType::Long,
        ElementType::Float,
        ElementType::Double,
    ];

    /// Size in bytes of one managed element.
    pub fn size(self) -> usize {
        match self {
            ElementType::Boolean | ElementType::Byte => 1,
            ElementType::Char | ElementType::Short => 2,
            ElementType::Int | ElementType::Float => 4,
            ElementType::Long | ElementType::Double => 8,
        }
    }

    pub fn signature(self) -> char {
        match self {
            ElementType::Boolean => 'Z',
            ElementType::Byte => 'B',
            ElementType::Char => 'C',
            ElementType::Short => 'S',
            ElementType::Int => 'I',
            ElementType::Long => 'J',
            ElementType::Float => 'F',
            ElementType::Double => 'D',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::Boolean => "boolean",
            ElementType::Byte => "byte",
            ElementType::Char => "char",
            ElementType::Short => "short",
            ElementType::Int => "int",
            ElementType::Long => "long",
            ElementType::Float => "float",
            ElementType::Double => "double",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Numeric operations the layout probe needs from both sides.
pub trait Scalar:
    Copy + PartialEq + PartialOrd + Bounded + Zero + One + NumCast + Div<Output = Self> + 'static
{
}

impl<T> Scalar for T where
    T: Copy + PartialEq + PartialOrd + Bounded + Zero + One + NumCast + Div<Output = Self> + 'static
{
}

pub trait PrimitiveElement: 'static {
    const TYPE: ElementType;
    /// Element representation inside the managed array.
    type Managed: Scalar + AsPrimitive<Self::Native>;
    /// Element representation native code works with.
    type Native: Scalar + AsPrimitive<Self::Managed>;
    /// Storage for the memoized [`layout_compatible`] verdict.
    fn layout_verdict() -> &'static OnceLock<bool>;
}

macro_rules! primitive_element {
    ($name:ident, $variant:ident, $managed:ty, $native:ty) => {
        #[derive(Clone, Copy, Debug)]
        pub struct $name;
        impl PrimitiveElement for $name {
            const TYPE: ElementType = ElementType::$variant;
            type Managed = $managed;
            type Native = $native;
            fn layout_verdict() -> &'static OnceLock<bool> {
                static VERDICT: OnceLock<bool> = OnceLock::new();
                &VERDICT
            }
        }
    };
}

primitive_element!(Boolean, Boolean, u8, c_uchar);
primitive_element!(Byte, Byte, i8, c_schar);
primitive_element!(Char, Char, u16, c_ushort);
primitive_element!(Short, Short, i16, c_short);
primitive_element!(Int, Int, i32, c_int);
primitive_element!(Long, Long, i64, c_long);
primitive_element!(Float, Float, f32, c_float);
primitive_element!(Double, Double, f64, c_double);

/// Whether managed elements of `E` can be handed to native code in place.
pub fn layout_compatible<E: PrimitiveElement>() -> bool {
    *E::layout_verdict().get_or_init(|| {
        let verdict = probe_layout::<E::Managed, E::Native>();
        log::trace!("layout of {} elements compatible: {verdict}", E::TYPE);
        verdict
    })
}

/// Same size, same signedness, and the bits of `1` and `1/17` mean the same
/// value on both sides.
pub fn probe_layout<M, N>() -> bool
where
    M: Scalar + AsPrimitive<N>,
    N: Scalar,
{
    if size_of::<M>() != size_of::<N>() {
        return false;
    }
    let signed_m = M::min_value() < M::zero();
    let signed_n = N::min_value() < N::zero();
    if signed_m != signed_n {
        return false;
    }
    let Some(seventeen) = <M as NumCast>::from(17u8) else {
        return false;
    };
    [M::one(), M::one() / seventeen].into_iter().all(|m| {
        // SAFETY: both types are plain scalars of the same size.
        let reinterpreted: N = unsafe { std::mem::transmute_copy(&m) };
        reinterpreted == m.as_()
    })
}

/// How array contents were pinned, so they are released the same way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinKind {
    Standard(ElementType),
    Critical,
}

/// Pinning mechanism used for every record of one cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PinStrategy {
    #[default]
    Standard,
    Critical,
}

pub fn pin<E: PrimitiveElement, H: Host>(
    host: &mut H,
    array: Handle,
    strategy: PinStrategy,
) -> Option<(NonNull<u8>, PinKind)> {
    match strategy {
        PinStrategy::Standard => host
            .pin_array(array, E::TYPE)
            .map(|p| (p, PinKind::Standard(E::TYPE))),
        PinStrategy::Critical => host.pin_critical(array).map(|p| (p, PinKind::Critical)),
    }
}

pub fn unpin<H: Host>(host: &mut H, array: Handle, elements: NonNull<u8>, kind: PinKind) {
    match kind {
        PinKind::Standard(ty) => host.unpin_array(array, ty, elements),
        PinKind::Critical => host.unpin_critical(array, elements),
    }
}

/// Native copy of pinned managed elements.
///
/// Backed by 8-byte words, which satisfies the alignment of every native
/// element type.
#[derive(Debug)]
pub struct ConvertedBuffer {
    ty: ElementType,
    words: Box<[u64]>,
}

impl ConvertedBuffer {
    pub fn element_type(&self) -> ElementType {
        self.ty
    }
    pub fn as_mut_ptr(&mut self) -> NonNull<u8> {
        NonNull::from(&mut *self.words).cast()
    }
}

/// Copies `len` managed elements at `src` into a new native buffer, casting
/// each one.
///
/// # Safety
///
/// `src` must point to `len` initialized elements of `E::Managed`.
pub unsafe fn convert<E: PrimitiveElement>(
    src: NonNull<u8>,
    len: usize,
) -> Result<ConvertedBuffer, TryReserveError> {
    let bytes = len * size_of::<E::Native>();
    let mut words: Vec<u64> = Vec::new();
    words.try_reserve_exact(bytes.div_ceil(8))?;
    words.resize(bytes.div_ceil(8), 0);
    let src = src.cast::<E::Managed>().as_ptr();
    let dst = words.as_mut_ptr().cast::<E::Native>();
    for i in 0..len {
        // SAFETY: the caller guarantees `src`; `dst` was sized for `len`
        // elements above and u64 alignment covers every native scalar.
        unsafe { dst.add(i).write((*src.add(i)).as_()) };
    }
    Ok(ConvertedBuffer {
        ty: E::TYPE,
        words: words.into_boxed_slice(),
    })
}
