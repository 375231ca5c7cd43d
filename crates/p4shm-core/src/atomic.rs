//! Atomic operation library
//!
//! Element-wise arithmetic, logical and swap operations over byte buffers in
//! native byte order. The per-datatype code is generated from one generic
//! kernel per operation family and selected through [`by_datatype!`].

use crate::datatype::Datatype;
use crate::header::OpKind;
use crate::{Error, Result};

/// Atomic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AtomicOp {
    Min = 0,
    Max = 1,
    Sum = 2,
    Prod = 3,
    Lor = 4,
    Land = 5,
    Bor = 6,
    Band = 7,
    Lxor = 8,
    Bxor = 9,
    Swap = 10,
    Cswap = 11,
    CswapNe = 12,
    CswapLe = 13,
    CswapLt = 14,
    CswapGe = 15,
    CswapGt = 16,
    Mswap = 17,
}

impl AtomicOp {
    pub fn from_u8(v: u8) -> Option<Self> {
        use AtomicOp::*;
        const ALL: [AtomicOp; 18] = [
            Min, Max, Sum, Prod, Lor, Land, Bor, Band, Lxor, Bxor, Swap, Cswap, CswapNe,
            CswapLe, CswapLt, CswapGe, CswapGt, Mswap,
        ];
        ALL.get(v as usize).copied()
    }

    /// Swap family, only valid through a swap operation
    pub const fn is_swap(self) -> bool {
        (self as u8) >= AtomicOp::Swap as u8
    }

    /// Takes an operand besides the source data
    pub const fn needs_operand(self) -> bool {
        (self as u8) > AtomicOp::Swap as u8
    }

    /// Whether `self` is defined for `dt`
    pub fn supports(self, dt: Datatype) -> bool {
        use AtomicOp::*;
        match self {
            Sum | Prod | Swap | Cswap | CswapNe => true,
            Min | Max | CswapLe | CswapLt | CswapGe | CswapGt => !dt.is_complex(),
            Lor | Land | Bor | Band | Lxor | Bxor | Mswap => dt.is_integer(),
        }
    }
}

/// Check an operation request before any data moves.
pub fn validate(kind: OpKind, op: AtomicOp, dt: Datatype, length: u64) -> Result<()> {
    let swap_kind = matches!(kind, OpKind::Swap);
    if op.is_swap() != swap_kind {
        return Err(Error::InvalidArgument(format!(
            "{op:?} is not valid for a {kind:?} operation"
        )));
    }
    if !op.supports(dt) {
        return Err(Error::InvalidArgument(format!("{op:?} undefined for {dt:?}")));
    }
    if length % dt.size() as u64 != 0 {
        return Err(Error::InvalidArgument(format!(
            "length {length} is not a multiple of {dt:?}"
        )));
    }
    if op.needs_operand() && length != dt.size() as u64 {
        return Err(Error::InvalidArgument(format!(
            "{op:?} operates on exactly one {dt:?}"
        )));
    }
    Ok(())
}

/// A datatype the kernels can operate on
trait Element: Copy + PartialEq {
    const SIZE: usize;
    fn read(b: &[u8]) -> Self;
    fn write(self, b: &mut [u8]);
    /// `target op source`; undefined combinations leave the target unchanged
    fn combine(op: AtomicOp, target: Self, source: Self) -> Self;
    fn less(a: Self, b: Self) -> bool;
    fn mask_swap(target: Self, source: Self, mask: Self) -> Self;
}

macro_rules! int_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read(b: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&b[..Self::SIZE]);
                <$t>::from_ne_bytes(raw)
            }

            fn write(self, b: &mut [u8]) {
                b[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
            }

            fn combine(op: AtomicOp, a: Self, b: Self) -> Self {
                match op {
                    AtomicOp::Min => a.min(b),
                    AtomicOp::Max => a.max(b),
                    AtomicOp::Sum => a.wrapping_add(b),
                    AtomicOp::Prod => a.wrapping_mul(b),
                    AtomicOp::Lor => ((a != 0) || (b != 0)) as $t,
                    AtomicOp::Land => ((a != 0) && (b != 0)) as $t,
                    AtomicOp::Lxor => ((a != 0) ^ (b != 0)) as $t,
                    AtomicOp::Bor => a | b,
                    AtomicOp::Band => a & b,
                    AtomicOp::Bxor => a ^ b,
                    _ => a,
                }
            }

            fn less(a: Self, b: Self) -> bool {
                a < b
            }

            fn mask_swap(target: Self, source: Self, mask: Self) -> Self {
                (target & !mask) | (source & mask)
            }
        }
    )*};
}

macro_rules! float_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read(b: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&b[..Self::SIZE]);
                <$t>::from_ne_bytes(raw)
            }

            fn write(self, b: &mut [u8]) {
                b[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
            }

            fn combine(op: AtomicOp, a: Self, b: Self) -> Self {
                match op {
                    AtomicOp::Min => a.min(b),
                    AtomicOp::Max => a.max(b),
                    AtomicOp::Sum => a + b,
                    AtomicOp::Prod => a * b,
                    _ => a,
                }
            }

            fn less(a: Self, b: Self) -> bool {
                a < b
            }

            fn mask_swap(target: Self, _source: Self, _mask: Self) -> Self {
                target
            }
        }
    )*};
}

int_element!(i8, u8, i16, u16, i32, u32, i64, u64);
float_element!(f32, f64);

/// Complex number stored as `[re, im]`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Complex<T> {
    re: T,
    im: T,
}

macro_rules! complex_element {
    ($($t:ty),*) => {$(
        impl Element for Complex<$t> {
            const SIZE: usize = 2 * std::mem::size_of::<$t>();

            fn read(b: &[u8]) -> Self {
                let half = std::mem::size_of::<$t>();
                Complex {
                    re: <$t as Element>::read(&b[..half]),
                    im: <$t as Element>::read(&b[half..Self::SIZE]),
                }
            }

            fn write(self, b: &mut [u8]) {
                let half = std::mem::size_of::<$t>();
                self.re.write(&mut b[..half]);
                self.im.write(&mut b[half..Self::SIZE]);
            }

            fn combine(op: AtomicOp, a: Self, b: Self) -> Self {
                match op {
                    AtomicOp::Sum => Complex { re: a.re + b.re, im: a.im + b.im },
                    AtomicOp::Prod => Complex {
                        re: a.re * b.re - a.im * b.im,
                        im: a.re * b.im + a.im * b.re,
                    },
                    _ => a,
                }
            }

            fn less(_a: Self, _b: Self) -> bool {
                false
            }

            fn mask_swap(target: Self, _source: Self, _mask: Self) -> Self {
                target
            }
        }
    )*};
}

complex_element!(f32, f64);

macro_rules! by_datatype {
    ($dt:expr, $kernel:ident($($arg:expr),*)) => {
        match $dt {
            Datatype::Int8 => $kernel::<i8>($($arg),*),
            Datatype::UInt8 => $kernel::<u8>($($arg),*),
            Datatype::Int16 => $kernel::<i16>($($arg),*),
            Datatype::UInt16 => $kernel::<u16>($($arg),*),
            Datatype::Int32 => $kernel::<i32>($($arg),*),
            Datatype::UInt32 => $kernel::<u32>($($arg),*),
            Datatype::Int64 => $kernel::<i64>($($arg),*),
            Datatype::UInt64 => $kernel::<u64>($($arg),*),
            Datatype::Float => $kernel::<f32>($($arg),*),
            Datatype::Double => $kernel::<f64>($($arg),*),
            Datatype::FloatComplex => $kernel::<Complex<f32>>($($arg),*),
            Datatype::DoubleComplex => $kernel::<Complex<f64>>($($arg),*),
        }
    };
}

fn reduce<T: Element>(op: AtomicOp, target: &mut [u8], source: &[u8]) {
    for (t, s) in target.chunks_exact_mut(T::SIZE).zip(source.chunks_exact(T::SIZE)) {
        T::combine(op, T::read(t), T::read(s)).write(t);
    }
}

fn fetch_reduce<T: Element>(op: AtomicOp, target: &mut [u8], inout: &mut [u8]) {
    for (t, s) in target.chunks_exact_mut(T::SIZE).zip(inout.chunks_exact_mut(T::SIZE)) {
        let old = T::read(t);
        T::combine(op, old, T::read(s)).write(t);
        old.write(s);
    }
}

fn swap<T: Element>(op: AtomicOp, target: &mut [u8], inout: &mut [u8], operand: &[u8]) {
    let cmp = if op.needs_operand() {
        Some(T::read(operand))
    } else {
        None
    };
    for (t, s) in target.chunks_exact_mut(T::SIZE).zip(inout.chunks_exact_mut(T::SIZE)) {
        let old = T::read(t);
        let src = T::read(s);
        let new = match (op, cmp) {
            (AtomicOp::Mswap, Some(mask)) => T::mask_swap(old, src, mask),
            (AtomicOp::Cswap, Some(c)) if c == old => src,
            (AtomicOp::CswapNe, Some(c)) if c != old => src,
            (AtomicOp::CswapLe, Some(c)) if c == old || T::less(c, old) => src,
            (AtomicOp::CswapLt, Some(c)) if T::less(c, old) => src,
            (AtomicOp::CswapGe, Some(c)) if c == old || T::less(old, c) => src,
            (AtomicOp::CswapGt, Some(c)) if T::less(old, c) => src,
            (AtomicOp::Swap, _) => src,
            _ => old,
        };
        new.write(t);
        old.write(s);
    }
}

/// `target[i] = target[i] op source[i]`
pub fn perform(op: AtomicOp, dt: Datatype, target: &mut [u8], source: &[u8]) -> Result<()> {
    validate(OpKind::Atomic, op, dt, source.len() as u64)?;
    by_datatype!(dt, reduce(op, target, source));
    Ok(())
}

/// Like [`perform`], leaving the previous target values in `inout`
pub fn perform_fetch(
    op: AtomicOp,
    dt: Datatype,
    target: &mut [u8],
    inout: &mut [u8],
) -> Result<()> {
    validate(OpKind::FetchAtomic, op, dt, inout.len() as u64)?;
    by_datatype!(dt, fetch_reduce(op, target, inout));
    Ok(())
}

/// Swap family; `inout` holds the new value on entry and the old one on exit
pub fn perform_with_operand(
    op: AtomicOp,
    dt: Datatype,
    target: &mut [u8],
    inout: &mut [u8],
    operand: &[u8],
) -> Result<()> {
    validate(OpKind::Swap, op, dt, inout.len() as u64)?;
    if op.needs_operand() && operand.len() < dt.size() {
        return Err(Error::InvalidArgument("operand too short".to_string()));
    }
    by_datatype!(dt, swap(op, target, inout, operand));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes<T: Element>(vals: &[T]) -> Vec<u8> {
        let mut out = vec![0u8; vals.len() * T::SIZE];
        for (v, chunk) in vals.iter().zip(out.chunks_exact_mut(T::SIZE)) {
            v.write(chunk);
        }
        out
    }

    fn values<T: Element>(b: &[u8]) -> Vec<T> {
        b.chunks_exact(T::SIZE).map(T::read).collect()
    }

    #[test]
    fn test_integer_reductions() {
        let mut target = bytes::<i32>(&[5, -3, 0, 7]);
        let source = bytes::<i32>(&[2, 4, 9, -7]);
        perform(AtomicOp::Sum, Datatype::Int32, &mut target, &source).unwrap();
        assert_eq!(values::<i32>(&target), vec![7, 1, 9, 0]);
        perform(AtomicOp::Max, Datatype::Int32, &mut target, &source).unwrap();
        assert_eq!(values::<i32>(&target), vec![7, 4, 9, 0]);
        perform(AtomicOp::Land, Datatype::Int32, &mut target, &source).unwrap();
        assert_eq!(values::<i32>(&target), vec![1, 1, 1, 0]);
    }

    #[test]
    fn test_unsigned_wraps() {
        let mut target = bytes::<u8>(&[250]);
        perform(AtomicOp::Sum, Datatype::UInt8, &mut target, &bytes::<u8>(&[10])).unwrap();
        assert_eq!(values::<u8>(&target), vec![4]);
    }

    #[test]
    fn test_fetch_returns_old_values() {
        let mut target = bytes::<u64>(&[10, 20]);
        let mut inout = bytes::<u64>(&[1, 2]);
        perform_fetch(AtomicOp::Sum, Datatype::UInt64, &mut target, &mut inout).unwrap();
        assert_eq!(values::<u64>(&target), vec![11, 22]);
        assert_eq!(values::<u64>(&inout), vec![10, 20]);
    }

    #[test]
    fn test_float_and_complex() {
        let mut target = bytes::<f64>(&[1.5]);
        perform(AtomicOp::Prod, Datatype::Double, &mut target, &bytes::<f64>(&[4.0])).unwrap();
        assert_eq!(values::<f64>(&target), vec![6.0]);

        // (1 + 2i) * (3 + 4i) = -5 + 10i
        let mut target = bytes::<f32>(&[1.0, 2.0]);
        let source = bytes::<f32>(&[3.0, 4.0]);
        perform(AtomicOp::Prod, Datatype::FloatComplex, &mut target, &source).unwrap();
        assert_eq!(values::<f32>(&target), vec![-5.0, 10.0]);
    }

    #[test]
    fn test_invalid_combinations() {
        let mut target = bytes::<f32>(&[1.0]);
        let source = bytes::<f32>(&[1.0]);
        assert!(perform(AtomicOp::Bor, Datatype::Float, &mut target, &source).is_err());
        assert!(perform(AtomicOp::Swap, Datatype::Float, &mut target, &source).is_err());
        let mut c = bytes::<f64>(&[1.0, 0.0]);
        let zero = bytes::<f64>(&[0.0, 0.0]);
        assert!(perform(AtomicOp::Min, Datatype::DoubleComplex, &mut c, &zero).is_err());
        let mut odd = vec![0u8; 3];
        assert!(perform(AtomicOp::Sum, Datatype::UInt16, &mut odd, &[0, 0, 0]).is_err());
    }

    #[test]
    fn test_compare_and_swap_family() {
        let cases = [
            (AtomicOp::Cswap, 5i64, 5i64, true),
            (AtomicOp::Cswap, 5, 6, false),
            (AtomicOp::CswapNe, 5, 6, true),
            (AtomicOp::CswapLt, 4, 5, true),
            (AtomicOp::CswapLt, 5, 5, false),
            (AtomicOp::CswapLe, 5, 5, true),
            (AtomicOp::CswapGt, 6, 5, true),
            (AtomicOp::CswapGe, 4, 5, false),
        ];
        for (op, operand, current, swapped) in cases {
            let mut target = bytes::<i64>(&[current]);
            let mut inout = bytes::<i64>(&[99]);
            let operand = bytes::<i64>(&[operand]);
            perform_with_operand(op, Datatype::Int64, &mut target, &mut inout, &operand).unwrap();
            let expect = if swapped { 99 } else { current };
            assert_eq!(values::<i64>(&target), vec![expect], "{op:?}");
            assert_eq!(values::<i64>(&inout), vec![current], "{op:?}");
        }
    }

    #[test]
    fn test_mask_swap() {
        let mut target = bytes::<u16>(&[0xff00]);
        let mut inout = bytes::<u16>(&[0x0f0f]);
        let mask = bytes::<u16>(&[0x00ff]);
        perform_with_operand(AtomicOp::Mswap, Datatype::UInt16, &mut target, &mut inout, &mask)
            .unwrap();
        assert_eq!(values::<u16>(&target), vec![0xff0f]);
        assert_eq!(values::<u16>(&inout), vec![0xff00]);
    }

    #[test]
    fn test_plain_swap_many_elements() {
        let mut target = bytes::<u32>(&[1, 2, 3]);
        let mut inout = bytes::<u32>(&[7, 8, 9]);
        perform_with_operand(AtomicOp::Swap, Datatype::UInt32, &mut target, &mut inout, &[])
            .unwrap();
        assert_eq!(values::<u32>(&target), vec![7, 8, 9]);
        assert_eq!(values::<u32>(&inout), vec![1, 2, 3]);
    }
}
