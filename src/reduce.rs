//! Element-wise reduction table used by the collective work items.
//!
//! A reducer is resolved once per collective, at work construction, from
//! the `(DataType, ReduceOp)` pair. The resolved function folds a source
//! byte buffer into a destination byte buffer element by element.

use crate::error::{PlexusError, Result};
use crate::types::{DataType, ReduceOp};

/// A typed element-wise reducer operating on little-endian byte buffers.
///
/// `dst` and `src` must both contain exactly `count` elements of the type
/// the function was resolved for; `dst[i] = op(dst[i], src[i])`.
pub type ReduceFn = fn(dst: &mut [u8], src: &[u8], count: usize);

/// Scalar types that support the four reduction operations.
pub(crate) trait Reducible: Copy + 'static {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
    fn add(a: Self, b: Self) -> Self;
    fn mul(a: Self, b: Self) -> Self;
    fn min(a: Self, b: Self) -> Self;
    fn max(a: Self, b: Self) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(bytes.try_into().expect("slice length matches type size"))
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
                #[inline]
                fn add(a: Self, b: Self) -> Self {
                    a.wrapping_add(b)
                }
                #[inline]
                fn mul(a: Self, b: Self) -> Self {
                    a.wrapping_mul(b)
                }
                #[inline]
                fn min(a: Self, b: Self) -> Self {
                    Ord::min(a, b)
                }
                #[inline]
                fn max(a: Self, b: Self) -> Self {
                    Ord::max(a, b)
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(bytes.try_into().expect("slice length matches type size"))
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
                #[inline]
                fn add(a: Self, b: Self) -> Self {
                    a + b
                }
                #[inline]
                fn mul(a: Self, b: Self) -> Self {
                    a * b
                }
                #[inline]
                fn min(a: Self, b: Self) -> Self {
                    a.min(b)
                }
                #[inline]
                fn max(a: Self, b: Self) -> Self {
                    a.max(b)
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8);
impl_reducible!(float: f32, f64);

// f16 arithmetic goes through f32 and rounds back, matching the usual
// accumulate-in-f32 convention for half precision.
impl Reducible for half::f16 {
    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        half::f16::from_le_bytes(bytes.try_into().expect("slice length matches type size"))
    }
    #[inline]
    fn write_le(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_le_bytes());
    }
    #[inline]
    fn add(a: Self, b: Self) -> Self {
        half::f16::from_f32(a.to_f32() + b.to_f32())
    }
    #[inline]
    fn mul(a: Self, b: Self) -> Self {
        half::f16::from_f32(a.to_f32() * b.to_f32())
    }
    #[inline]
    fn min(a: Self, b: Self) -> Self {
        if b.to_f32() < a.to_f32() { b } else { a }
    }
    #[inline]
    fn max(a: Self, b: Self) -> Self {
        if b.to_f32() > a.to_f32() { b } else { a }
    }
}

/// Resolve the typed reducer for a `(dtype, op)` pair.
///
/// `ReduceOp::Unused` is rejected: it exists for operations that carry no
/// reduction and must never reach a reducing collective.
pub fn resolve(dtype: DataType, op: ReduceOp) -> Result<ReduceFn> {
    match dtype {
        DataType::F32 => resolve_typed::<f32>(dtype, op),
        DataType::F64 => resolve_typed::<f64>(dtype, op),
        DataType::F16 => resolve_typed::<half::f16>(dtype, op),
        DataType::I8 => resolve_typed::<i8>(dtype, op),
        DataType::U8 => resolve_typed::<u8>(dtype, op),
        DataType::I32 => resolve_typed::<i32>(dtype, op),
        DataType::I64 => resolve_typed::<i64>(dtype, op),
    }
}

fn resolve_typed<T: Reducible>(dtype: DataType, op: ReduceOp) -> Result<ReduceFn> {
    match op {
        ReduceOp::Sum => Ok(fold::<T, { OP_SUM }>),
        ReduceOp::Product => Ok(fold::<T, { OP_PRODUCT }>),
        ReduceOp::Min => Ok(fold::<T, { OP_MIN }>),
        ReduceOp::Max => Ok(fold::<T, { OP_MAX }>),
        ReduceOp::Unused => Err(PlexusError::UnsupportedReduce { dtype, op }),
    }
}

const OP_SUM: u8 = 0;
const OP_PRODUCT: u8 = 1;
const OP_MIN: u8 = 2;
const OP_MAX: u8 = 3;

fn fold<T: Reducible, const OP: u8>(dst: &mut [u8], src: &[u8], count: usize) {
    let t_size = std::mem::size_of::<T>();
    debug_assert!(dst.len() >= count * t_size && src.len() >= count * t_size);
    for i in 0..count {
        let off = i * t_size;
        let a = T::read_le(&dst[off..off + t_size]);
        let b = T::read_le(&src[off..off + t_size]);
        let r = match OP {
            OP_SUM => T::add(a, b),
            OP_PRODUCT => T::mul(a, b),
            OP_MIN => T::min(a, b),
            _ => T::max(a, b),
        };
        r.write_le(&mut dst[off..off + t_size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of<T: Copy>(vals: &[T]) -> Vec<u8> {
        let ptr = vals.as_ptr() as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of_val(vals)) }.to_vec()
    }

    #[test]
    fn test_sum_f32() {
        let mut dst = bytes_of(&[1.0f32, 2.0, 3.0, 4.0]);
        let src = bytes_of(&[10.0f32, 20.0, 30.0, 40.0]);
        let f = resolve(DataType::F32, ReduceOp::Sum).unwrap();
        f(&mut dst, &src, 4);
        assert_eq!(dst, bytes_of(&[11.0f32, 22.0, 33.0, 44.0]));
    }

    #[test]
    fn test_product_i32() {
        let mut dst = bytes_of(&[2i32, 3, 4]);
        let src = bytes_of(&[5i32, 6, 7]);
        let f = resolve(DataType::I32, ReduceOp::Product).unwrap();
        f(&mut dst, &src, 3);
        assert_eq!(dst, bytes_of(&[10i32, 18, 28]));
    }

    #[test]
    fn test_min_max_i64() {
        let mut lo = bytes_of(&[5i64, -2, 9]);
        let hi = bytes_of(&[3i64, 4, 9]);
        let f = resolve(DataType::I64, ReduceOp::Min).unwrap();
        f(&mut lo, &hi, 3);
        assert_eq!(lo, bytes_of(&[3i64, -2, 9]));

        let mut dst = bytes_of(&[5i64, -2, 9]);
        let f = resolve(DataType::I64, ReduceOp::Max).unwrap();
        f(&mut dst, &hi, 3);
        assert_eq!(dst, bytes_of(&[5i64, 4, 9]));
    }

    #[test]
    fn test_sum_u8_wraps() {
        let mut dst = bytes_of(&[250u8, 1]);
        let src = bytes_of(&[10u8, 1]);
        let f = resolve(DataType::U8, ReduceOp::Sum).unwrap();
        f(&mut dst, &src, 2);
        assert_eq!(dst, bytes_of(&[4u8, 2]));
    }

    #[test]
    fn test_sum_f16() {
        let a = half::f16::from_f32(1.5);
        let b = half::f16::from_f32(2.5);
        let mut dst = bytes_of(&[a]);
        let src = bytes_of(&[b]);
        let f = resolve(DataType::F16, ReduceOp::Sum).unwrap();
        f(&mut dst, &src, 1);
        let out = half::f16::from_le_bytes([dst[0], dst[1]]);
        assert_eq!(out.to_f32(), 4.0);
    }

    #[test]
    fn test_unused_rejected_for_every_dtype() {
        for dtype in [
            DataType::F32,
            DataType::F64,
            DataType::F16,
            DataType::I8,
            DataType::U8,
            DataType::I32,
            DataType::I64,
        ] {
            assert!(resolve(dtype, ReduceOp::Unused).is_err());
        }
    }
}
