//! Float truncation and rounding
//!
//! Truncations reject NaN and values whose integer part does not fit the
//! target; f32 inputs are widened to f64 first, which is exact. Rounding
//! results that are NaN are replaced by the canonical NaN.

use super::error::TrapCode;

const CANONICAL_NAN_F32: u32 = 0x7fc0_0000;
const CANONICAL_NAN_F64: u64 = 0x7ff8_0000_0000_0000;

pub(crate) fn trunc_i32_s(v: f64) -> Result<i32, TrapCode> {
    if v > -2_147_483_649.0 && v < 2_147_483_648.0 {
        Ok(v as i32)
    } else {
        Err(TrapCode::InvalidConversion)
    }
}

pub(crate) fn trunc_i32_u(v: f64) -> Result<i32, TrapCode> {
    if v > -1.0 && v < 4_294_967_296.0 {
        Ok(v as u32 as i32)
    } else {
        Err(TrapCode::InvalidConversion)
    }
}

pub(crate) fn trunc_i64_s(v: f64) -> Result<i64, TrapCode> {
    // -2^63 is exact in f64, -2^63 - 1 is not
    if v >= -9_223_372_036_854_775_808.0 && v < 9_223_372_036_854_775_808.0 {
        Ok(v as i64)
    } else {
        Err(TrapCode::InvalidConversion)
    }
}

pub(crate) fn trunc_i64_u(v: f64) -> Result<i64, TrapCode> {
    if v > -1.0 && v < 18_446_744_073_709_551_616.0 {
        Ok(v as u64 as i64)
    } else {
        Err(TrapCode::InvalidConversion)
    }
}

fn canonical_f32(v: f32) -> f32 {
    if v.is_nan() {
        f32::from_bits(CANONICAL_NAN_F32)
    } else {
        v
    }
}

fn canonical_f64(v: f64) -> f64 {
    if v.is_nan() {
        f64::from_bits(CANONICAL_NAN_F64)
    } else {
        v
    }
}

/// Rounding modes shared by the f32 and f64 intrinsics
#[derive(Debug, Clone, Copy)]
pub(crate) enum Rounding {
    Ceil,
    Floor,
    Trunc,
    Nearest,
}

pub(crate) fn round_f32(v: f32, mode: Rounding) -> f32 {
    canonical_f32(match mode {
        Rounding::Ceil => v.ceil(),
        Rounding::Floor => v.floor(),
        Rounding::Trunc => v.trunc(),
        Rounding::Nearest => v.round_ties_even(),
    })
}

pub(crate) fn round_f64(v: f64, mode: Rounding) -> f64 {
    canonical_f64(match mode {
        Rounding::Ceil => v.ceil(),
        Rounding::Floor => v.floor(),
        Rounding::Trunc => v.trunc(),
        Rounding::Nearest => v.round_ties_even(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i32_signed_bounds() {
        assert_eq!(trunc_i32_s(-2_147_483_648.9), Ok(i32::MIN));
        assert_eq!(trunc_i32_s(2_147_483_647.9), Ok(i32::MAX));
        assert_eq!(trunc_i32_s(2_147_483_648.0), Err(TrapCode::InvalidConversion));
        assert_eq!(trunc_i32_s(-2_147_483_649.0), Err(TrapCode::InvalidConversion));
        assert_eq!(trunc_i32_s(f64::NAN), Err(TrapCode::InvalidConversion));
    }

    #[test]
    fn test_unsigned_bounds() {
        assert_eq!(trunc_i32_u(-0.9), Ok(0));
        assert_eq!(trunc_i32_u(4_294_967_295.0), Ok(-1));
        assert_eq!(trunc_i32_u(-1.0), Err(TrapCode::InvalidConversion));
        assert_eq!(trunc_i64_u(18_446_744_073_709_549_568.0), Ok(-2048));
        assert_eq!(trunc_i64_u(f64::INFINITY), Err(TrapCode::InvalidConversion));
    }

    #[test]
    fn test_i64_signed_bounds() {
        assert_eq!(trunc_i64_s(-9_223_372_036_854_775_808.0), Ok(i64::MIN));
        assert_eq!(trunc_i64_s(9_223_372_036_854_775_808.0), Err(TrapCode::InvalidConversion));
        assert_eq!(trunc_i64_s(f32::MAX as f64), Err(TrapCode::InvalidConversion));
    }

    #[test]
    fn test_nearest_ties_to_even() {
        assert_eq!(round_f64(2.5, Rounding::Nearest), 2.0);
        assert_eq!(round_f64(3.5, Rounding::Nearest), 4.0);
        assert_eq!(round_f32(-0.5, Rounding::Nearest).to_bits(), (-0.0f32).to_bits());
        assert_eq!(round_f64(-1.5, Rounding::Ceil), -1.0);
    }

    #[test]
    fn test_nan_is_canonical() {
        let nan = f32::from_bits(0x7fa0_0001);
        assert_eq!(round_f32(nan, Rounding::Floor).to_bits(), CANONICAL_NAN_F32);
        let nan = f64::from_bits(0xfff0_0000_0000_0001);
        assert_eq!(round_f64(nan, Rounding::Trunc).to_bits(), CANONICAL_NAN_F64);
    }
}
