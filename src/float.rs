//! Encoder for the KR-16 arithmetic unit's 48-bit floating-point format.
//!
//! Three storage words hold a 40-bit two's-complement mantissa (packed
//! big-end-first across word 0, word 1 and the high byte of word 2) and a
//! signed 8-bit exponent in the low byte of word 2. The value is
//! `m / 2^39 * 2^exp`. A mantissa is normalized when its two most
//! significant bits differ.

/// Encoded value leaves the representable exponent range. Underflow is
/// only reported for nonzero mantissas; a true zero always encodes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FloatError {
    Overflow,
    Underflow,
}

const MANT_BITS: u32 = 40;
const EXP_MIN: i32 = -128;
const EXP_MAX: i32 = 127;

/// Splits a finite nonzero double into fraction and exponent such that
/// `x = f * 2^e` with `|f|` in [0.5, 1).
fn frexp(x: f64) -> (f64, i32) {
    let mut x = x;
    let mut adjust = 0;
    let mut bits = x.to_bits();
    if (bits >> 52) & 0x7ff == 0 {
        // Subnormal: prescale into the normal range.
        x *= (1u64 << 54) as f64;
        adjust = -54;
        bits = x.to_bits();
    }
    let e = ((bits >> 52) & 0x7ff) as i32 - 1022;
    let frac_bits = (bits & !(0x7ffu64 << 52)) | (1022u64 << 52);
    (f64::from_bits(frac_bits), e + adjust)
}

pub fn encode(value: f64) -> Result<[u16; 3], FloatError> {
    if value == 0.0 {
        return Ok([0; 3]);
    }

    let (f, mut exp) = frexp(value);

    // One extra low bit for round-to-nearest.
    let wide = (f * (1i64 << MANT_BITS) as f64).floor() as i64;
    let mut m = (wide >> 1) + (wide & 1);
    if m >= 1 << (MANT_BITS - 1) {
        // Rounding carried out of the mantissa field.
        m >>= 1;
        exp += 1;
    }

    // Normalize: the two most significant mantissa bits must differ.
    // Only exact negative powers of two need the shift here.
    while (m >> (MANT_BITS - 1)) & 1 == (m >> (MANT_BITS - 2)) & 1 {
        m <<= 1;
        exp -= 1;
    }

    if exp > EXP_MAX {
        return Err(FloatError::Overflow);
    }
    if exp < EXP_MIN {
        return Err(FloatError::Underflow);
    }

    let mant = (m as u64) & ((1u64 << MANT_BITS) - 1);
    Ok([
        (mant >> 24) as u16,
        (mant >> 8) as u16,
        (((mant & 0xff) as u16) << 8) | (exp as i8 as u8 as u16),
    ])
}

/// Decodes the packed representation back into a double. Exact for every
/// encodable value; used to verify round trips.
pub fn decode(words: &[u16; 3]) -> f64 {
    let mant = ((words[0] as u64) << 24) | ((words[1] as u64) << 8) | ((words[2] >> 8) as u64);
    // Sign-extend the 40-bit field.
    let m = ((mant << (64 - MANT_BITS)) as i64) >> (64 - MANT_BITS);
    if m == 0 {
        return 0.0;
    }
    let exp = (words[2] & 0xff) as u8 as i8 as i32;
    (m as f64) / (1i64 << (MANT_BITS - 1)) as f64 * (2.0f64).powi(exp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero() {
        assert_eq!(Ok([0, 0, 0]), encode(0.0));
        assert_eq!(0.0, decode(&[0, 0, 0]));
    }

    #[test]
    fn test_one_exact_layout() {
        // 1.0 = 0.5 * 2^1: mantissa 0100...0, exponent 1.
        let words = encode(1.0).unwrap();
        assert_eq!([0x4000, 0x0000, 0x0001], words);
        assert_eq!(1.0, decode(&words));
    }

    #[test]
    fn test_round_trips() {
        for &v in &[
            1.0, -1.0, 0.5, -0.5, 2.0, 100.0, -3.25, 0.1, -0.0625, 123456.789,
        ] {
            let words = encode(v).unwrap();
            let back = decode(&words);
            // 40-bit mantissa: anything with at most 39 significant bits is
            // exact, the rest within one unit in the last place.
            let ulp = (v.abs() / (1i64 << 39) as f64).max(::std::f64::MIN_POSITIVE);
            assert!(
                (back - v).abs() <= ulp,
                "{} -> {:?} -> {}",
                v,
                words,
                back
            );
        }
    }

    #[test]
    fn test_negative_power_of_two_normalizes() {
        // -1.0 is mantissa 10...0 (the one negative value whose two top
        // bits would otherwise match), exponent 0.
        let words = encode(-1.0).unwrap();
        assert_eq!([0x8000, 0x0000, 0x0000], words);
        assert_eq!(-1.0, decode(&words));
    }

    #[test]
    fn test_exponent_limits() {
        // 2^127 = 0.5 * 2^128 is the first overflow.
        assert_eq!(Err(FloatError::Overflow), encode((2.0f64).powi(127)));
        assert!(encode((2.0f64).powi(126)).is_ok());
        assert_eq!(Err(FloatError::Overflow), encode(1.0e300));
        assert_eq!(Err(FloatError::Underflow), encode(1.0e-300));
        // Smallest representable scale still encodes.
        let v = 0.5 * (2.0f64).powi(-128);
        let words = encode(v).unwrap();
        assert_eq!(v, decode(&words));
    }
}
