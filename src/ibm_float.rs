//! IBM System/370 hexadecimal floating point, the numeric encoding of
//! SAS transport files.
//!
//! A value is a sign bit, a 7-bit base-16 exponent biased by 64 and a
//! 56-bit fraction in `[1/16, 1)`. Transport files may store only the
//! leading 2 to 8 bytes of a value.

/// Fraction bits of a full 8-byte value
const FRACTION_BITS: i32 = 56;

const EXPONENT_BIAS: i32 = 64;

/// Convert the leading `bytes` of an IBM float to `f64`.
///
/// Returns `None` for SAS missing values (`.`, `._` and `.A` to `.Z`),
/// which are stored as the missing code followed by zero bytes.
pub fn to_f64(bytes: &[u8]) -> Option<f64> {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);

    if is_missing(&buf) {
        return None;
    }

    let sign = buf[0] & 0x80 != 0;
    let exponent = i32::from(buf[0] & 0x7f) - EXPONENT_BIAS;
    let fraction = buf[1..]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));

    if fraction == 0 {
        return Some(0.0);
    }

    let magnitude = fraction as f64 * 2f64.powi(4 * exponent - FRACTION_BITS);
    Some(if sign { -magnitude } else { magnitude })
}

/// Convert an `f64` to a full 8-byte IBM float.
///
/// NaN becomes the standard missing value. Magnitudes below the IBM range
/// flush to zero and magnitudes above it saturate to the largest value.
pub fn from_f64(value: f64) -> [u8; 8] {
    if value.is_nan() {
        return missing();
    }
    if value == 0.0 {
        return [0u8; 8];
    }

    let sign: u8 = if value.is_sign_negative() { 0x80 } else { 0 };
    if value.is_infinite() {
        return [sign | 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
    }

    let bits = value.abs().to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    if biased == 0 {
        // Subnormal doubles are far below the smallest IBM value.
        return [0u8; 8];
    }
    let exp2 = biased - 1023;
    let mantissa = (bits & ((1u64 << 52) - 1)) | (1u64 << 52);

    let exp16 = (exp2 + 4).div_euclid(4);
    let shift = exp2 + 4 - 4 * exp16;
    let biased16 = exp16 + EXPONENT_BIAS;

    if biased16 < 0 {
        return [0u8; 8];
    }
    if biased16 > 0x7f {
        return [sign | 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
    }

    let fraction = mantissa << shift;
    let mut out = [0u8; 8];
    out[0] = sign | biased16 as u8;
    out[1..].copy_from_slice(&fraction.to_be_bytes()[1..]);
    out
}

/// The standard SAS missing value `.`
pub fn missing() -> [u8; 8] {
    [0x2e, 0, 0, 0, 0, 0, 0, 0]
}

fn is_missing(buf: &[u8; 8]) -> bool {
    let code = buf[0];
    let is_code = code == b'.' || code == b'_' || code.is_ascii_uppercase();
    is_code && buf[1..].iter().all(|&b| b == 0)
}
