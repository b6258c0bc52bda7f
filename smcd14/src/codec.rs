//! Float <-> register pair conversion.
//!
//! The controller stores a 32-bit float as two holding registers. The float is
//! packed big-endian and split into a high and a low word; the *low* word sits
//! at the lower register address, so a pair on the wire is `[lo, hi]`.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected exactly two registers for a 32-bit float, got {0}")]
pub struct FormatError(pub usize);

pub fn float_to_registers(value: f32) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    let hi = u16::from_be_bytes([bytes[0], bytes[1]]);
    let lo = u16::from_be_bytes([bytes[2], bytes[3]]);
    [lo, hi]
}

pub fn registers_to_float(registers: &[u16]) -> Result<f32, FormatError> {
    let [lo, hi] = registers else {
        return Err(FormatError(registers.len()));
    };

    let [b0, b1] = hi.to_be_bytes();
    let [b2, b3] = lo.to_be_bytes();
    Ok(f32::from_be_bytes([b0, b1, b2, b3]))
}
