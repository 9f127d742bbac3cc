/*!
Named configuration values with an arbitrary serialization bit order.

A [`BitField`] knows its width, the order in which its logical bits are
shifted into the chip, and its current value. Chips whose shift registers mix
bit-reversed and natural-order fields are described by giving each field its
own order.
*/

use crate::error::{CodecError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Largest supported parameter width in bits
pub const MAX_WIDTH: u32 = 30;

/// Longest accepted textual bit order
pub const MAX_BIT_ORDER_LEN: usize = 80;

/// Order in which bits are shifted into a configuration register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ShiftDirection {
    MsbFirst = 0,
    LsbFirst = 1,
    /// Serialize MSB first, then reverse the whole stream
    GlobalInvertedMsbFirst = 2,
    /// Serialize LSB first, then reverse the whole stream
    GlobalInvertedLsbFirst = 3,
}

impl ShiftDirection {
    /// Whether the complete stream is reversed after serialization
    pub fn is_global_inverted(self) -> bool {
        matches!(self, Self::GlobalInvertedMsbFirst | Self::GlobalInvertedLsbFirst)
    }

    /// The per-parameter direction with the global inversion stripped
    pub fn base(self) -> Self {
        match self {
            Self::MsbFirst | Self::GlobalInvertedMsbFirst => Self::MsbFirst,
            Self::LsbFirst | Self::GlobalInvertedLsbFirst => Self::LsbFirst,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MsbFirst => "msb-first",
            Self::LsbFirst => "lsb-first",
            Self::GlobalInvertedMsbFirst => "global-inverted-msb-first",
            Self::GlobalInvertedLsbFirst => "global-inverted-lsb-first",
        }
    }
}

impl Default for ShiftDirection {
    fn default() -> Self {
        Self::MsbFirst
    }
}

impl fmt::Display for ShiftDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShiftDirection {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "msb-first" | "msbfirst" | "msb" => Ok(Self::MsbFirst),
            "lsb-first" | "lsbfirst" | "lsb" => Ok(Self::LsbFirst),
            "global-inverted-msb-first" | "globalinvertedmsbfirst" => Ok(Self::GlobalInvertedMsbFirst),
            "global-inverted-lsb-first" | "globalinvertedlsbfirst" => Ok(Self::GlobalInvertedLsbFirst),
            _ => Err(CodecError::UnsupportedDirection(s.to_string())),
        }
    }
}

impl TryFrom<i32> for ShiftDirection {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::MsbFirst),
            1 => Ok(Self::LsbFirst),
            2 => Ok(Self::GlobalInvertedMsbFirst),
            3 => Ok(Self::GlobalInvertedLsbFirst),
            other => Err(CodecError::UnsupportedDirection(other.to_string())),
        }
    }
}

fn bit_order_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // unwrap: the pattern is a valid literal
    PATTERN.get_or_init(|| Regex::new(r"^[0-9,]+$").unwrap())
}

/// Parse a comma separated bit order and check that it covers every bit of
/// `0..width` exactly once, where the width is the number of entries.
pub fn parse_bit_order(name: &str, order: &str) -> Result<Vec<u8>> {
    let invalid = |reason: String| CodecError::InvalidBitOrder {
        name: name.to_string(),
        order: order.to_string(),
        reason,
    };

    if order.is_empty() || order.len() > MAX_BIT_ORDER_LEN {
        return Err(invalid(format!(
            "length {} outside of 1..={}",
            order.len(),
            MAX_BIT_ORDER_LEN
        )));
    }
    if !bit_order_pattern().is_match(order) {
        return Err(invalid("only digits and commas are allowed".to_string()));
    }

    let mut positions = Vec::new();
    let mut seen: u32 = 0;
    for token in order.split(',') {
        let position: u32 = token
            .parse()
            .map_err(|_| invalid(format!("empty or malformed entry \"{}\"", token)))?;
        if position >= MAX_WIDTH {
            return Err(invalid(format!("bit {} exceeds the maximum width", position)));
        }
        if seen & (1 << position) != 0 {
            return Err(invalid(format!("bit {} listed twice", position)));
        }
        seen |= 1 << position;
        positions.push(position as u8);
    }

    let width = positions.len() as u32;
    let complete = (1u32 << width) - 1;
    if seen != complete {
        let hole = (!seen).trailing_zeros();
        return Err(invalid(format!("bit {} is missing", hole)));
    }

    Ok(positions)
}

/// Format bit positions as the comma separated text representation
pub fn format_bit_order(positions: &[u8]) -> String {
    positions
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// One configuration value and the physical order of its bits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bit_positions: Vec<u8>,
    value: u32,
}

impl BitField {
    /// Create a field whose bits are shifted in MSB or LSB first.
    ///
    /// The initial value is clamped to the largest value the width can hold.
    pub fn with_direction(
        name: &str,
        width: u32,
        direction: ShiftDirection,
        initial: u32,
    ) -> Result<Self> {
        if width == 0 || width > MAX_WIDTH {
            return Err(CodecError::InvalidWidth {
                name: name.to_string(),
                width,
            });
        }

        let bit_positions: Vec<u8> = match direction {
            ShiftDirection::MsbFirst => (0..width as u8).rev().collect(),
            ShiftDirection::LsbFirst => (0..width as u8).collect(),
            other => {
                return Err(CodecError::UnsupportedDirection(format!(
                    "{} cannot be used as a parameter direction",
                    other
                )))
            }
        };

        Ok(Self::from_positions(bit_positions, initial))
    }

    /// Create a field from an explicit comma separated bit order
    pub fn with_bit_order(name: &str, order: &str, initial: u32) -> Result<Self> {
        let bit_positions = parse_bit_order(name, order)?;
        Ok(Self::from_positions(bit_positions, initial))
    }

    fn from_positions(bit_positions: Vec<u8>, initial: u32) -> Self {
        let mut field = Self {
            bit_positions,
            value: 0,
        };
        field.value = initial.min(field.max_value());
        field
    }

    pub fn width(&self) -> u32 {
        self.bit_positions.len() as u32
    }

    /// Largest value that fits into the field
    pub fn max_value(&self) -> u32 {
        (1u32 << self.width()) - 1
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn bit_positions(&self) -> &[u8] {
        &self.bit_positions
    }

    /// The bit order in its comma separated text form
    pub fn bit_order(&self) -> String {
        format_bit_order(&self.bit_positions)
    }

    /// Overwrite the value, rejecting anything that does not fit the width
    pub fn set_value(&mut self, name: &str, value: u32) -> Result<()> {
        if value > self.max_value() {
            return Err(CodecError::ValueOutOfRange {
                name: name.to_string(),
                value,
                width: self.width(),
            });
        }
        self.value = value;
        Ok(())
    }

    /// Append the field's bits to `out`, scanning the bit order from the
    /// front or, when `reverse` is set, from the back.
    pub fn append_bits(&self, reverse: bool, out: &mut Vec<bool>) {
        let bit = |position: &u8| (self.value >> *position) & 0x1 != 0;
        if reverse {
            out.extend(self.bit_positions.iter().rev().map(bit));
        } else {
            out.extend(self.bit_positions.iter().map(bit));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_builds_positions() {
        let msb = BitField::with_direction("a", 4, ShiftDirection::MsbFirst, 0).unwrap();
        assert_eq!(msb.bit_positions(), &[3, 2, 1, 0]);
        assert_eq!(msb.bit_order(), "3,2,1,0");

        let lsb = BitField::with_direction("b", 3, ShiftDirection::LsbFirst, 0).unwrap();
        assert_eq!(lsb.bit_positions(), &[0, 1, 2]);
    }

    #[test]
    fn test_width_limits() {
        assert!(matches!(
            BitField::with_direction("zero", 0, ShiftDirection::MsbFirst, 0),
            Err(CodecError::InvalidWidth { width: 0, .. })
        ));
        assert!(BitField::with_direction("wide", 31, ShiftDirection::MsbFirst, 0).is_err());
        assert!(BitField::with_direction("max", 30, ShiftDirection::MsbFirst, 0).is_ok());
        assert!(BitField::with_direction("inv", 4, ShiftDirection::GlobalInvertedMsbFirst, 0).is_err());
    }

    #[test]
    fn test_initial_value_is_clamped() {
        let field = BitField::with_direction("dac", 6, ShiftDirection::MsbFirst, 1000).unwrap();
        assert_eq!(field.value(), 63);

        let field = BitField::with_bit_order("dac", "1,0", 7).unwrap();
        assert_eq!(field.value(), 3);
    }

    #[test]
    fn test_bit_order_completeness() {
        assert!(parse_bit_order("x", "0,2").is_err());
        assert_eq!(parse_bit_order("x", "1,0").unwrap(), vec![1, 0]);
        assert_eq!(parse_bit_order("x", "2,0,1").unwrap(), vec![2, 0, 1]);
        assert!(parse_bit_order("x", "1,1").is_err());
        assert!(parse_bit_order("x", "1,,0").is_err());
        assert!(parse_bit_order("x", "").is_err());
        assert!(parse_bit_order("x", "1;0").is_err());
        assert!(parse_bit_order("x", "30").is_err());
    }

    #[test]
    fn test_bit_order_length_limit() {
        let long = (0..30).rev().map(|b| b.to_string()).collect::<Vec<_>>().join(",");
        assert_eq!(long.len(), 79);
        assert_eq!(parse_bit_order("x", &long).unwrap().len(), 30);

        let too_long = format!("{},", long);
        assert!(parse_bit_order("x", &too_long).is_err());
    }

    #[test]
    fn test_set_value_range() {
        let mut field = BitField::with_direction("v", 4, ShiftDirection::LsbFirst, 0).unwrap();
        assert!(field.set_value("v", 16).is_err());
        assert_eq!(field.value(), 0);
        field.set_value("v", 15).unwrap();
        assert_eq!(field.value(), 15);
    }

    #[test]
    fn test_append_bits_follows_order() {
        let field = BitField::with_bit_order("p", "0,2,1", 0b100).unwrap();
        let mut bits = Vec::new();
        field.append_bits(false, &mut bits);
        assert_eq!(bits, vec![false, true, false]);

        bits.clear();
        field.append_bits(true, &mut bits);
        assert_eq!(bits, vec![false, true, false]);

        let field = BitField::with_bit_order("p", "0,2,1", 0b001).unwrap();
        bits.clear();
        field.append_bits(true, &mut bits);
        assert_eq!(bits, vec![false, false, true]);
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("MSBFirst".parse::<ShiftDirection>().unwrap(), ShiftDirection::MsbFirst);
        assert_eq!("lsb_first".parse::<ShiftDirection>().unwrap(), ShiftDirection::LsbFirst);
        assert!("sideways".parse::<ShiftDirection>().is_err());
        assert_eq!(ShiftDirection::try_from(3).unwrap(), ShiftDirection::GlobalInvertedLsbFirst);
        assert!(ShiftDirection::try_from(4).is_err());
    }
}
