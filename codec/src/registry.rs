/*!
Ordered parameter registry and configuration bitstream generation.

The registry keeps the parameters of one configuration shift register in the
order they are shifted into the chip. Parameters are reachable by name and by
insertion index; lookups return `None` for unknown names or indices so that
drivers can look up optional parameters.
*/

use crate::bitfield::{BitField, ShiftDirection};
use crate::error::{CodecError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Ordered collection of named bit fields
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    parameters: IndexMap<String, BitField>,
}

impl ParameterRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter whose bits are shifted MSB or LSB first
    pub fn add_parameter(
        &mut self,
        name: &str,
        width: u32,
        direction: ShiftDirection,
        initial: u32,
    ) -> Result<()> {
        let field = BitField::with_direction(name, width, direction, initial);
        self.insert(name, field)
    }

    /// Append a parameter with an explicit comma separated bit order
    pub fn add_parameter_with_order(&mut self, name: &str, order: &str, initial: u32) -> Result<()> {
        let field = BitField::with_bit_order(name, order, initial);
        self.insert(name, field)
    }

    fn insert(&mut self, name: &str, field: Result<BitField>) -> Result<()> {
        if self.parameters.contains_key(name) {
            warn!("Rejecting parameter \"{}\": name already registered", name);
            return Err(CodecError::DuplicateParameter(name.to_string()));
        }
        let field = field.map_err(|e| {
            warn!("Rejecting parameter \"{}\": {}", name, e);
            e
        })?;
        debug!(
            "Registered parameter \"{}\" at index {} ({} bits, order {})",
            name,
            self.parameters.len(),
            field.width(),
            field.bit_order()
        );
        self.parameters.insert(name.to_string(), field);
        Ok(())
    }

    /// Remove all parameters
    pub fn clear(&mut self) {
        self.parameters.clear();
    }

    /// Number of registered parameters
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Total number of bits in the serialized stream
    pub fn total_bits(&self) -> usize {
        self.parameters.values().map(|f| f.width() as usize).sum()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.parameters.get_index_of(name)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.parameters.get_index(index).map(|(name, _)| name.as_str())
    }

    pub fn field(&self, name: &str) -> Option<&BitField> {
        self.parameters.get(name)
    }

    pub fn field_at(&self, index: usize) -> Option<&BitField> {
        self.parameters.get_index(index).map(|(_, field)| field)
    }

    pub fn get_parameter(&self, name: &str) -> Option<u32> {
        self.field(name).map(BitField::value)
    }

    pub fn get_parameter_at(&self, index: usize) -> Option<u32> {
        self.field_at(index).map(BitField::value)
    }

    pub fn get_parameter_width(&self, name: &str) -> Option<u32> {
        self.field(name).map(BitField::width)
    }

    pub fn get_parameter_width_at(&self, index: usize) -> Option<u32> {
        self.field_at(index).map(BitField::width)
    }

    pub fn get_parameter_bit_order(&self, name: &str) -> Option<String> {
        self.field(name).map(BitField::bit_order)
    }

    pub fn get_parameter_bit_order_at(&self, index: usize) -> Option<String> {
        self.field_at(index).map(BitField::bit_order)
    }

    /// Change the value of a parameter by name
    pub fn set_parameter(&mut self, name: &str, value: u32) -> Result<()> {
        let field = self.parameters.get_mut(name).ok_or_else(|| {
            warn!("Name \"{}\" was not found", name);
            CodecError::unknown_parameter(name)
        })?;
        field.set_value(name, value)
    }

    /// Change the value of a parameter by insertion index
    pub fn set_parameter_at(&mut self, index: usize, value: u32) -> Result<()> {
        let (name, field) = self.parameters.get_index_mut(index).ok_or_else(|| {
            warn!("Index {} out of range", index);
            CodecError::unknown_parameter(format!("index {}", index))
        })?;
        field.set_value(name, value)
    }

    /// Iterate over `(name, field)` pairs in serialization order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BitField)> {
        self.parameters.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Serialize all parameters into the bit sequence shifted into the chip.
    ///
    /// MSB-first scans every bit order front to back, LSB-first back to
    /// front. The globally inverted variants reverse the complete stream
    /// afterwards, for registers loaded from the opposite end.
    pub fn generate_bit_vector(&self, direction: ShiftDirection) -> Vec<bool> {
        let reverse = direction.base() == ShiftDirection::LsbFirst;
        let mut bits = Vec::with_capacity(self.total_bits());
        for field in self.parameters.values() {
            field.append_bits(reverse, &mut bits);
        }
        if direction.is_global_inverted() {
            bits.reverse();
        }
        bits
    }

    /// Build a registry from a declarative layout
    pub fn from_layout(layout: &RegisterLayout) -> Result<Self> {
        let mut registry = Self::new();
        for register in &layout.registers {
            match (&register.bit_order, register.bits) {
                (Some(order), None) => {
                    registry.add_parameter_with_order(&register.name, order, register.value)?
                }
                (None, Some(bits)) => registry.add_parameter(
                    &register.name,
                    bits,
                    register.direction.unwrap_or_default(),
                    register.value,
                )?,
                _ => {
                    return Err(CodecError::config(format!(
                        "register \"{}\" needs exactly one of `bits` or `bit_order`",
                        register.name
                    )))
                }
            }
        }
        Ok(registry)
    }

    /// Describe the registry as a layout, using explicit bit orders
    pub fn to_layout(&self) -> RegisterLayout {
        let registers = self
            .iter()
            .map(|(name, field)| RegisterSpec {
                name: name.to_string(),
                bits: None,
                direction: None,
                bit_order: Some(field.bit_order()),
                value: field.value(),
            })
            .collect();
        RegisterLayout { registers }
    }
}

/// Declarative description of a shift register, as stored in layout files
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegisterLayout {
    #[serde(default, rename = "register")]
    pub registers: Vec<RegisterSpec>,
}

/// One register entry of a [`RegisterLayout`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub name: String,

    /// Width in bits, used together with `direction`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<ShiftDirection>,

    /// Explicit comma separated bit order, used instead of `bits`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_order: Option<String>,

    #[serde(default)]
    pub value: u32,
}

impl RegisterLayout {
    /// Load a layout from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| {
            CodecError::config(format!(
                "failed to parse register layout {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Save the layout to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CodecError::config(format!("failed to serialize register layout: {}", e)))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_registry() -> ParameterRegistry {
        let mut registry = ParameterRegistry::new();
        registry.add_parameter("vnpix", 6, ShiftDirection::MsbFirst, 0b101100).unwrap();
        registry.add_parameter("blres", 4, ShiftDirection::LsbFirst, 0b0011).unwrap();
        registry.add_parameter_with_order("mixed", "1,0,2", 0b110).unwrap();
        registry
    }

    fn expansion(value: u32, width: u32, msb_first: bool) -> Vec<bool> {
        let bits: Vec<bool> = (0..width).map(|b| (value >> b) & 1 != 0).collect();
        if msb_first {
            bits.into_iter().rev().collect()
        } else {
            bits
        }
    }

    #[test]
    fn test_single_parameter_binary_expansion() {
        for width in 1..=30u32 {
            for &initial in &[0u32, 1, 5, 0x2AAA_AAAA, u32::MAX] {
                let expected = initial.min((1u32 << width) - 1);
                for &direction in &[ShiftDirection::MsbFirst, ShiftDirection::LsbFirst] {
                    let mut registry = ParameterRegistry::new();
                    registry.add_parameter("p", width, direction, initial).unwrap();
                    let bits = registry.generate_bit_vector(ShiftDirection::MsbFirst);
                    assert_eq!(bits.len(), width as usize);
                    assert_eq!(
                        bits,
                        expansion(expected, width, direction == ShiftDirection::MsbFirst)
                    );
                }
            }
        }
    }

    #[test]
    fn test_lsb_serialization_reverses_each_parameter() {
        let registry = sample_registry();
        let msb = registry.generate_bit_vector(ShiftDirection::MsbFirst);
        let lsb = registry.generate_bit_vector(ShiftDirection::LsbFirst);
        assert_eq!(msb.len(), 13);
        assert_eq!(lsb.len(), 13);

        let mut expected: Vec<bool> = Vec::new();
        expected.extend(msb[0..6].iter().rev());
        expected.extend(msb[6..10].iter().rev());
        expected.extend(msb[10..13].iter().rev());
        assert_eq!(lsb, expected);
    }

    #[test]
    fn test_global_inversion_reverses_whole_stream() {
        let registry = sample_registry();
        let mut msb = registry.generate_bit_vector(ShiftDirection::MsbFirst);
        msb.reverse();
        assert_eq!(msb, registry.generate_bit_vector(ShiftDirection::GlobalInvertedMsbFirst));

        let mut lsb = registry.generate_bit_vector(ShiftDirection::LsbFirst);
        lsb.reverse();
        assert_eq!(lsb, registry.generate_bit_vector(ShiftDirection::GlobalInvertedLsbFirst));
    }

    #[test]
    fn test_rejected_parameters_leave_registry_unchanged() {
        let mut registry = sample_registry();
        assert!(registry.add_parameter("bad", 0, ShiftDirection::MsbFirst, 0).is_err());
        assert!(registry.add_parameter_with_order("hole", "0,2", 0).is_err());
        assert!(matches!(
            registry.add_parameter("vnpix", 3, ShiftDirection::MsbFirst, 0),
            Err(CodecError::DuplicateParameter(_))
        ));
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get_parameter("vnpix"), Some(0b101100));
        assert!(registry.add_parameter_with_order("ok", "1,0", 0).is_ok());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_lookups() {
        let registry = sample_registry();
        assert_eq!(registry.index_of("blres"), Some(1));
        assert_eq!(registry.name(2), Some("mixed"));
        assert_eq!(registry.name(3), None);
        assert_eq!(registry.index_of("missing"), None);
        assert_eq!(registry.get_parameter_at(1), Some(3));
        assert_eq!(registry.get_parameter_width("mixed"), Some(3));
        assert_eq!(registry.get_parameter_width_at(9), None);
        assert_eq!(registry.get_parameter_bit_order("blres").as_deref(), Some("0,1,2,3"));
        assert_eq!(registry.get_parameter_bit_order_at(2).as_deref(), Some("1,0,2"));
        assert_eq!(registry.get_parameter("missing"), None);
    }

    #[test]
    fn test_set_parameter_range() {
        let mut registry = sample_registry();
        assert!(registry.set_parameter("blres", 16).is_err());
        assert_eq!(registry.get_parameter("blres"), Some(3));
        registry.set_parameter("blres", 15).unwrap();
        assert_eq!(registry.get_parameter("blres"), Some(15));

        assert!(registry.set_parameter("missing", 1).is_err());
        assert!(registry.set_parameter_at(7, 1).is_err());
        registry.set_parameter_at(0, 63).unwrap();
        assert_eq!(registry.get_parameter_at(0), Some(63));
        assert!(registry.set_parameter_at(0, 64).is_err());
    }

    #[test]
    fn test_clear() {
        let mut registry = sample_registry();
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.generate_bit_vector(ShiftDirection::MsbFirst).is_empty());
        registry.add_parameter("vnpix", 2, ShiftDirection::MsbFirst, 1).unwrap();
        assert_eq!(registry.index_of("vnpix"), Some(0));
    }

    #[test]
    fn test_layout_file_roundtrip() {
        let registry = sample_registry();
        let layout = registry.to_layout();

        let temp_file = NamedTempFile::new().unwrap();
        layout.save_to_file(temp_file.path()).unwrap();
        let loaded = RegisterLayout::load_from_file(temp_file.path()).unwrap();
        assert_eq!(layout, loaded);

        let rebuilt = ParameterRegistry::from_layout(&loaded).unwrap();
        assert_eq!(
            rebuilt.generate_bit_vector(ShiftDirection::MsbFirst),
            registry.generate_bit_vector(ShiftDirection::MsbFirst)
        );
    }

    #[test]
    fn test_layout_from_toml_text() {
        let text = r#"
            [[register]]
            name = "vn"
            bits = 6
            direction = "lsb-first"
            value = 10

            [[register]]
            name = "ordered"
            bit_order = "2,1,0"
            value = 4
        "#;
        let layout: RegisterLayout = toml::from_str(text).unwrap();
        let registry = ParameterRegistry::from_layout(&layout).unwrap();
        assert_eq!(registry.get_parameter_bit_order("vn").as_deref(), Some("0,1,2,3,4,5"));
        assert_eq!(registry.get_parameter("ordered"), Some(4));

        let ambiguous = RegisterLayout {
            registers: vec![RegisterSpec {
                name: "x".to_string(),
                bits: Some(2),
                direction: None,
                bit_order: Some("1,0".to_string()),
                value: 0,
            }],
        };
        assert!(ParameterRegistry::from_layout(&ambiguous).is_err());
    }
}
