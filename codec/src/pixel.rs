/*!
Bit-packed pixel latch records.

A [`PixelCell`] stores one pixel's latches exactly as the chip does. The
chip-specific views in this module give names to the sub-fields of a cell;
their bit offsets are fixed by the silicon and must not be rearranged.
*/

use crate::error::{CodecError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Widest latch record supported by a cell
pub const MAX_LATCH_BITS: u8 = 64;

/// One pixel's latches, `width` bits wide
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
pub struct PixelCell {
    latches: u64,
    width: u8,
}

impl PixelCell {
    /// Create a cell holding `latches`, truncated to `width` bits
    pub fn new(width: u8, latches: u64) -> Self {
        let width = width.min(MAX_LATCH_BITS);
        Self {
            latches: latches & Self::mask_for(width),
            width,
        }
    }

    /// A cell with every latch cleared
    pub fn zeroed(width: u8) -> Self {
        Self::new(width, 0)
    }

    fn mask_for(width: u8) -> u64 {
        if width >= 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        }
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn latches(&self) -> u64 {
        self.latches
    }

    /// Overwrite all latches at once
    pub fn set_latches(&mut self, latches: u64) {
        self.latches = latches & Self::mask_for(self.width);
    }

    pub fn get_bit(&self, index: u8) -> bool {
        index < self.width && (self.latches >> index) & 0x1 != 0
    }

    /// Set or clear a single latch; indices beyond the width are ignored
    pub fn set_bit(&mut self, index: u8, value: bool) {
        if index >= self.width {
            return;
        }
        if value {
            self.latches |= 1 << index;
        } else {
            self.latches &= !(1 << index);
        }
    }

    /// Clear `field_width` bits starting at `offset`, then write the low
    /// bits of `value` there. Bits outside the span are never touched.
    pub fn set_masked_subfield(&mut self, offset: u8, field_width: u8, value: u64) {
        if offset >= self.width.min(64) {
            return;
        }
        let span = Self::mask_for(field_width) << offset;
        let span = span & Self::mask_for(self.width);
        self.latches = (self.latches & !span) | ((value << offset) & span);
    }

    /// Read `field_width` bits starting at `offset`; zero beyond the width
    pub fn get_subfield(&self, offset: u8, field_width: u8) -> u64 {
        if offset >= self.width.min(64) {
            return 0;
        }
        (self.latches >> offset) & Self::mask_for(field_width)
    }
}

impl PartialEq for PixelCell {
    fn eq(&self, other: &Self) -> bool {
        self.latches == other.latches
    }
}

impl fmt::Display for PixelCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$b}", self.latches, width = self.width as usize)
    }
}

/// CLICTD pixel layouts (22-bit latch records, two configuration stages)
pub mod clictd {
    use super::*;

    pub const PIXEL_BITS: u8 = 22;

    /// Bit 21 of every configuration record is always set
    pub const CONFIG_BASE: u64 = 0x0020_0000;

    /// Stage 1 default: all eight front-ends masked
    pub const STAGE1_MASKED: u64 = 0x0020_01FE;

    /// Number of analog front-ends per pixel
    pub const FRONTENDS: u8 = 8;

    /// Stage 1 record:
    /// `( 1 | tDAC1[0] | tDAC0[3] | tpEnA[8] | mask[8] | tpEnD )`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Stage1(PixelCell);

    impl Stage1 {
        pub fn masked() -> Self {
            Self(PixelCell::new(PIXEL_BITS, STAGE1_MASKED))
        }

        /// Build a stage 1 record; only the first two thresholds are used
        pub fn new(mask: u8, tp_digital: bool, tp_analog: u8, thresholds: &[u8]) -> Result<Self> {
            if thresholds.len() < 2 {
                return Err(CodecError::config(format!(
                    "stage 1 needs at least 2 threshold settings, got {}",
                    thresholds.len()
                )));
            }
            let mut stage = Self::masked();
            stage.set_mask(mask);
            stage.enable_testpulse_digital(tp_digital);
            stage.enable_testpulse_analog(tp_analog);
            stage.set_threshold0(thresholds[0]);
            stage.set_threshold1_lsb(thresholds[1]);
            Ok(stage)
        }

        pub fn set_mask(&mut self, mask: u8) {
            self.0.set_masked_subfield(1, 8, mask as u64);
        }

        pub fn mask(&self) -> u8 {
            self.0.get_subfield(1, 8) as u8
        }

        pub fn enable_testpulse_digital(&mut self, enable: bool) {
            self.0.set_bit(0, enable);
        }

        pub fn testpulse_digital(&self) -> bool {
            self.0.get_bit(0)
        }

        pub fn enable_testpulse_analog(&mut self, enable: u8) {
            self.0.set_masked_subfield(9, 8, enable as u64);
        }

        pub fn testpulse_analog(&self) -> u8 {
            self.0.get_subfield(9, 8) as u8
        }

        pub fn set_threshold0(&mut self, threshold: u8) {
            self.0.set_masked_subfield(17, 3, (threshold & 0x07) as u64);
        }

        pub fn threshold0(&self) -> u8 {
            self.0.get_subfield(17, 3) as u8
        }

        /// Front-end 1 keeps only its least significant trim bit in stage 1
        pub fn set_threshold1_lsb(&mut self, threshold: u8) {
            self.0.set_bit(20, threshold & 0x1 != 0);
        }

        pub fn threshold1_lsb(&self) -> bool {
            self.0.get_bit(20)
        }

        pub fn cell(&self) -> PixelCell {
            self.0
        }
    }

    impl Default for Stage1 {
        fn default() -> Self {
            Self::masked()
        }
    }

    /// Stage 2 record:
    /// `( 1 | tDAC7[3] .. tDAC2[3] | tDAC1[2:1] | 0 )`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Stage2(PixelCell);

    impl Stage2 {
        pub fn empty() -> Self {
            Self(PixelCell::new(PIXEL_BITS, CONFIG_BASE))
        }

        /// Build a stage 2 record from 8 thresholds (front-end 0 is ignored)
        /// or 7 thresholds (front-ends 1 to 7).
        pub fn new(thresholds: &[u8]) -> Result<Self> {
            let skip = match thresholds.len() {
                8 => 1,
                7 => 0,
                other => {
                    return Err(CodecError::config(format!(
                        "stage 2 needs 7 or 8 threshold settings, got {}",
                        other
                    )))
                }
            };
            let mut stage = Self::empty();
            for (frontend, &threshold) in (1..FRONTENDS).zip(thresholds.iter().skip(skip)) {
                stage.set_threshold(frontend, threshold)?;
            }
            Ok(stage)
        }

        /// Set the trim of front-ends 1 to 7; front-end 1 only stores its two
        /// upper bits here.
        pub fn set_threshold(&mut self, frontend: u8, threshold: u8) -> Result<()> {
            let value = (threshold & 0x07) as u64;
            match frontend {
                1 => self.0.set_masked_subfield(1, 2, value >> 1),
                2..=7 => self.0.set_masked_subfield((frontend - 1) * 3, 3, value),
                _ => {
                    return Err(CodecError::config(format!(
                        "front-end {} has no stage 2 threshold",
                        frontend
                    )))
                }
            }
            Ok(())
        }

        /// Trim of front-ends 2 to 7
        pub fn threshold(&self, frontend: u8) -> Option<u8> {
            match frontend {
                2..=7 => Some(self.0.get_subfield((frontend - 1) * 3, 3) as u8),
                _ => None,
            }
        }

        pub fn threshold1_msbs(&self) -> u8 {
            self.0.get_subfield(1, 2) as u8
        }

        pub fn cell(&self) -> PixelCell {
            self.0
        }
    }

    impl Default for Stage2 {
        fn default() -> Self {
            Self::empty()
        }
    }

    /// Both configuration stages of one CLICTD pixel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PixelConfig {
        pub stage1: Stage1,
        pub stage2: Stage2,
    }

    impl PixelConfig {
        pub fn new(mask: u8, tp_digital: bool, tp_analog: u8, thresholds: &[u8; 8]) -> Result<Self> {
            Ok(Self {
                stage1: Stage1::new(mask, tp_digital, tp_analog, thresholds)?,
                stage2: Stage2::new(thresholds)?,
            })
        }

        /// Set the trim of any front-end. Front-end 1 is split over both
        /// stages: bit 0 goes to stage 1, bits 1 and 2 to stage 2.
        pub fn set_threshold(&mut self, frontend: u8, threshold: u8) -> Result<()> {
            match frontend {
                0 => self.stage1.set_threshold0(threshold),
                1 => {
                    self.stage1.set_threshold1_lsb(threshold);
                    self.stage2.set_threshold(1, threshold)?;
                }
                _ => self.stage2.set_threshold(frontend, threshold)?,
            }
            Ok(())
        }

        pub fn threshold(&self, frontend: u8) -> Option<u8> {
            match frontend {
                0 => Some(self.stage1.threshold0()),
                1 => Some((self.stage2.threshold1_msbs() << 1) | self.stage1.threshold1_lsb() as u8),
                _ => self.stage2.threshold(frontend),
            }
        }

        /// Whether any front-end of the pixel is masked
        pub fn is_masked(&self) -> bool {
            self.stage1.mask() != 0
        }
    }

    /// Decoded CLICTD pixel data
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readout {
        cell: PixelCell,
        long_counter: bool,
    }

    impl Readout {
        pub fn new(latches: u64, long_counter: bool) -> Self {
            Self {
                cell: PixelCell::new(PIXEL_BITS, latches),
                long_counter,
            }
        }

        pub fn from_cell(cell: PixelCell, long_counter: bool) -> Self {
            Self::new(cell.latches(), long_counter)
        }

        pub fn flag(&self) -> bool {
            self.cell.get_bit(21)
        }

        pub fn set_flag(&mut self, flag: bool) {
            self.cell.set_bit(21, flag);
        }

        /// Time over threshold (5 bits); not available with the long counter
        pub fn tot(&self) -> Option<u8> {
            if self.long_counter {
                None
            } else {
                Some(self.cell.get_subfield(16, 5) as u8)
            }
        }

        pub fn set_tot(&mut self, tot: u8) {
            self.cell.set_masked_subfield(16, 5, tot as u64);
        }

        /// Time of arrival: 13 bits with the long counter, 8 bits otherwise
        pub fn toa(&self) -> u16 {
            self.cell.get_subfield(8, self.counter_bits()) as u16
        }

        pub fn set_toa(&mut self, toa: u16) {
            self.cell.set_masked_subfield(8, self.counter_bits(), toa as u64);
        }

        fn counter_bits(&self) -> u8 {
            if self.long_counter {
                13
            } else {
                8
            }
        }

        pub fn hits(&self) -> u8 {
            self.cell.get_subfield(0, 8) as u8
        }

        pub fn set_hits(&mut self, hits: u8) {
            self.cell.set_masked_subfield(0, 8, hits as u64);
        }

        pub fn long_counter(&self) -> bool {
            self.long_counter
        }

        pub fn cell(&self) -> PixelCell {
            self.cell
        }
    }

    impl fmt::Display for Readout {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.flag() as u8)?;
            if let Some(tot) = self.tot() {
                write!(f, ",{}", tot)?;
            }
            write!(f, ",{}", self.toa())
        }
    }
}

/// CLICpix2 pixel layouts (14-bit latch records)
pub mod clicpix2 {
    use super::*;

    pub const PIXEL_BITS: u8 = 14;

    /// Configuration record:
    /// `( mask | x | x | x | thr[4] | x | x | x | x | cntmode | tpen | longcnt | x )`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PixelConfig(PixelCell);

    impl PixelConfig {
        pub fn empty() -> Self {
            Self(PixelCell::zeroed(PIXEL_BITS))
        }

        pub fn new(mask: bool, threshold: u8, counting_mode: bool, testpulse: bool, long_counter: bool) -> Self {
            let mut px = Self::empty();
            px.set_mask(mask);
            px.set_threshold(threshold);
            px.set_counting_mode(counting_mode);
            px.enable_testpulse(testpulse);
            px.set_long_counter(long_counter);
            px
        }

        pub fn set_mask(&mut self, mask: bool) {
            self.0.set_bit(13, mask);
        }

        pub fn mask(&self) -> bool {
            self.0.get_bit(13)
        }

        /// Individual threshold adjustment (4 bits)
        pub fn set_threshold(&mut self, threshold: u8) {
            self.0.set_masked_subfield(8, 4, threshold as u64);
        }

        pub fn threshold(&self) -> u8 {
            self.0.get_subfield(8, 4) as u8
        }

        pub fn set_counting_mode(&mut self, enable: bool) {
            self.0.set_bit(3, enable);
        }

        pub fn counting_mode(&self) -> bool {
            self.0.get_bit(3)
        }

        pub fn enable_testpulse(&mut self, enable: bool) {
            self.0.set_bit(2, enable);
        }

        pub fn testpulse(&self) -> bool {
            self.0.get_bit(2)
        }

        /// 13-bit ToA only
        pub fn set_long_counter(&mut self, enable: bool) {
            self.0.set_bit(1, enable);
        }

        pub fn long_counter(&self) -> bool {
            self.0.get_bit(1)
        }

        pub fn cell(&self) -> PixelCell {
            self.0
        }
    }

    impl Default for PixelConfig {
        fn default() -> Self {
            Self::empty()
        }
    }

    /// Read-back of a configuration record in the configuration's terms.
    ///
    /// The flag latch reads back as `mask | threshold[0]`, so with threshold
    /// bit 0 set it carries no mask information and takes the configured mask.
    pub fn align_readback(configured: PixelCell, readback: PixelCell) -> PixelCell {
        let mut aligned = readback;
        if readback.get_bit(8) {
            aligned.set_bit(13, configured.get_bit(13));
        }
        aligned
    }

    /// Decoded CLICpix2 pixel data
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readout(PixelCell);

    impl Readout {
        pub fn new(latches: u64) -> Self {
            Self(PixelCell::new(PIXEL_BITS, latches))
        }

        pub fn flag(&self) -> bool {
            self.0.get_bit(13)
        }

        pub fn set_flag(&mut self, flag: bool) {
            self.0.set_bit(13, flag);
        }

        pub fn tot(&self) -> u8 {
            self.0.get_subfield(8, 5) as u8
        }

        pub fn set_tot(&mut self, tot: u8) {
            self.0.set_masked_subfield(8, 5, tot as u64);
        }

        pub fn toa(&self) -> u8 {
            self.0.get_subfield(0, 8) as u8
        }

        pub fn set_toa(&mut self, toa: u8) {
            self.0.set_masked_subfield(0, 8, toa as u64);
        }

        pub fn cell(&self) -> PixelCell {
            self.0
        }
    }
}
