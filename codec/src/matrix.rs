/*!
Pixel matrix serialization into the chip's loading order.

[`MatrixProgrammer`] turns one [`PixelMatrix`] per configuration stage into
the register writes that shift the configuration into the chip. Two loading
orders are supported, selected by the chip's [`MatrixLayout`]:

- row/bit/column: for every row and every bit (MSB first) one data word is
  built from that bit of each column's cell, then latched with a control
  pulse;
- snake: a flat bit sequence running through double columns with padding
  flip-flops, packed eight bits per transmitted byte.
*/

use crate::chip::{ChipDescriptor, MatrixLayout};
use crate::coordinates::PixelMatrix;
use crate::error::{CodecError, Result};
use crate::pixel::PixelCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Control register flag that shifts the data word into the matrix
pub const CONTROL_SHIFT: u8 = 0x10;

/// One byte written to a chip register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWrite {
    pub address: u8,
    pub value: u8,
}

impl RegisterWrite {
    pub fn new(address: u8, value: u8) -> Self {
        Self { address, value }
    }
}

/// Chip-wide data word for one (stage, row, bit) combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigWord {
    pub stage: usize,
    pub row: u16,
    pub bit: u8,
    /// Bit `n` holds the value of column `n`
    pub data: u32,
}

/// Register writes for one configuration stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageProgram {
    pub stage: usize,
    /// Number of configuration bits shifted into the matrix
    pub bit_count: usize,
    pub writes: Vec<RegisterWrite>,
}

/// Complete programming sequence for a chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixProgram {
    pub stages: Vec<StageProgram>,
}

impl MatrixProgram {
    pub fn total_writes(&self) -> usize {
        self.stages.iter().map(|s| s.writes.len()).sum()
    }
}

/// Configuration of every stage of a chip's pixel matrix
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixConfig {
    pub stages: Vec<PixelMatrix>,
}

impl MatrixConfig {
    /// Empty configuration whose pixels all read as the chip's defaults
    pub fn default_for(chip: &ChipDescriptor) -> Self {
        let width = chip.pixel_bits();
        let stages = chip
            .stage_defaults
            .iter()
            .map(|&latches| PixelMatrix::with_fill(PixelCell::new(width, latches)))
            .collect();
        Self { stages }
    }

    /// Single-stage configuration
    pub fn single(matrix: PixelMatrix) -> Self {
        Self {
            stages: vec![matrix],
        }
    }

    pub fn stage(&self, stage: usize) -> Option<&PixelMatrix> {
        self.stages.get(stage)
    }

    pub fn stage_mut(&mut self, stage: usize) -> Option<&mut PixelMatrix> {
        self.stages.get_mut(stage)
    }
}

/// Pack bits into bytes, first bit into the least significant position.
/// A trailing partial byte is zero padded.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &bit)| byte | ((bit as u8) << i))
        })
        .collect()
}

/// Serializes pixel matrices in a chip's loading order
#[derive(Debug, Clone)]
pub struct MatrixProgrammer {
    layout: MatrixLayout,
}

impl MatrixProgrammer {
    pub fn new(layout: MatrixLayout) -> Self {
        Self { layout }
    }

    pub fn for_chip(chip: &ChipDescriptor) -> Self {
        Self::new(chip.matrix)
    }

    pub fn layout(&self) -> &MatrixLayout {
        &self.layout
    }

    /// Build the programming sequence for all stages of `config`
    pub fn program(&self, config: &MatrixConfig) -> Result<MatrixProgram> {
        let expected = self.layout.stages();
        if config.stages.len() != expected {
            return Err(CodecError::config(format!(
                "matrix configuration has {} stage(s), chip needs {}",
                config.stages.len(),
                expected
            )));
        }

        let stages = config
            .stages
            .iter()
            .enumerate()
            .map(|(stage, matrix)| self.program_stage(stage, matrix))
            .collect();
        Ok(MatrixProgram { stages })
    }

    /// Build the register writes for one configuration stage
    pub fn program_stage(&self, stage: usize, matrix: &PixelMatrix) -> StageProgram {
        match self.layout {
            MatrixLayout::RowBitColumn {
                columns,
                rows,
                pixel_bits,
                data_lsb,
                data_msb,
                control,
                ..
            } => {
                let stage_flag = Self::stage_flag(stage);
                let words = self.config_words(stage, matrix);
                let mut writes = Vec::with_capacity(words.len() * 4 + 2);

                // Enter configuration mode for this stage
                writes.push(RegisterWrite::new(control, stage_flag));
                for word in &words {
                    writes.push(RegisterWrite::new(data_lsb, (word.data & 0xFF) as u8));
                    writes.push(RegisterWrite::new(data_msb, ((word.data >> 8) & 0xFF) as u8));
                    writes.push(RegisterWrite::new(control, CONTROL_SHIFT | stage_flag));
                    writes.push(RegisterWrite::new(control, stage_flag));
                }
                // Back to readout mode
                writes.push(RegisterWrite::new(control, 0x00));

                debug!(
                    "Stage {}: {} configuration words, {} register writes",
                    stage + 1,
                    words.len(),
                    writes.len()
                );
                StageProgram {
                    stage,
                    bit_count: columns as usize * rows as usize * pixel_bits as usize,
                    writes,
                }
            }
            MatrixLayout::Snake { register, .. } => {
                let bits = self.snake_bits(matrix);
                let writes = pack_bits(&bits)
                    .into_iter()
                    .map(|byte| RegisterWrite::new(register, byte))
                    .collect::<Vec<_>>();
                debug!("Number of matrix programming bytes: {}", writes.len());
                StageProgram {
                    stage,
                    bit_count: bits.len(),
                    writes,
                }
            }
        }
    }

    /// Control register value selecting a configuration stage
    fn stage_flag(stage: usize) -> u8 {
        (stage + 1) as u8
    }

    /// Data words of the row/bit/column order: rows ascending, bits from
    /// MSB to LSB, one bit per column in the word. Empty for other layouts.
    pub fn config_words(&self, stage: usize, matrix: &PixelMatrix) -> Vec<ConfigWord> {
        let MatrixLayout::RowBitColumn {
            columns,
            rows,
            pixel_bits,
            ..
        } = self.layout
        else {
            return Vec::new();
        };

        let mut words = Vec::with_capacity(rows as usize * pixel_bits as usize);
        for row in 0..rows {
            for bit in (0..pixel_bits).rev() {
                let data = (0..columns).fold(0u32, |data, column| {
                    data | ((matrix.get(column, row).get_bit(bit) as u32) << column)
                });
                words.push(ConfigWord {
                    stage,
                    row,
                    bit,
                    data,
                });
            }
        }
        words
    }

    /// Rebuild a stage matrix from the data words latched in order, as the
    /// chip's shift register sees them. Missing words leave zero bits.
    pub fn reassemble_words(&self, data: &[u32]) -> PixelMatrix {
        let (columns, rows, pixel_bits) = (
            self.layout.columns(),
            self.layout.rows(),
            self.layout.pixel_bits(),
        );
        let expected = rows as usize * pixel_bits as usize;
        if data.len() != expected {
            warn!(
                "Received {} configuration words, expected {}",
                data.len(),
                expected
            );
        }

        let mut cells = vec![PixelCell::zeroed(pixel_bits); columns as usize * rows as usize];
        let bit_slots = (0..rows).flat_map(|row| (0..pixel_bits).rev().map(move |bit| (row, bit)));
        for (&word, (row, bit)) in data.iter().zip(bit_slots) {
            for column in 0..columns {
                let index = column as usize * rows as usize + row as usize;
                cells[index].set_bit(bit, (word >> column) & 0x1 != 0);
            }
        }

        let mut matrix = PixelMatrix::new(pixel_bits);
        for column in 0..columns {
            for row in 0..rows {
                matrix.insert(column, row, cells[column as usize * rows as usize + row as usize]);
            }
        }
        matrix
    }

    /// Flat bit sequence of the snake order. Empty for other layouts.
    ///
    /// One padding block (one bit per double column) precedes everything,
    /// another precedes every `superpixel_rows` rows, and a final block
    /// clears the matrix after readout. Within a row both pixels of every
    /// double column are sent, alternating with row parity.
    pub fn snake_bits(&self, matrix: &PixelMatrix) -> Vec<bool> {
        let MatrixLayout::Snake {
            double_columns,
            rows,
            pixel_bits,
            superpixel_rows,
            ..
        } = self.layout
        else {
            return Vec::new();
        };

        let padding = double_columns as usize;
        let mut bits = Vec::with_capacity(self.snake_bit_count());

        // End-of-column flip-flops
        bits.resize(bits.len() + padding, false);

        for row in 0..rows {
            if superpixel_rows > 0 && row % superpixel_rows == 0 {
                bits.resize(bits.len() + padding, false);
                debug!(
                    "Add superpixel flipflop for all double columns (matrix: {}b)",
                    bits.len()
                );
            }

            for sub_column in 0..2u16 {
                for bit in (0..pixel_bits).rev() {
                    for double_column in 0..double_columns {
                        let column = 2 * double_column + (row + sub_column) % 2;
                        bits.push(matrix.get(column, row).get_bit(bit));
                    }
                }
            }
        }
        debug!("Full matrix size: {}b", bits.len());

        // Blank the matrix after readout
        bits.resize(bits.len() + padding, false);
        debug!("Full matrix size incl. clear: {}b", bits.len());
        bits
    }

    /// Rebuild the matrix from the packed snake bytes as the chip's shift
    /// register sees them. Padding blocks are skipped, missing bits read as 0.
    pub fn reassemble_snake(&self, bytes: &[u8]) -> PixelMatrix {
        let MatrixLayout::Snake {
            double_columns,
            rows,
            pixel_bits,
            superpixel_rows,
            ..
        } = self.layout
        else {
            return PixelMatrix::new(self.layout.pixel_bits());
        };

        let expected = self.snake_bit_count().div_ceil(8);
        if bytes.len() != expected {
            warn!("Received {} matrix bytes, expected {}", bytes.len(), expected);
        }
        let bit_at = |index: usize| bytes.get(index / 8).is_some_and(|byte| (byte >> (index % 8)) & 0x1 != 0);

        let padding = double_columns as usize;
        let columns = double_columns * 2;
        let mut cells = vec![PixelCell::zeroed(pixel_bits); columns as usize * rows as usize];
        let mut position = padding;
        for row in 0..rows {
            if superpixel_rows > 0 && row % superpixel_rows == 0 {
                position += padding;
            }
            for sub_column in 0..2u16 {
                for bit in (0..pixel_bits).rev() {
                    for double_column in 0..double_columns {
                        let column = 2 * double_column + (row + sub_column) % 2;
                        let index = column as usize * rows as usize + row as usize;
                        cells[index].set_bit(bit, bit_at(position));
                        position += 1;
                    }
                }
            }
        }

        let mut matrix = PixelMatrix::new(pixel_bits);
        for column in 0..columns {
            for row in 0..rows {
                matrix.insert(column, row, cells[column as usize * rows as usize + row as usize]);
            }
        }
        matrix
    }

    /// Length of the snake bit sequence for this layout
    pub fn snake_bit_count(&self) -> usize {
        match self.layout {
            MatrixLayout::Snake {
                double_columns,
                rows,
                pixel_bits,
                superpixel_rows,
                ..
            } => {
                let padding = double_columns as usize;
                let blocks = if superpixel_rows == 0 {
                    0
                } else {
                    (rows as usize).div_ceil(superpixel_rows as usize)
                };
                padding * (2 + blocks) + rows as usize * 2 * pixel_bits as usize * padding
            }
            MatrixLayout::RowBitColumn { .. } => 0,
        }
    }
}
