/*!
SerDes packet frames.

Chips with a serial readout link send their matrix as packets of 9-bit
symbols, two per 32-bit word:

```text
bit 17      control flag, first symbol
bit 16      control flag, second symbol
bits 15..8  first symbol
bits 7..0   second symbol
```

A packet is a header byte, the interleaved bits of `2^rcr` double columns and
a delimiter control symbol. Bit `k` of every data byte (least significant
first) belongs to double column `k % 2^rcr` of the packet. Within a double
column the pixels run in a snake through both columns, each super-pixel is
preceded by one super-pixel bit and the column by one flag bit. With
compression enabled a cleared flag, super-pixel or first pixel bit stands for
an empty column, super-pixel or pixel.

[`PacketDecoder`] handles both compression modes, [`PacketEncoder`] writes
the uncompressed form used for configuration read-back.
*/

use crate::chip::{ChipDescriptor, PacketLayout};
use crate::coordinates::PixelMatrix;
use crate::error::{CodecError, Result};
use crate::pixel::PixelCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Number of parallel double columns selected by the encoder by default
pub const DEFAULT_RCR: u8 = 3;

/// Header bits carrying the first double column of a packet
const FIRST_COLUMN_MASK: u8 = 0x1F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Symbol {
    control: bool,
    byte: u8,
}

impl Symbol {
    fn data(byte: u8) -> Self {
        Self { control: false, byte }
    }

    fn control(byte: u8) -> Self {
        Self { control: true, byte }
    }
}

fn unpack_symbols(words: &[u32]) -> Vec<Symbol> {
    words
        .iter()
        .flat_map(|&word| {
            [
                Symbol {
                    control: (word >> 17) & 0x1 != 0,
                    byte: (word >> 8) as u8,
                },
                Symbol {
                    control: (word >> 16) & 0x1 != 0,
                    byte: word as u8,
                },
            ]
        })
        .collect()
}

fn pack_symbols(symbols: &[Symbol]) -> Vec<u32> {
    symbols
        .chunks(2)
        .map(|pair| {
            let (first, second) = (pair[0], pair.get(1).copied().unwrap_or(pair[0]));
            (u32::from(first.control) << 17)
                | (u32::from(second.control) << 16)
                | (u32::from(first.byte) << 8)
                | u32::from(second.byte)
        })
        .collect()
}

/// Compression settings of the readout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketOptions {
    /// Empty pixels are sent as a single cleared bit
    pub pixel_compression: bool,
    /// Empty double columns and super-pixels are sent as a single cleared bit
    pub column_compression: bool,
}

fn overrun(pixels: usize) -> CodecError {
    CodecError::packet(format!("double column overruns its {} pixels", pixels))
}

/// Decoding state of one double column
#[derive(Debug, Clone)]
struct DoubleColumn {
    /// Bits accounted for so far; `total + 1` before the column flag
    counter: usize,
    /// Bits of the current super-pixel, 0 when the super-pixel bit is next
    superpixel: usize,
    row: usize,
    slice: i16,
    pixels: Vec<u64>,
}

impl DoubleColumn {
    fn new(layout: &PacketLayout) -> Self {
        Self {
            counter: layout.double_column_bits() + 1,
            superpixel: 0,
            row: 0,
            slice: layout.pixel_bits as i16 - 1,
            pixels: vec![0; 2 * layout.rows as usize],
        }
    }

    fn is_complete(&self, layout: &PacketLayout) -> bool {
        self.counter == layout.double_column_bits()
    }

    fn clear_pixels(&mut self, count: usize) -> Result<()> {
        let length = self.pixels.len();
        for _ in 0..count {
            *self.pixels.get_mut(self.row).ok_or_else(|| overrun(length))? = 0;
            self.row += 1;
        }
        Ok(())
    }

    fn set_bit(&mut self, bit: bool, layout: &PacketLayout) -> Result<()> {
        let (slice, length) = (self.slice, self.pixels.len());
        let pixel = self.pixels.get_mut(self.row).ok_or_else(|| overrun(length))?;
        if bit {
            *pixel |= 1u64 << slice;
        }
        self.slice -= 1;
        if self.slice < 0 {
            self.row += 1;
            self.slice = layout.pixel_bits as i16 - 1;
        }
        Ok(())
    }

    fn push(&mut self, bit: bool, layout: &PacketLayout, options: PacketOptions) -> Result<()> {
        let total = layout.double_column_bits();
        let pixel_bits = layout.pixel_bits as usize;
        let superpixel_pixels = layout.superpixel_pixels as usize;
        let superpixel_bits = superpixel_pixels * pixel_bits;

        if self.counter < total {
            if self.superpixel == 0 {
                if bit || !options.column_compression {
                    self.counter += 1;
                    self.superpixel += 1;
                } else {
                    self.clear_pixels(superpixel_pixels)?;
                    self.counter += superpixel_bits + 1;
                }
            } else if self.slice == pixel_bits as i16 - 1 && !bit && options.pixel_compression {
                self.clear_pixels(1)?;
                self.counter += pixel_bits;
                self.superpixel += pixel_bits;
            } else {
                self.set_bit(bit, layout)?;
                self.counter += 1;
                self.superpixel += 1;
            }

            if self.superpixel > superpixel_bits {
                self.superpixel = 0;
            }
        } else if self.counter == total + 1 {
            if bit || !options.column_compression {
                self.counter = 0;
            } else {
                self.clear_pixels(self.pixels.len())?;
                self.counter = total;
            }
        }
        // Bits after a completed column are padding
        Ok(())
    }
}

/// Position of the `index`-th pixel of a double column's snake
fn snake_position(index: usize) -> (u16, u16) {
    let side = u16::from(matches!(index % 4, 1 | 2));
    (side, (index / 2) as u16)
}

/// Decoder of SerDes packet frames into a pixel matrix
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    layout: PacketLayout,
    options: PacketOptions,
}

impl PacketDecoder {
    pub fn new(layout: PacketLayout) -> Self {
        Self {
            layout,
            options: PacketOptions::default(),
        }
    }

    /// Decoder for a chip with a packet readout
    pub fn for_chip(chip: &ChipDescriptor) -> Result<Self> {
        let layout = chip
            .packet
            .ok_or_else(|| CodecError::config(format!("chip {} has no packet readout", chip.name)))?;
        Ok(Self::new(layout))
    }

    pub fn with_options(mut self, options: PacketOptions) -> Self {
        self.options = options;
        self
    }

    pub fn layout(&self) -> &PacketLayout {
        &self.layout
    }

    pub fn options(&self) -> PacketOptions {
        self.options
    }

    /// Decode all packets of a frame. Pixels not covered by any packet keep
    /// the matrix fill value (zero).
    pub fn decode(&self, words: &[u32]) -> Result<PixelMatrix> {
        let symbols = unpack_symbols(words);
        let delimiter = Symbol::control(self.layout.delimiter);
        if symbols.is_empty() {
            return Err(CodecError::packet("empty frame"));
        }

        let mut matrix = PixelMatrix::new(self.layout.pixel_bits);
        let mut position = 0;
        let mut packets = 0;
        while position < symbols.len() && symbols[position..] != [delimiter] {
            position = self.decode_packet(&symbols, position, &mut matrix)?;
            packets += 1;
        }

        debug!("Decoded {} packet(s) from {} word(s)", packets, words.len());
        Ok(matrix)
    }

    /// Decode the packet starting at `position`, returning the position
    /// after its delimiter
    fn decode_packet(&self, symbols: &[Symbol], mut position: usize, matrix: &mut PixelMatrix) -> Result<usize> {
        let layout = &self.layout;
        let delimiter = Symbol::control(layout.delimiter);

        let header = symbols[position];
        position += 1;
        if header.control {
            return Err(CodecError::packet("packet header should be a regular data word"));
        }
        let rcr = (header.byte >> 6) & 0x3;
        if rcr == 0 {
            return Err(CodecError::packet("unsupported RCR 0 in packet header"));
        }
        let first = u16::from(header.byte & FIRST_COLUMN_MASK);
        let lanes = 1usize << rcr;

        let mut columns = vec![DoubleColumn::new(layout); lanes];
        while let Some(&symbol) = symbols.get(position) {
            position += 1;
            if symbol == delimiter {
                break;
            }
            if symbol.control {
                return Err(CodecError::packet(format!(
                    "found control word {:#04x} different than delimiter",
                    symbol.byte
                )));
            }
            for bit in 0..8 {
                columns[bit % lanes].push((symbol.byte >> bit) & 0x1 != 0, layout, self.options)?;
            }
        }

        let stride = layout.double_columns as usize / lanes;
        for (lane, column) in columns.iter().enumerate() {
            if !column.is_complete(layout) {
                error!("Packet at double column {}: lane {} is partial", first, lane);
                return Err(CodecError::packet(format!("partial double column in lane {}", lane)));
            }

            let double_column = (lane * stride) as u16 + first;
            if double_column >= layout.double_columns {
                return Err(CodecError::packet(format!(
                    "double column {} outside of the matrix",
                    double_column
                )));
            }
            for (index, &latches) in column.pixels.iter().enumerate() {
                let (side, row) = snake_position(index);
                matrix.insert(2 * double_column + side, row, PixelCell::new(layout.pixel_bits, latches));
            }
        }
        Ok(position)
    }
}

/// Writes pixel matrices as uncompressed SerDes packet frames
#[derive(Debug, Clone)]
pub struct PacketEncoder {
    layout: PacketLayout,
    rcr: u8,
}

impl PacketEncoder {
    pub fn new(layout: PacketLayout) -> Self {
        Self {
            layout,
            rcr: DEFAULT_RCR,
        }
    }

    /// Read out `2^rcr` double columns per packet
    pub fn with_rcr(mut self, rcr: u8) -> Self {
        self.rcr = rcr;
        self
    }

    /// Bits of one double column, column flag first
    fn double_column_bits(&self, matrix: &PixelMatrix, double_column: u16) -> Vec<bool> {
        let layout = &self.layout;
        let superpixel_pixels = layout.superpixel_pixels.max(1) as usize;
        let mut bits = Vec::with_capacity(layout.double_column_bits() + 1);
        bits.push(true);
        for index in 0..2 * layout.rows as usize {
            if index % superpixel_pixels == 0 {
                bits.push(true);
            }
            let (side, row) = snake_position(index);
            let cell = matrix.get(2 * double_column + side, row);
            bits.extend((0..layout.pixel_bits).rev().map(|bit| cell.get_bit(bit)));
        }
        bits
    }

    pub fn encode(&self, matrix: &PixelMatrix) -> Result<Vec<u32>> {
        if !(1..=3).contains(&self.rcr) {
            return Err(CodecError::config(format!("RCR {} outside of 1..=3", self.rcr)));
        }
        let lanes = 1usize << self.rcr;
        let stride = self.layout.double_columns as usize / lanes;
        if stride * lanes != self.layout.double_columns as usize || stride > FIRST_COLUMN_MASK as usize + 1 {
            return Err(CodecError::config(format!(
                "{} double columns cannot be read out {} at a time",
                self.layout.double_columns, lanes
            )));
        }

        let mut symbols = Vec::new();
        for first in 0..stride {
            symbols.push(Symbol::data((self.rcr << 6) | first as u8));

            let streams: Vec<Vec<bool>> = (0..lanes)
                .map(|lane| self.double_column_bits(matrix, (lane * stride + first) as u16))
                .collect();
            let length = streams[0].len() * lanes;
            for offset in (0..length).step_by(8) {
                let byte = (0..8).fold(0u8, |byte, bit| {
                    let position = offset + bit;
                    let set = streams[position % lanes].get(position / lanes).copied().unwrap_or(false);
                    byte | (u8::from(set) << bit)
                });
                symbols.push(Symbol::data(byte));
            }

            symbols.push(Symbol::control(self.layout.delimiter));
        }

        debug!("Encoded {} packet(s) into {} symbols", stride, symbols.len());
        Ok(pack_symbols(&symbols))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::CLICPIX2_DELIMITER;

    fn clicpix2_layout() -> PacketLayout {
        ChipDescriptor::clicpix2().packet.unwrap()
    }

    fn sample_matrix() -> PixelMatrix {
        let mut matrix = PixelMatrix::new(14);
        matrix.insert(0, 0, PixelCell::new(14, 0x2001));
        matrix.insert(1, 0, PixelCell::new(14, 0x0F0A));
        matrix.insert(0, 1, PixelCell::new(14, 0x1234));
        matrix.insert(77, 93, PixelCell::new(14, 0x3FFF));
        matrix.insert(127, 127, PixelCell::new(14, 0x0100));
        matrix
    }

    #[test]
    fn test_symbol_packing() {
        let words = pack_symbols(&[Symbol::data(0x40), Symbol::data(0x45), Symbol::control(0xF7)]);
        assert_eq!(words, vec![0x4045, 0x3F7F7]);
        let symbols = unpack_symbols(&words);
        assert_eq!(symbols[0], Symbol::data(0x40));
        assert_eq!(symbols[2], Symbol::control(0xF7));
        assert_eq!(symbols.len(), 4);
    }

    #[test]
    fn test_uncompressed_frame_for_every_rcr() {
        let layout = clicpix2_layout();
        let matrix = sample_matrix();
        let decoder = PacketDecoder::new(layout);

        for rcr in 1..=3 {
            let words = PacketEncoder::new(layout).with_rcr(rcr).encode(&matrix).unwrap();
            let decoded = decoder.decode(&words).unwrap();
            assert!(matrix.differences(&decoded, 128, 128).is_empty(), "rcr {}", rcr);
            assert_eq!(decoded.get(77, 93).latches(), 0x3FFF);
        }
    }

    #[test]
    fn test_snake_within_double_column() {
        assert_eq!(snake_position(0), (0, 0));
        assert_eq!(snake_position(1), (1, 0));
        assert_eq!(snake_position(2), (1, 1));
        assert_eq!(snake_position(3), (0, 1));
        assert_eq!(snake_position(4), (0, 2));
    }

    /// Two double columns of two rows, 4-bit pixels, one super-pixel each
    fn tiny_layout() -> PacketLayout {
        PacketLayout {
            double_columns: 2,
            rows: 2,
            pixel_bits: 4,
            superpixel_pixels: 4,
            delimiter: CLICPIX2_DELIMITER,
        }
    }

    #[test]
    fn test_compressed_packet() {
        // Lane 0: column flag, super-pixel bit, empty pixel, 0b1011, two empty pixels
        // Lane 1: empty double column
        let words = [0x4045u32, 0x1400, 0x3F7F7];
        let decoder = PacketDecoder::new(tiny_layout()).with_options(PacketOptions {
            pixel_compression: true,
            column_compression: true,
        });

        let matrix = decoder.decode(&words).unwrap();
        assert_eq!(matrix.get(1, 0).latches(), 0b1011);
        assert_eq!(matrix.count_nonzero(), 1);
    }

    #[test]
    fn test_compressed_bits_without_compression_are_partial() {
        let words = [0x4045u32, 0x1400, 0x3F7F7];
        let err = PacketDecoder::new(tiny_layout()).decode(&words).unwrap_err();
        assert!(matches!(err, CodecError::Packet(_)));
    }

    #[test]
    fn test_header_errors() {
        let decoder = PacketDecoder::new(clicpix2_layout());

        // control symbol as header
        let err = decoder.decode(&[0x3F7F7]).unwrap_err();
        assert!(err.to_string().contains("header"));

        // RCR 0
        let err = decoder.decode(&[0x0000_0100]).unwrap_err();
        assert!(err.to_string().contains("RCR"));

        assert!(decoder.decode(&[]).is_err());
    }

    #[test]
    fn test_truncated_frame_is_partial() {
        let layout = clicpix2_layout();
        let words = PacketEncoder::new(layout).encode(&sample_matrix()).unwrap();
        let err = PacketDecoder::new(layout).decode(&words[..words.len() / 3]).unwrap_err();
        assert!(err.to_string().contains("partial"));
    }

    #[test]
    fn test_stray_control_symbol() {
        let layout = clicpix2_layout();
        let mut words = PacketEncoder::new(layout).encode(&sample_matrix()).unwrap();
        words[3] |= 1 << 17;
        let err = PacketDecoder::new(layout).decode(&words).unwrap_err();
        assert!(err.to_string().contains("control word"));
    }

    #[test]
    fn test_encoder_rejects_unusable_rcr() {
        let layout = clicpix2_layout();
        assert!(PacketEncoder::new(layout).with_rcr(0).encode(&sample_matrix()).is_err());
        assert!(PacketEncoder::new(tiny_layout()).with_rcr(2).encode(&PixelMatrix::new(4)).is_err());
    }
}
