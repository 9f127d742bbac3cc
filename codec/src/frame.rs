/*!
Zero-suppressed readout frame decoding.

A frame is a stream of 32-bit words read most significant bit first. Every
field starts with a flag bit: a cleared flag is a complete, empty field of a
single bit, a set flag starts a full field of the layout's width (flag bit
included) that may continue into the next word.

The structure of a frame is fixed: a frame start marker, then for each column
a column header followed by one field per row, then a frame end marker.
[`FrameDecoder`] validates that structure and [`FrameEncoder`] produces it.
*/

use crate::chip::{ChipDescriptor, FrameLayout};
use crate::coordinates::{Coordinate, PixelMatrix};
use crate::error::{CodecError, Result, StructuralCheck};
use crate::pixel::PixelCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Bits per stream word
pub const WORD_BITS: u32 = 32;

fn field_mask(width: u32) -> u32 {
    if width >= WORD_BITS {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

/// Read position within a word stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    word: usize,
    bit: u8,
}

impl FrameCursor {
    /// Cursor on the most significant bit of the first word
    pub fn new() -> Self {
        Self {
            word: 0,
            bit: (WORD_BITS - 1) as u8,
        }
    }

    pub fn word(&self) -> usize {
        self.word
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }

    /// Number of stream bits read so far
    pub fn bits_consumed(&self) -> usize {
        self.word * WORD_BITS as usize + (WORD_BITS as usize - 1 - self.bit as usize)
    }

    /// Number of words the bits read so far reach into
    pub fn words_touched(&self) -> usize {
        self.bits_consumed().div_ceil(WORD_BITS as usize)
    }

    pub fn is_exhausted(&self, stream: &[u32]) -> bool {
        self.word >= stream.len()
    }

    fn advance(self, bits: u32) -> Self {
        let position = self.bits_consumed() + bits as usize;
        Self {
            word: position / WORD_BITS as usize,
            bit: (WORD_BITS as usize - 1 - position % WORD_BITS as usize) as u8,
        }
    }
}

impl Default for FrameCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the next field of `width` bits at `cursor`.
///
/// Returns the field value and the cursor after it. A zero-suppressed field
/// yields 0 and advances a single bit.
pub fn next_field(stream: &[u32], cursor: FrameCursor, width: u32) -> Result<(u32, FrameCursor)> {
    if width == 0 || width > WORD_BITS {
        return Err(CodecError::config(format!(
            "field width {} outside of 1..={}",
            width, WORD_BITS
        )));
    }

    let Some(&current) = stream.get(cursor.word) else {
        return Err(CodecError::EndOfStream { word: cursor.word });
    };
    let bit = cursor.bit as u32;

    if (current >> bit) & 0x1 == 0 {
        return Ok((0, cursor.advance(1)));
    }

    // Bits of the field still in the current word
    let available = bit + 1;
    if available >= width {
        let value = (current >> (available - width)) & field_mask(width);
        return Ok((value, cursor.advance(width)));
    }

    let missing = width - available;
    let Some(&following) = stream.get(cursor.word + 1) else {
        return Err(CodecError::FrameTruncated {
            word: cursor.word,
            bit: cursor.bit,
            missing,
        });
    };
    let high = current & field_mask(available);
    let value = (high << missing) | (following >> (WORD_BITS - missing));
    Ok((value, cursor.advance(width)))
}

/// Options applied to every decoded frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Pixels count with the 13-bit long counter instead of ToT + ToA
    pub long_counter: bool,
}

/// The pixel contents of one decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    matrix: PixelMatrix,
    columns: u16,
    rows: u16,
    long_counter: bool,
    bits_consumed: usize,
}

impl DecodedFrame {
    pub fn get(&self, column: u16, row: u16) -> PixelCell {
        self.matrix.get(column, row)
    }

    pub fn matrix(&self) -> &PixelMatrix {
        &self.matrix
    }

    pub fn into_matrix(self) -> PixelMatrix {
        self.matrix
    }

    pub fn iter(&self) -> impl Iterator<Item = (Coordinate, PixelCell)> + '_ {
        self.matrix.iter()
    }

    /// Number of pixels with data
    pub fn hits(&self) -> usize {
        self.matrix.count_nonzero()
    }

    pub fn long_counter(&self) -> bool {
        self.long_counter
    }

    /// Stream bits used by the frame, sentinels included
    pub fn bits_consumed(&self) -> usize {
        self.bits_consumed
    }

    pub fn columns(&self) -> u16 {
        self.columns
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    /// Pixel values as a dense `columns x rows` array, row index fastest
    pub fn to_dense(&self) -> Vec<u64> {
        let mut dense = Vec::with_capacity(self.columns as usize * self.rows as usize);
        for column in 0..self.columns {
            for row in 0..self.rows {
                dense.push(self.get(column, row).latches());
            }
        }
        dense
    }
}

/// Decoder for one chip's zero-suppressed frame format
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    layout: FrameLayout,
    options: DecodeOptions,
}

impl FrameDecoder {
    pub fn new(layout: FrameLayout) -> Result<Self> {
        if layout.field_bits == 0 || layout.field_bits > WORD_BITS {
            return Err(CodecError::config(format!(
                "frame field width {} outside of 1..={}",
                layout.field_bits, WORD_BITS
            )));
        }
        Ok(Self {
            layout,
            options: DecodeOptions::default(),
        })
    }

    /// Decoder for a chip with a zero-suppressed frame format
    pub fn for_chip(chip: &ChipDescriptor) -> Result<Self> {
        let layout = chip.frame.ok_or_else(|| {
            CodecError::config(format!("chip {} has no zero-suppressed frame format", chip.name))
        })?;
        Self::new(layout)
    }

    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn options(&self) -> DecodeOptions {
        self.options
    }

    /// Read one field of the frame. Running out of words in the middle of a
    /// frame means the frame is truncated.
    fn read(&self, stream: &[u32], cursor: FrameCursor) -> Result<(u32, FrameCursor)> {
        next_field(stream, cursor, self.layout.field_bits).map_err(|e| match e {
            CodecError::EndOfStream { word } => CodecError::FrameTruncated {
                word,
                bit: cursor.bit,
                missing: 1,
            },
            other => other,
        })
    }

    fn check(check: StructuralCheck, expected: u32, found: u32) -> Result<()> {
        if expected == found {
            return Ok(());
        }
        error!("Frame {} mismatch: expected {:#x}, found {:#x}", check, expected, found);
        Err(CodecError::Structural {
            check,
            expected,
            found,
        })
    }

    /// Decode a complete frame. Any structural mismatch aborts decoding
    /// without returning the pixels read so far.
    pub fn decode_frame(&self, stream: &[u32]) -> Result<DecodedFrame> {
        let layout = &self.layout;
        let mut matrix = PixelMatrix::new(layout.field_bits as u8);

        let (start, mut cursor) = self.read(stream, FrameCursor::new())?;
        Self::check(StructuralCheck::FrameStart, layout.frame_start, start)?;

        for column in 0..layout.columns {
            let (header, next) = self.read(stream, cursor)?;
            cursor = next;
            Self::check(
                StructuralCheck::ColumnHeader { column },
                layout.column_id,
                header & !layout.column_id_mask,
            )?;
            Self::check(
                StructuralCheck::ColumnIndex { column },
                column as u32,
                (header & layout.column_id_mask) >> layout.column_id_shift,
            )?;

            for row in 0..layout.rows {
                let (value, next) = self.read(stream, cursor)?;
                cursor = next;
                matrix.insert(column, row, PixelCell::new(layout.field_bits as u8, value as u64));
            }
        }

        let (end, cursor) = self.read(stream, cursor)?;
        Self::check(StructuralCheck::FrameEnd, layout.frame_end, end)?;

        let trailing = stream.len().saturating_sub(cursor.words_touched());
        if trailing > 0 {
            debug!("{} word(s) after frame end ignored", trailing);
        }

        Ok(DecodedFrame {
            matrix,
            columns: layout.columns,
            rows: layout.rows,
            long_counter: self.options.long_counter,
            bits_consumed: cursor.bits_consumed(),
        })
    }

    /// Split a stream into its raw fields in frame order, without validating
    /// anything. Stops early if the stream runs out.
    pub fn split_frame(&self, stream: &[u32]) -> Vec<u32> {
        let count = self.layout.field_count();
        let mut fields = Vec::with_capacity(count);
        let mut cursor = FrameCursor::new();

        while fields.len() < count {
            match next_field(stream, cursor, self.layout.field_bits) {
                Ok((value, next)) => {
                    fields.push(value);
                    cursor = next;
                }
                Err(e) => {
                    warn!("Frame split stopped after {} of {} fields: {}", fields.len(), count, e);
                    break;
                }
            }
        }
        fields
    }
}

/// Writes bits most significant first into 32-bit words
#[derive(Debug, Default)]
struct BitWriter {
    words: Vec<u32>,
    current: u32,
    filled: u32,
}

impl BitWriter {
    fn push_bit(&mut self, bit: bool) {
        if bit {
            self.current |= 1 << (WORD_BITS - 1 - self.filled);
        }
        self.filled += 1;
        if self.filled == WORD_BITS {
            self.words.push(self.current);
            self.current = 0;
            self.filled = 0;
        }
    }

    fn push_value(&mut self, value: u32, width: u32) {
        for bit in (0..width).rev() {
            self.push_bit((value >> bit) & 0x1 != 0);
        }
    }

    fn finish(mut self) -> Vec<u32> {
        if self.filled > 0 {
            self.words.push(self.current);
        }
        self.words
    }
}

/// Produces zero-suppressed frames, the inverse of [`FrameDecoder`]
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    layout: FrameLayout,
}

impl FrameEncoder {
    pub fn new(layout: FrameLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Encode raw fields back to back; the last word is zero padded.
    /// Non-empty fields must fit the field width and carry the flag bit.
    pub fn encode_fields(&self, fields: &[u32]) -> Result<Vec<u32>> {
        let width = self.layout.field_bits;
        if width == 0 || width > WORD_BITS {
            return Err(CodecError::config(format!(
                "frame field width {} outside of 1..={}",
                width, WORD_BITS
            )));
        }
        let mut writer = BitWriter::default();
        for (index, &value) in fields.iter().enumerate() {
            if value == 0 {
                writer.push_bit(false);
                continue;
            }
            if value > field_mask(width) || (value >> (width - 1)) & 0x1 == 0 {
                return Err(CodecError::config(format!(
                    "field {} value {:#x} cannot be encoded: needs flag bit {} set",
                    index,
                    value,
                    width - 1
                )));
            }
            writer.push_value(value, width);
        }
        Ok(writer.finish())
    }

    /// Raw fields of a complete frame for `matrix`
    pub fn frame_fields(&self, matrix: &PixelMatrix) -> Vec<u32> {
        let layout = &self.layout;
        let mut fields = Vec::with_capacity(layout.field_count());
        fields.push(layout.frame_start);
        for column in 0..layout.columns {
            fields.push(layout.column_header(column));
            for row in 0..layout.rows {
                fields.push(matrix.get(column, row).latches() as u32 & field_mask(layout.field_bits));
            }
        }
        fields.push(layout.frame_end);
        fields
    }

    /// Encode a complete frame for `matrix`
    pub fn encode(&self, matrix: &PixelMatrix) -> Result<Vec<u32>> {
        self.encode_fields(&self.frame_fields(matrix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{CLICTD_COLUMN_ID, CLICTD_COLUMN_ID_MASK, CLICTD_FRAME_END, CLICTD_FRAME_START};

    fn small_layout() -> FrameLayout {
        FrameLayout {
            frame_start: CLICTD_FRAME_START,
            frame_end: CLICTD_FRAME_END,
            column_id: CLICTD_COLUMN_ID,
            column_id_mask: CLICTD_COLUMN_ID_MASK,
            column_id_shift: 2,
            field_bits: 22,
            columns: 2,
            rows: 3,
        }
    }

    fn small_matrix() -> PixelMatrix {
        let mut matrix = PixelMatrix::new(22);
        matrix.insert(0, 1, PixelCell::new(22, 0x2ABCDE));
        matrix.insert(1, 2, PixelCell::new(22, 0x3FFFFF));
        matrix
    }

    #[test]
    fn test_zero_word_single_bit() {
        let (value, cursor) = next_field(&[0x0000_0000], FrameCursor::new(), 22).unwrap();
        assert_eq!(value, 0);
        assert_eq!(cursor.bits_consumed(), 1);
        assert_eq!((cursor.word(), cursor.bit()), (0, 30));
    }

    #[test]
    fn test_field_within_word() {
        let stream: [u32; 1] = [0x2ABCDE << 10];
        let (value, cursor) = next_field(&stream, FrameCursor::new(), 22).unwrap();
        assert_eq!(value, 0x2ABCDE);
        assert_eq!((cursor.word(), cursor.bit()), (0, 9));
    }

    #[test]
    fn test_field_straddling_words() {
        // 20 empty fields, then a 22-bit field starting at bit 11 of word 0
        let value: u32 = 0x2ABCDE;
        let stream = [value >> 10, (value & 0x3FF) << 22];

        let mut cursor = FrameCursor::new();
        for _ in 0..20 {
            let (empty, next) = next_field(&stream, cursor, 22).unwrap();
            assert_eq!(empty, 0);
            cursor = next;
        }
        assert_eq!(cursor.bit(), 11);

        let (read, cursor) = next_field(&stream, cursor, 22).unwrap();
        assert_eq!(read, value);
        assert_eq!((cursor.word(), cursor.bit()), (1, 21));
        assert_eq!(cursor.bits_consumed(), 42);
    }

    #[test]
    fn test_field_ending_on_word_boundary() {
        let stream: [u32; 2] = [0x3FFFFF, 0];
        let mut cursor = FrameCursor::new();
        for _ in 0..10 {
            cursor = next_field(&stream, cursor, 22).unwrap().1;
        }
        let (value, cursor) = next_field(&stream, cursor, 22).unwrap();
        assert_eq!(value, 0x3FFFFF);
        assert_eq!((cursor.word(), cursor.bit()), (1, 31));
        // the cursor sits on word 1 but only word 0 has been read
        assert_eq!(cursor.words_touched(), 1);
        assert_eq!(next_field(&stream, cursor, 22).unwrap().1.words_touched(), 2);
        assert_eq!(FrameCursor::new().words_touched(), 0);
    }

    #[test]
    fn test_end_of_stream_and_truncation() {
        assert!(matches!(
            next_field(&[], FrameCursor::new(), 22),
            Err(CodecError::EndOfStream { word: 0 })
        ));

        // flag bit set on the last bit of the last word
        let stream: [u32; 1] = [0x0000_0001];
        let mut cursor = FrameCursor::new();
        for _ in 0..31 {
            cursor = next_field(&stream, cursor, 22).unwrap().1;
        }
        assert!(matches!(
            next_field(&stream, cursor, 22),
            Err(CodecError::FrameTruncated { word: 0, bit: 0, missing: 21 })
        ));

        let cursor = next_field(&[0], FrameCursor::new().advance(31), 22).unwrap().1;
        assert!(cursor.is_exhausted(&[0]));
    }

    #[test]
    fn test_decode_encoded_frame() {
        let layout = small_layout();
        let stream = FrameEncoder::new(layout).encode(&small_matrix()).unwrap();
        let frame = FrameDecoder::new(layout).unwrap().decode_frame(&stream).unwrap();

        assert_eq!(frame.get(0, 1).latches(), 0x2ABCDE);
        assert_eq!(frame.get(1, 2).latches(), 0x3FFFFF);
        assert_eq!(frame.get(0, 0).latches(), 0);
        assert_eq!(frame.hits(), 2);
        assert!(frame.matrix().differences(&small_matrix(), 2, 3).is_empty());
        // start + 2 headers + end + 2 pixels at 22 bits, 4 empty pixels at 1 bit
        assert_eq!(frame.bits_consumed(), 6 * 22 + 4);
        assert_eq!(frame.to_dense(), vec![0, 0x2ABCDE, 0, 0, 0, 0x3FFFFF]);
    }

    #[test]
    fn test_wrong_frame_end() {
        let layout = small_layout();
        let encoder = FrameEncoder::new(layout);
        let mut fields = encoder.frame_fields(&small_matrix());
        *fields.last_mut().unwrap() = CLICTD_FRAME_START;
        let stream = encoder.encode_fields(&fields).unwrap();

        let err = FrameDecoder::new(layout).unwrap().decode_frame(&stream).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Structural {
                check: StructuralCheck::FrameEnd,
                ..
            }
        ));
        assert!(err.to_string().contains("frame end"));
    }

    #[test]
    fn test_wrong_start_and_column_headers() {
        let layout = small_layout();
        let encoder = FrameEncoder::new(layout);
        let decoder = FrameDecoder::new(layout).unwrap();
        let fields = encoder.frame_fields(&small_matrix());

        let mut bad_start = fields.clone();
        bad_start[0] = CLICTD_FRAME_END;
        let err = decoder.decode_frame(&encoder.encode_fields(&bad_start).unwrap()).unwrap_err();
        assert_eq!(err.structural_check(), Some(StructuralCheck::FrameStart));

        // column 1 header carrying index 0
        let mut bad_index = fields.clone();
        bad_index[1 + 1 + 3] = layout.column_header(0);
        let err = decoder.decode_frame(&encoder.encode_fields(&bad_index).unwrap()).unwrap_err();
        assert_eq!(err.structural_check(), Some(StructuralCheck::ColumnIndex { column: 1 }));

        let mut bad_header = fields;
        bad_header[1] = CLICTD_FRAME_END;
        let err = decoder.decode_frame(&encoder.encode_fields(&bad_header).unwrap()).unwrap_err();
        assert_eq!(err.structural_check(), Some(StructuralCheck::ColumnHeader { column: 0 }));
    }

    #[test]
    fn test_truncated_frame() {
        let layout = small_layout();
        let mut stream = FrameEncoder::new(layout).encode(&small_matrix()).unwrap();
        stream.pop();
        let err = FrameDecoder::new(layout).unwrap().decode_frame(&stream).unwrap_err();
        assert!(matches!(err, CodecError::FrameTruncated { .. }));
    }

    #[test]
    fn test_split_frame() {
        let layout = small_layout();
        let encoder = FrameEncoder::new(layout);
        let decoder = FrameDecoder::new(layout).unwrap();
        let fields = encoder.frame_fields(&small_matrix());
        let stream = encoder.encode_fields(&fields).unwrap();

        assert_eq!(decoder.split_frame(&stream), fields);
        assert_eq!(fields.len(), layout.field_count());

        // split does not validate, and stops when the stream runs out
        let partial = decoder.split_frame(&stream[..1]);
        assert!(partial.len() < fields.len());
        assert_eq!(partial[0], CLICTD_FRAME_START);
    }

    #[test]
    fn test_encoder_rejects_missing_flag() {
        let encoder = FrameEncoder::new(small_layout());
        assert!(encoder.encode_fields(&[0x1FFFFF]).is_err());
        assert!(encoder.encode_fields(&[0x400000]).is_err());
        assert_eq!(encoder.encode_fields(&[0, 0]).unwrap(), vec![0]);
    }

    #[test]
    fn test_full_clictd_frame() {
        let chip = ChipDescriptor::clictd();
        let layout = chip.frame.unwrap();
        let mut matrix = PixelMatrix::new(22);
        matrix.insert(15, 127, PixelCell::new(22, 0x20_1234));
        matrix.insert(7, 64, PixelCell::new(22, 0x3F_0000));

        let stream = FrameEncoder::new(layout).encode(&matrix).unwrap();
        let decoder = FrameDecoder::for_chip(&chip)
            .unwrap()
            .with_options(DecodeOptions { long_counter: true });
        let frame = decoder.decode_frame(&stream).unwrap();
        assert!(frame.long_counter());
        assert_eq!(frame.hits(), 2);
        assert_eq!(frame.get(15, 127).latches(), 0x20_1234);

        assert!(FrameDecoder::for_chip(&ChipDescriptor::clicpix2()).is_err());
    }
}
