/*!
Data-driven chip descriptors.

Everything chip specific that the codec needs (sentinel patterns, field
widths, geometry, matrix loading order and register addresses) is collected
in a [`ChipDescriptor`], so the programmer and the decoder are written once.
*/

use crate::error::{CodecError, Result};
use crate::pixel::{clicpix2, clictd};
use serde::{Deserialize, Serialize};

/// Structure of a zero-suppressed readout frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub frame_start: u32,
    pub frame_end: u32,
    /// Column header pattern with the embedded index bits cleared
    pub column_id: u32,
    /// Bits of the column header that carry the column index
    pub column_id_mask: u32,
    pub column_id_shift: u32,
    /// Width of a full (not zero-suppressed) field
    pub field_bits: u32,
    pub columns: u16,
    pub rows: u16,
}

impl FrameLayout {
    /// Number of fields in a frame: start, one header per column, one field
    /// per pixel and the end marker
    pub fn field_count(&self) -> usize {
        2 + self.columns as usize * (1 + self.rows as usize)
    }

    /// The column header expected for `column`
    pub fn column_header(&self, column: u16) -> u32 {
        self.column_id | (((column as u32) << self.column_id_shift) & self.column_id_mask)
    }
}

/// Structure of a SerDes packet frame.
///
/// Each 32-bit word carries two 9-bit symbols (control flag + byte). A packet
/// starts with a header byte (`rcr` in bits 7..6, first double column in
/// bits 4..0), then the bits of `2^rcr` double columns interleaved, and ends
/// with the delimiter control symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketLayout {
    pub double_columns: u16,
    pub rows: u16,
    pub pixel_bits: u8,
    /// Pixels per super-pixel, each preceded by one super-pixel bit
    pub superpixel_pixels: u16,
    /// Byte of the control symbol closing a packet
    pub delimiter: u8,
}

impl PacketLayout {
    pub fn columns(&self) -> u16 {
        self.double_columns * 2
    }

    /// Bits of one double column after its leading flag bit
    pub fn double_column_bits(&self) -> usize {
        let pixels = 2 * self.rows as usize;
        pixels * self.pixel_bits as usize + pixels / self.superpixel_pixels.max(1) as usize
    }
}

/// Order in which a pixel matrix is shifted into the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MatrixLayout {
    /// One chip-wide word per (stage, row, bit): bit `b` of every column is
    /// gathered into one data word, then latched by a control pulse.
    RowBitColumn {
        stages: u8,
        columns: u16,
        rows: u16,
        pixel_bits: u8,
        /// Configuration data register, low byte
        data_lsb: u8,
        /// Configuration data register, high byte
        data_msb: u8,
        /// Configuration control register
        control: u8,
    },
    /// Snake order within double columns with flip-flop padding, packed
    /// eight bits per byte into a single programming register.
    Snake {
        double_columns: u16,
        rows: u16,
        pixel_bits: u8,
        /// A padding block is inserted before every group of this many rows
        superpixel_rows: u16,
        register: u8,
    },
}

impl MatrixLayout {
    pub fn stages(&self) -> usize {
        match self {
            Self::RowBitColumn { stages, .. } => *stages as usize,
            Self::Snake { .. } => 1,
        }
    }

    pub fn columns(&self) -> u16 {
        match self {
            Self::RowBitColumn { columns, .. } => *columns,
            Self::Snake { double_columns, .. } => double_columns * 2,
        }
    }

    pub fn rows(&self) -> u16 {
        match self {
            Self::RowBitColumn { rows, .. } | Self::Snake { rows, .. } => *rows,
        }
    }

    pub fn pixel_bits(&self) -> u8 {
        match self {
            Self::RowBitColumn { pixel_bits, .. } | Self::Snake { pixel_bits, .. } => *pixel_bits,
        }
    }
}

/// Column layout of a chip's matrix definition text files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatrixFileFormat {
    /// `column row mask tp_digital tp_analog thr0 .. thr7`
    Clictd,
    /// `row column mask threshold cntmode tpenable longcnt`
    Clicpix2,
}

/// Everything the codec needs to know about one chip type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipDescriptor {
    pub name: String,
    pub matrix: MatrixLayout,
    /// Readout frame structure, if the chip uses zero-suppressed frames
    pub frame: Option<FrameLayout>,
    /// SerDes packet structure, if the chip reads out through packets
    #[serde(default)]
    pub packet: Option<PacketLayout>,
    /// Default latches of each configuration stage for pixels without an
    /// explicit configuration
    pub stage_defaults: Vec<u64>,
    pub file_format: MatrixFileFormat,
}

/// CLICTD frame start marker
pub const CLICTD_FRAME_START: u32 = 0b1111111111111110101000;
/// CLICTD frame end marker
pub const CLICTD_FRAME_END: u32 = 0b1111111111111110010100;
/// CLICTD column header with the index bits cleared
pub const CLICTD_COLUMN_ID: u32 = 0b1111111111111101000000;
pub const CLICTD_COLUMN_ID_MASK: u32 = 0b0000000000000000111100;
pub const CLICTD_COLUMN_ID_MASK_SHIFT: u32 = 2;
pub const CLICTD_COLUMNS: u16 = 16;
pub const CLICTD_ROWS: u16 = 128;

pub const CLICPIX2_COLUMNS: u16 = 128;
pub const CLICPIX2_ROWS: u16 = 128;
pub const CLICPIX2_SUPERPIXEL_ROWS: u16 = 8;
pub const CLICPIX2_SUPERPIXEL_PIXELS: u16 = 16;
pub const CLICPIX2_MATRIX_PROGRAMMING: u8 = 0x04;
/// K23.7 carrier extender
pub const CLICPIX2_DELIMITER: u8 = 0xF7;

impl ChipDescriptor {
    /// CLICTD: 16 x 128 pixels, two 22-bit configuration stages
    pub fn clictd() -> Self {
        Self {
            name: "clictd".to_string(),
            matrix: MatrixLayout::RowBitColumn {
                stages: 2,
                columns: CLICTD_COLUMNS,
                rows: CLICTD_ROWS,
                pixel_bits: clictd::PIXEL_BITS,
                data_lsb: 0x06,
                data_msb: 0x07,
                control: 0x05,
            },
            frame: Some(FrameLayout {
                frame_start: CLICTD_FRAME_START,
                frame_end: CLICTD_FRAME_END,
                column_id: CLICTD_COLUMN_ID,
                column_id_mask: CLICTD_COLUMN_ID_MASK,
                column_id_shift: CLICTD_COLUMN_ID_MASK_SHIFT,
                field_bits: clictd::PIXEL_BITS as u32,
                columns: CLICTD_COLUMNS,
                rows: CLICTD_ROWS,
            }),
            packet: None,
            stage_defaults: vec![clictd::STAGE1_MASKED, clictd::CONFIG_BASE],
            file_format: MatrixFileFormat::Clictd,
        }
    }

    /// CLICpix2: 128 x 128 pixels, one 14-bit configuration record
    pub fn clicpix2() -> Self {
        Self {
            name: "clicpix2".to_string(),
            matrix: MatrixLayout::Snake {
                double_columns: CLICPIX2_COLUMNS / 2,
                rows: CLICPIX2_ROWS,
                pixel_bits: clicpix2::PIXEL_BITS,
                superpixel_rows: CLICPIX2_SUPERPIXEL_ROWS,
                register: CLICPIX2_MATRIX_PROGRAMMING,
            },
            frame: None,
            packet: Some(PacketLayout {
                double_columns: CLICPIX2_COLUMNS / 2,
                rows: CLICPIX2_ROWS,
                pixel_bits: clicpix2::PIXEL_BITS,
                superpixel_pixels: CLICPIX2_SUPERPIXEL_PIXELS,
                delimiter: CLICPIX2_DELIMITER,
            }),
            stage_defaults: vec![0],
            file_format: MatrixFileFormat::Clicpix2,
        }
    }

    /// Names accepted by [`ChipDescriptor::by_name`]
    pub fn names() -> &'static [&'static str] {
        &["clictd", "clicpix2"]
    }

    /// Look up a built-in descriptor (case-insensitive)
    pub fn by_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "clictd" => Ok(Self::clictd()),
            "clicpix2" => Ok(Self::clicpix2()),
            other => Err(CodecError::config(format!(
                "unknown chip \"{}\", expected one of: {}",
                other,
                Self::names().join(", ")
            ))),
        }
    }

    pub fn columns(&self) -> u16 {
        self.matrix.columns()
    }

    pub fn rows(&self) -> u16 {
        self.matrix.rows()
    }

    pub fn pixel_bits(&self) -> u8 {
        self.matrix.pixel_bits()
    }

    pub fn stages(&self) -> usize {
        self.matrix.stages()
    }
}
