/*!
# Chip Configuration and Readout Codec

Bit-level encoding and decoding for pixel-detector readout chips: named
configuration registers serialized into shift-register bit streams, pixel
matrices serialized in the chip's loading order, and zero-suppressed or
SerDes packet readout frames decoded back into pixel matrices.

## Core Types

- [`ParameterRegistry`] - Named bit fields of a configuration register
- [`PixelCell`] - One pixel's latch record
- [`PixelMatrix`] - Pixel cells by coordinate
- [`MatrixProgrammer`] - Matrix to register writes
- [`FrameDecoder`] - Zero-suppressed frames to pixel matrices
- [`PacketDecoder`] - SerDes packet frames to pixel matrices
- [`ChipDescriptor`] - Per-chip constants driving all of the above

## Modules

- [`bitfield`] - Bit fields and shift directions
- [`registry`] - Parameter registry and register layout files
- [`pixel`] - Pixel latch records and chip-specific views
- [`coordinates`] - Pixel coordinates and the pixel matrix
- [`chip`] - Chip descriptors
- [`matrix`] - Matrix programming sequences
- [`frame`] - Frame decoding and encoding
- [`packet`] - SerDes packet frame decoding and encoding
- [`matrix_file`] - Matrix definition files
- [`device`] - Matrix configuration driver and transport seam
- [`error`] - Common error types
*/

pub mod bitfield;
pub mod chip;
pub mod coordinates;
pub mod device;
pub mod error;
pub mod frame;
pub mod matrix;
pub mod matrix_file;
pub mod packet;
pub mod pixel;
pub mod registry;

// Re-export commonly used types
pub use bitfield::{BitField, ShiftDirection};
pub use chip::{ChipDescriptor, FrameLayout, MatrixFileFormat, MatrixLayout, PacketLayout};
pub use coordinates::{Coordinate, PixelMatrix};
pub use device::{LoopbackTransport, MatrixDriver, Transport};
pub use error::{CodecError, Result, StructuralCheck};
pub use frame::{next_field, DecodeOptions, DecodedFrame, FrameCursor, FrameDecoder, FrameEncoder};
pub use matrix::{pack_bits, MatrixConfig, MatrixProgram, MatrixProgrammer, RegisterWrite};
pub use matrix_file::{read_matrix_file, MatrixFile};
pub use packet::{PacketDecoder, PacketEncoder, PacketOptions};
pub use pixel::PixelCell;
pub use registry::{ParameterRegistry, RegisterLayout, RegisterSpec};

/// Version information for the codec library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
