/*!
Matrix configuration driver.

[`MatrixDriver`] sends a programmed matrix to the chip through a
[`Transport`], reads the configuration back (a zero-suppressed frame or a
packet frame, whichever the chip uses) and compares it with what was sent. Verification mismatches are retried up to a configurable
number of attempts before the configuration is given up.

[`LoopbackTransport`] emulates the chip side of both programming protocols
in memory.
*/

use crate::chip::{ChipDescriptor, MatrixLayout, PacketLayout};
use crate::coordinates::PixelMatrix;
use crate::error::{CodecError, Result};
use crate::frame::{FrameDecoder, FrameEncoder};
use crate::matrix::{MatrixConfig, MatrixProgrammer, RegisterWrite, StageProgram, CONTROL_SHIFT};
use crate::matrix_file::read_matrix_file;
use crate::packet::{PacketDecoder, PacketEncoder};
use crate::pixel::clicpix2;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Default number of matrix configuration attempts
pub const DEFAULT_RETRY_MATRIX_CONFIG: u32 = 3;

/// Register access to a chip
pub trait Transport {
    /// Write one byte to a chip register
    fn write_register(&mut self, address: u8, value: u8) -> Result<()>;

    /// Write a sequence of bytes to the same register
    fn send(&mut self, address: u8, data: &[u8]) -> Result<()> {
        for &value in data {
            self.write_register(address, value)?;
        }
        Ok(())
    }

    /// Read one raw frame from the readout
    fn read_frame(&mut self) -> Result<Vec<u32>>;
}

/// How a chip returns its configuration
#[derive(Debug, Clone)]
enum Readback {
    /// Zero-suppressed frame after every stage
    Frame(FrameDecoder),
    /// Uncompressed packet frame after the whole matrix
    Packet(PacketDecoder),
}

impl Readback {
    fn for_chip(chip: &ChipDescriptor) -> Result<Option<Self>> {
        if let Some(layout) = chip.frame {
            return Ok(Some(Self::Frame(FrameDecoder::new(layout)?)));
        }
        Ok(chip.packet.map(|layout| Self::Packet(PacketDecoder::new(layout))))
    }

    /// Decode a read-back into the configuration's terms
    fn decode(&self, raw: &[u32], expected: &PixelMatrix, columns: u16, rows: u16) -> Result<PixelMatrix> {
        match self {
            Self::Frame(decoder) => Ok(decoder.decode_frame(raw)?.into_matrix()),
            Self::Packet(decoder) => {
                let mut matrix = decoder.decode(raw)?;
                for column in 0..columns {
                    for row in 0..rows {
                        let aligned = clicpix2::align_readback(expected.get(column, row), matrix.get(column, row));
                        matrix.insert(column, row, aligned);
                    }
                }
                Ok(matrix)
            }
        }
    }
}

/// Programs and verifies a chip's pixel matrix
pub struct MatrixDriver<T: Transport> {
    chip: ChipDescriptor,
    transport: T,
    programmer: MatrixProgrammer,
    readback: Option<Readback>,
    retry_max: u32,
    configured: bool,
}

impl<T: Transport> MatrixDriver<T> {
    pub fn new(chip: ChipDescriptor, transport: T) -> Result<Self> {
        let readback = Readback::for_chip(&chip)?;
        Ok(Self {
            programmer: MatrixProgrammer::for_chip(&chip),
            chip,
            transport,
            readback,
            retry_max: DEFAULT_RETRY_MATRIX_CONFIG,
            configured: false,
        })
    }

    /// Number of attempts before giving up; at least one attempt is made
    pub fn with_retry_max(mut self, retry_max: u32) -> Self {
        self.retry_max = retry_max.max(1);
        self
    }

    pub fn chip(&self) -> &ChipDescriptor {
        &self.chip
    }

    pub fn retry_max(&self) -> u32 {
        self.retry_max
    }

    /// Whether the last configuration succeeded
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn send_stage(&mut self, stage: &StageProgram) -> Result<()> {
        for run in stage.writes.chunk_by(|a, b| a.address == b.address) {
            let data: Vec<u8> = run.iter().map(|w| w.value).collect();
            self.transport.send(run[0].address, &data)?;
        }
        Ok(())
    }

    /// Read back the matrix after a stage was programmed and compare it
    /// with the intended configuration
    fn verify_stage(&mut self, stage: usize, expected: &PixelMatrix) -> Result<()> {
        let Some(readback) = &self.readback else {
            return Ok(());
        };
        let (columns, rows) = (self.chip.columns(), self.chip.rows());

        let raw = self.transport.read_frame()?;
        let matrix = match readback.decode(&raw, expected, columns, rows) {
            Ok(matrix) => matrix,
            Err(e) => {
                error!("Matrix stage {} read-back failed: {}", stage + 1, e);
                return Err(CodecError::Verification {
                    stage,
                    mismatches: columns as usize * rows as usize,
                });
            }
        };

        let mismatches = expected.differences(&matrix, columns, rows);
        for coordinate in &mismatches {
            error!(
                "Matrix configuration (stage {}) of pixel {} does not match: {} != {}",
                stage + 1,
                coordinate,
                expected.get(coordinate.column, coordinate.row),
                matrix.get(coordinate.column, coordinate.row)
            );
        }
        if mismatches.is_empty() {
            debug!("Matrix stage {} verified", stage + 1);
            Ok(())
        } else {
            Err(CodecError::Verification {
                stage,
                mismatches: mismatches.len(),
            })
        }
    }

    /// Program all stages once, verifying each stage where the chip
    /// supports reading back its configuration
    pub fn program_matrix(&mut self, config: &MatrixConfig) -> Result<()> {
        let program = self.programmer.program(config)?;

        match self.readback {
            Some(Readback::Frame(_)) => {
                debug!("Resetting matrix");
                self.transport.read_frame()?;
            }
            Some(Readback::Packet(_)) => {}
            None => info!("Chip {} has no configuration read-back, skipping verification", self.chip.name),
        }

        for (stage, expected) in program.stages.iter().zip(&config.stages) {
            info!("Matrix configuration - Stage {}", stage.stage + 1);
            self.send_stage(stage)?;
            self.verify_stage(stage.stage, expected)?;
        }
        Ok(())
    }

    /// Program the matrix, repeating the attempt on verification failures.
    /// Returns the number of attempts used.
    pub fn configure_matrix(&mut self, config: &MatrixConfig) -> Result<u32> {
        self.configured = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.program_matrix(config) {
                Ok(()) => {
                    info!("Verified matrix configuration after {} attempt(s)", attempt);
                    self.configured = true;
                    return Ok(attempt);
                }
                Err(e) if e.is_recoverable() => {
                    error!("{}", e);
                    if attempt >= self.retry_max {
                        return Err(CodecError::CommunicationFailed { attempts: attempt });
                    }
                    info!("Repeating configuration attempt");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read a matrix definition file and configure the chip with it
    pub fn configure_matrix_from_file(&mut self, path: impl AsRef<Path>) -> Result<u32> {
        debug!("Configuring the pixel matrix from file \"{}\"", path.as_ref().display());
        let file = read_matrix_file(&self.chip, path)?;
        self.configure_matrix(&file.config)
    }
}

/// In-memory chip emulator.
///
/// Records every register write. For row/bit/column chips it latches the
/// configuration words exactly as the matrix would and answers the next
/// [`Transport::read_frame`] with the configuration of the stage that was
/// just loaded. Snake chips collect the programming bytes and answer with an
/// uncompressed packet frame of the shifted-in matrix, which clears it.
#[derive(Debug)]
pub struct LoopbackTransport {
    chip: ChipDescriptor,
    programmer: MatrixProgrammer,
    writes: Vec<RegisterWrite>,
    data: [u8; 2],
    active_stage: Option<usize>,
    words: Vec<u32>,
    snake: Vec<u8>,
    stages: Vec<Option<PixelMatrix>>,
    pending: Option<usize>,
    corrupt_reads: u32,
}

impl LoopbackTransport {
    pub fn new(chip: &ChipDescriptor) -> Self {
        Self {
            chip: chip.clone(),
            programmer: MatrixProgrammer::for_chip(chip),
            writes: Vec::new(),
            data: [0; 2],
            active_stage: None,
            words: Vec::new(),
            snake: Vec::new(),
            stages: vec![None; chip.stages()],
            pending: None,
            corrupt_reads: 0,
        }
    }

    /// Corrupt the next `count` configuration read-backs
    pub fn with_corrupt_reads(mut self, count: u32) -> Self {
        self.corrupt_reads = count;
        self
    }

    /// All writes received so far
    pub fn writes(&self) -> &[RegisterWrite] {
        &self.writes
    }

    /// Configuration last latched into `stage`
    pub fn stage(&self, stage: usize) -> Option<&PixelMatrix> {
        self.stages.get(stage).and_then(|s| s.as_ref())
    }

    fn latch(&mut self, address: u8, value: u8) {
        let (data_lsb, data_msb, control) = match self.chip.matrix {
            MatrixLayout::RowBitColumn {
                data_lsb,
                data_msb,
                control,
                ..
            } => (data_lsb, data_msb, control),
            MatrixLayout::Snake { register, .. } => {
                if address == register {
                    self.snake.push(value);
                }
                return;
            }
        };

        if address == data_lsb {
            self.data[0] = value;
        } else if address == data_msb {
            self.data[1] = value;
        } else if address == control {
            match (self.active_stage, value) {
                (Some(stage), 0x00) => {
                    let matrix = self.programmer.reassemble_words(&self.words);
                    if let Some(slot) = self.stages.get_mut(stage) {
                        *slot = Some(matrix);
                    }
                    self.words.clear();
                    self.active_stage = None;
                    self.pending = Some(stage);
                }
                (Some(_), value) if value & CONTROL_SHIFT != 0 => {
                    self.words
                        .push((u32::from(self.data[1]) << 8) | u32::from(self.data[0]));
                }
                (Some(_), _) => {}
                (None, 0x00) => {}
                (None, flag) => {
                    self.active_stage = Some(usize::from(flag & !CONTROL_SHIFT).saturating_sub(1));
                    self.words.clear();
                }
            }
        }
    }
}

impl LoopbackTransport {
    fn read_packet_frame(&mut self, layout: PacketLayout) -> Result<Vec<u32>> {
        let programmed = !self.snake.is_empty();
        let mut matrix = if programmed {
            let matrix = self.programmer.reassemble_snake(&self.snake);
            self.snake.clear();
            if let Some(slot) = self.stages.get_mut(0) {
                *slot = Some(matrix.clone());
            }
            matrix
        } else {
            PixelMatrix::new(layout.pixel_bits)
        };

        // The flag latch reads back as mask | threshold[0]
        for column in 0..layout.columns() {
            for row in 0..layout.rows {
                let mut cell = matrix.get(column, row);
                if cell.get_bit(8) {
                    cell.set_bit(13, true);
                    matrix.insert(column, row, cell);
                }
            }
        }

        if programmed && self.corrupt_reads > 0 {
            self.corrupt_reads -= 1;
            let mut cell = matrix.get(0, 0);
            cell.set_bit(0, !cell.get_bit(0));
            matrix.insert(0, 0, cell);
            warn!("Emulating corrupted read-back ({} left)", self.corrupt_reads);
        }

        PacketEncoder::new(layout).encode(&matrix)
    }
}

impl Transport for LoopbackTransport {
    fn write_register(&mut self, address: u8, value: u8) -> Result<()> {
        self.writes.push(RegisterWrite::new(address, value));
        self.latch(address, value);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Vec<u32>> {
        if let Some(layout) = self.chip.packet {
            return self.read_packet_frame(layout);
        }
        let Some(layout) = self.chip.frame else {
            return Ok(Vec::new());
        };
        let encoder = FrameEncoder::new(layout);

        let stage = self.pending.take();
        let mut matrix = match stage.and_then(|s| self.stage(s)) {
            Some(matrix) => matrix.clone(),
            None => PixelMatrix::new(self.chip.pixel_bits()),
        };

        if stage.is_some() && self.corrupt_reads > 0 {
            self.corrupt_reads -= 1;
            let mut cell = matrix.get(0, 0);
            cell.set_bit(0, !cell.get_bit(0));
            matrix.insert(0, 0, cell);
            warn!("Emulating corrupted read-back ({} left)", self.corrupt_reads);
        }

        encoder.encode(&matrix)
    }
}
