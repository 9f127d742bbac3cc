/*!
Matrix definition files.

Plain text, one pixel per line, whitespace separated integers. Lines that
are empty or start with `#` are skipped, as are lines that do not parse.

CLICTD: `column row mask tp_digital tp_analog thr0 thr1 thr2 thr3 thr4 thr5 thr6 thr7`

CLICpix2: `row column mask threshold cntmode tpenable longcnt`
*/

use crate::chip::{ChipDescriptor, MatrixFileFormat};
use crate::error::{CodecError, Result};
use crate::matrix::MatrixConfig;
use crate::pixel::{clicpix2, clictd, PixelCell};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Result of reading a matrix definition
#[derive(Debug, Clone)]
pub struct MatrixFile {
    pub config: MatrixConfig,
    /// Number of pixel lines read
    pub pixels: usize,
    /// Pixels with at least one masked front-end
    pub masked: usize,
}

/// Read a matrix definition file for `chip`. A file that cannot be opened
/// is a configuration error.
pub fn read_matrix_file(chip: &ChipDescriptor, path: impl AsRef<Path>) -> Result<MatrixFile> {
    let path = path.as_ref();
    debug!("Reading pixel matrix file {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| {
        CodecError::config(format!("Could not open matrix file \"{}\": {}", path.display(), e))
    })?;
    parse_matrix(chip, &content, &path.display().to_string())
}

/// Parse matrix definition text; `source` names the input in messages
pub fn parse_matrix(chip: &ChipDescriptor, content: &str, source: &str) -> Result<MatrixFile> {
    let mut file = MatrixFile {
        config: MatrixConfig::default_for(chip),
        pixels: 0,
        masked: 0,
    };

    for (index, line) in content.lines().enumerate() {
        let line_number = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parsed = match chip.file_format {
            MatrixFileFormat::Clictd => parse_clictd_line(trimmed),
            MatrixFileFormat::Clicpix2 => parse_clicpix2_line(trimmed),
        };
        let Some(pixel) = parsed else {
            warn!("{}:{}: skipping unparsable line \"{}\"", source, line_number, trimmed);
            continue;
        };

        if pixel.column >= chip.columns() || pixel.row >= chip.rows() {
            return Err(CodecError::matrix_file(
                source,
                format!(
                    "line {}: pixel {},{} outside of the {}x{} matrix",
                    line_number,
                    pixel.column,
                    pixel.row,
                    chip.columns(),
                    chip.rows()
                ),
            ));
        }

        for (stage, cell) in pixel.stages.iter().enumerate() {
            if let Some(matrix) = file.config.stage_mut(stage) {
                matrix.insert(pixel.column, pixel.row, *cell);
            }
        }
        file.pixels += 1;
        if pixel.masked {
            file.masked += 1;
        }
    }

    info!(
        "{} pixel configurations cached, {} of which are at least partly masked",
        file.pixels, file.masked
    );
    Ok(file)
}

struct PixelLine {
    column: u16,
    row: u16,
    masked: bool,
    stages: Vec<PixelCell>,
}

/// Leading `count` integers of a line; anything after them is ignored
fn fields<T: FromStr>(line: &str, count: usize) -> Option<Vec<T>> {
    let values = line
        .split_whitespace()
        .take(count)
        .map(|token| token.parse::<T>().ok())
        .collect::<Option<Vec<T>>>()?;
    (values.len() == count).then_some(values)
}

fn parse_clictd_line(line: &str) -> Option<PixelLine> {
    let values = fields::<u16>(line, 13)?;
    let small = |v: u16| u8::try_from(v).ok();

    let mask = small(values[2])?;
    let tp_analog = small(values[4])?;
    let mut thresholds = [0u8; 8];
    for (threshold, &value) in thresholds.iter_mut().zip(&values[5..13]) {
        *threshold = small(value)?;
    }

    let config = clictd::PixelConfig::new(mask, values[3] != 0, tp_analog, &thresholds).ok()?;
    Some(PixelLine {
        column: values[0],
        row: values[1],
        masked: config.is_masked(),
        stages: vec![config.stage1.cell(), config.stage2.cell()],
    })
}

fn parse_clicpix2_line(line: &str) -> Option<PixelLine> {
    let values = fields::<u16>(line, 7)?;
    let threshold = u8::try_from(values[3]).ok()?;
    let config = clicpix2::PixelConfig::new(
        values[2] != 0,
        threshold,
        values[4] != 0,
        values[5] != 0,
        values[6] != 0,
    );
    Some(PixelLine {
        column: values[1],
        row: values[0],
        masked: config.mask(),
        stages: vec![config.cell()],
    })
}
