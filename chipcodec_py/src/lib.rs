/*!
# chipcodec_py - Python bindings for the chip codec

Frame decoding, raw field splitting, register bit vectors and matrix
programming sequences, returned as numpy arrays.

## Usage

```python
import chipcodec_py

decoder = chipcodec_py.Decoder("clictd", long_counter=False)
pixels = decoder.decode(words)        # (columns, rows) uint64 array
hits = decoder.hits(words)            # structured array: column, row, latches
fields = decoder.split(words)         # raw fields, no validation

bits = chipcodec_py.generate_bit_vector("registers.toml", "lsb-first")
stages = chipcodec_py.program_matrix("clicpix2", "matrix.cfg")
```
*/

use chipcodec::matrix_file::read_matrix_file;
use chipcodec::{
    ChipDescriptor, CodecError, DecodeOptions, FrameDecoder, MatrixConfig, MatrixProgrammer, ParameterRegistry,
    RegisterLayout, ShiftDirection,
};
use numpy::ToPyArray;
use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyModule;
use pyo3::Bound;
use tracing::debug;

/// Map codec errors onto Python exceptions
fn to_py_err(error: CodecError) -> PyErr {
    match error {
        CodecError::Io(_) | CodecError::Config(_) => PyIOError::new_err(error.to_string()),
        other => PyValueError::new_err(other.to_string()),
    }
}

/// Python wrapper for the frame decoder of one chip
#[pyclass(name = "Decoder")]
pub struct PyDecoder {
    chip: ChipDescriptor,
    inner: FrameDecoder,
}

#[pymethods]
impl PyDecoder {
    #[new]
    #[pyo3(signature = (chip="clictd", long_counter=false))]
    fn new(chip: &str, long_counter: bool) -> PyResult<Self> {
        let chip = ChipDescriptor::by_name(chip).map_err(|e| PyValueError::new_err(e.to_string()))?;
        let inner = FrameDecoder::for_chip(&chip)
            .map_err(|e| PyValueError::new_err(e.to_string()))?
            .with_options(DecodeOptions { long_counter });
        Ok(Self { chip, inner })
    }

    #[getter]
    fn chip(&self) -> &str {
        &self.chip.name
    }

    #[getter]
    fn columns(&self) -> u16 {
        self.inner.layout().columns
    }

    #[getter]
    fn rows(&self) -> u16 {
        self.inner.layout().rows
    }

    #[getter]
    fn long_counter(&self) -> bool {
        self.inner.options().long_counter
    }

    /// Decode a complete frame
    ///
    /// Args:
    ///     words: 32-bit readout words
    ///
    /// Returns:
    ///     uint64 array of shape (columns, rows) with the pixel latches
    fn decode(&self, py: Python, words: Vec<u32>) -> PyResult<PyObject> {
        let frame = self.inner.decode_frame(&words).map_err(to_py_err)?;
        debug!("Decoded {} words, {} hit pixel(s)", words.len(), frame.hits());

        let shape = (frame.columns() as usize, frame.rows() as usize);
        let array = frame.to_dense().to_pyarray_bound(py);
        let reshaped = array.call_method1("reshape", (shape,))?;
        Ok(reshaped.to_object(py))
    }

    /// Decode a complete frame and return only pixels with data
    ///
    /// Returns:
    ///     Numpy structured array with the fields column, row and latches
    fn hits(&self, py: Python, words: Vec<u32>) -> PyResult<PyObject> {
        let frame = self.inner.decode_frame(&words).map_err(to_py_err)?;

        let mut columns = Vec::new();
        let mut rows = Vec::new();
        let mut latches = Vec::new();
        for (coordinate, cell) in frame.iter().filter(|(_, cell)| cell.latches() != 0) {
            columns.push(coordinate.column);
            rows.push(coordinate.row);
            latches.push(cell.latches());
        }

        let numpy = py.import_bound("numpy")?;
        let dtype = numpy.call_method1("dtype", (vec![("column", "u2"), ("row", "u2"), ("latches", "u8")],))?;
        let structured_array = numpy.call_method1("zeros", (latches.len(), dtype))?;
        structured_array.set_item("column", columns.to_pyarray_bound(py))?;
        structured_array.set_item("row", rows.to_pyarray_bound(py))?;
        structured_array.set_item("latches", latches.to_pyarray_bound(py))?;
        Ok(structured_array.to_object(py))
    }

    /// Split a frame into its raw fields without validating the structure
    fn split(&self, py: Python, words: Vec<u32>) -> PyObject {
        self.inner.split_frame(&words).to_pyarray_bound(py).to_object(py)
    }
}

/// Serialize a register layout file into its shift register bit vector
#[pyfunction]
#[pyo3(signature = (layout, direction="msb-first"))]
fn generate_bit_vector(py: Python, layout: &str, direction: &str) -> PyResult<PyObject> {
    let direction: ShiftDirection = direction.parse().map_err(to_py_err)?;
    let layout = RegisterLayout::load_from_file(layout).map_err(to_py_err)?;
    let registry = ParameterRegistry::from_layout(&layout).map_err(to_py_err)?;
    Ok(registry.generate_bit_vector(direction).to_pyarray_bound(py).to_object(py))
}

/// Register writes programming a chip's matrix
///
/// Returns:
///     One uint8 array of shape (writes, 2) per stage, columns address and value
#[pyfunction]
#[pyo3(signature = (chip, matrix=None))]
fn program_matrix(py: Python, chip: &str, matrix: Option<&str>) -> PyResult<Vec<PyObject>> {
    let chip = ChipDescriptor::by_name(chip).map_err(|e| PyValueError::new_err(e.to_string()))?;
    let config = match matrix {
        Some(path) => read_matrix_file(&chip, path).map_err(to_py_err)?.config,
        None => MatrixConfig::default_for(&chip),
    };
    let program = MatrixProgrammer::for_chip(&chip).program(&config).map_err(to_py_err)?;

    program
        .stages
        .iter()
        .map(|stage| {
            let pairs: Vec<u8> = stage.writes.iter().flat_map(|w| [w.address, w.value]).collect();
            let array = pairs.to_pyarray_bound(py);
            let reshaped = array.call_method1("reshape", ((stage.writes.len(), 2usize),))?;
            Ok(reshaped.to_object(py))
        })
        .collect()
}

/// Python module definition
#[pymodule]
fn chipcodec_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyDecoder>()?;
    m.add_function(wrap_pyfunction!(generate_bit_vector, m)?)?;
    m.add_function(wrap_pyfunction!(program_matrix, m)?)?;
    m.add("__version__", chipcodec::VERSION)?;

    // Add module docstring
    m.add("__doc__", "Pixel-detector chip configuration and frame decoding")?;

    Ok(())
}
