//! Program, emulate, read back and decode complete CLICTD and CLICpix2 matrices.

use chipcodec::pixel::{clicpix2, clictd};
use chipcodec::{
    ChipDescriptor, CodecError, DecodeOptions, FrameDecoder, FrameEncoder, LoopbackTransport, MatrixDriver,
    ParameterRegistry, RegisterLayout, ShiftDirection,
};
use std::io::Write;
use tempfile::NamedTempFile;

fn matrix_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# column row mask tp_dig tp_analog thr0 .. thr7").unwrap();
    for column in 0..16 {
        writeln!(file, "{} {} 0 0 0 {} 1 2 3 4 5 6 7", column, column * 8, column % 8).unwrap();
    }
    writeln!(file, "15 127 255 1 255 7 7 7 7 7 7 7 7").unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_configure_from_file_with_retry() {
    let chip = ChipDescriptor::clictd();
    let file = matrix_file();
    let transport = LoopbackTransport::new(&chip).with_corrupt_reads(2);
    let mut driver = MatrixDriver::new(chip, transport).unwrap();

    let attempts = driver.configure_matrix_from_file(file.path()).unwrap();
    assert_eq!(attempts, 3);
    assert!(driver.is_configured());

    let stage1 = driver.transport().stage(0).unwrap();
    let expected = clictd::PixelConfig::new(0, false, 0, &[3, 1, 2, 3, 4, 5, 6, 7]).unwrap();
    assert_eq!(stage1.get(3, 24), expected.stage1.cell());
    assert_eq!(stage1.get(0, 1).latches(), clictd::STAGE1_MASKED);
}

#[test]
fn test_configure_gives_up() {
    let chip = ChipDescriptor::clictd();
    let file = matrix_file();
    let transport = LoopbackTransport::new(&chip).with_corrupt_reads(3);
    let mut driver = MatrixDriver::new(chip, transport).unwrap();

    let err = driver.configure_matrix_from_file(file.path()).unwrap_err();
    assert!(matches!(err, CodecError::CommunicationFailed { attempts: 3 }));
}

#[test]
fn test_clicpix2_configure_from_file_with_retry() {
    let chip = ChipDescriptor::clicpix2();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# row column mask threshold cntmode tpenable longcnt").unwrap();
    writeln!(file, "0 0 0 7 1 0 0").unwrap();
    writeln!(file, "64 33 1 2 0 1 1 # hot pixel").unwrap();
    writeln!(file, "127 127 1 15 1 1 1").unwrap();
    file.flush().unwrap();

    let transport = LoopbackTransport::new(&chip).with_corrupt_reads(1);
    let mut driver = MatrixDriver::new(chip, transport).unwrap();
    let attempts = driver.configure_matrix_from_file(file.path()).unwrap();
    assert_eq!(attempts, 2);

    let latched = driver.transport().stage(0).unwrap();
    assert_eq!(latched.get(33, 64), clicpix2::PixelConfig::new(true, 2, false, true, true).cell());
    assert_eq!(latched.get(0, 0), clicpix2::PixelConfig::new(false, 7, true, false, false).cell());
}

#[test]
fn test_decode_data_frame() {
    let chip = ChipDescriptor::clictd();
    let layout = chip.frame.unwrap();

    let mut hit = clictd::Readout::new(0, false);
    hit.set_flag(true);
    hit.set_tot(12);
    hit.set_toa(200);
    hit.set_hits(3);

    let mut matrix = chipcodec::PixelMatrix::new(clictd::PIXEL_BITS);
    matrix.insert(2, 100, hit.cell());

    let stream = FrameEncoder::new(layout).encode(&matrix).unwrap();
    let frame = FrameDecoder::for_chip(&chip)
        .unwrap()
        .with_options(DecodeOptions { long_counter: false })
        .decode_frame(&stream)
        .unwrap();

    assert_eq!(frame.hits(), 1);
    let readout = clictd::Readout::from_cell(frame.get(2, 100), frame.long_counter());
    assert_eq!(readout.tot(), Some(12));
    assert_eq!(readout.toa(), 200);
    assert_eq!(readout.hits(), 3);
}

#[test]
fn test_register_layout_bit_vector() {
    let layout: RegisterLayout = toml::from_str(
        r#"
        [[register]]
        name = "vbias"
        bits = 4
        value = 9

        [[register]]
        name = "trim"
        bit_order = "0,2,1"
        value = 3
        "#,
    )
    .unwrap();

    let registry = ParameterRegistry::from_layout(&layout).unwrap();
    let bits = registry.generate_bit_vector(ShiftDirection::MsbFirst);
    // vbias 1001 MSB first, then trim bits 0, 2, 1 of 011
    assert_eq!(bits, vec![true, false, false, true, true, false, true]);
}
