/*!
# Chip Control Tool

Command-line front end for configuring pixel-detector readout chips and
decoding their readout frames.

## Features

- Register bit vector generation from a register layout file
- Matrix programming sequences from matrix definition files
- Zero-suppressed and SerDes packet frame decoding, raw field splitting
- Emulated configure-and-verify cycle with retries
- TOML configuration file

## Usage

```bash
chipctl config --output chipctl.toml
chipctl bitvector --layout registers.toml --direction lsb-first
chipctl --chip clicpix2 program --matrix matrix.cfg
chipctl decode frame.txt --split
chipctl configure --matrix matrix.cfg --corrupt 1
```

Logs go to stderr, data to stdout.
*/

use anyhow::{bail, Context, Result};
use chipcodec::matrix_file::read_matrix_file;
use chipcodec::pixel::{clicpix2, clictd};
use chipcodec::{
    pack_bits, ChipDescriptor, Coordinate, DecodeOptions, FrameDecoder, LoopbackTransport, MatrixConfig,
    MatrixDriver, MatrixFileFormat, MatrixProgrammer, PacketDecoder, ParameterRegistry, PixelCell, RegisterLayout,
    ShiftDirection,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{AppConfig, OutputFormat};

#[derive(Parser)]
#[command(name = "chipctl")]
#[command(about = "Configuration bitstreams and frame decoding for pixel-detector readout chips")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "chipctl.toml")]
    config: PathBuf,

    /// Chip type, overrides the configuration file
    #[arg(long)]
    chip: Option<String>,

    /// Output JSON instead of hex
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Serialize a register layout into its shift register bit vector
    Bitvector {
        /// Register layout file
        #[arg(short, long)]
        layout: Option<PathBuf>,

        /// Shift direction (msb-first, lsb-first, global-inverted-msb-first, global-inverted-lsb-first)
        #[arg(short, long)]
        direction: Option<String>,
    },

    /// Print the register writes programming a pixel matrix
    Program {
        /// Matrix definition file; all pixels keep their defaults without one
        #[arg(short, long)]
        matrix: Option<PathBuf>,
    },

    /// Decode a readout frame (hex words, whitespace separated)
    Decode {
        /// Frame file
        input: PathBuf,

        /// Print the raw fields without structural validation
        #[arg(long)]
        split: bool,

        /// Pixels count with the long counter
        #[arg(long)]
        long_counter: bool,
    },

    /// Configure an emulated chip, verifying the read-back
    Configure {
        /// Matrix definition file
        #[arg(short, long)]
        matrix: Option<PathBuf>,

        /// Number of corrupted read-backs the emulator produces
        #[arg(long, default_value = "0")]
        corrupt: u32,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "chipctl.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        AppConfig::load_from_file(&cli.config)?
    } else {
        AppConfig::new()
    };
    if let Some(chip) = &cli.chip {
        config.device.chip = chip.clone();
    }
    if cli.json {
        config.output.format = OutputFormat::Json;
    }

    let level = match cli.verbose {
        0 => config.output.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = if cli.verbose == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level))
    } else {
        EnvFilter::new(&level)
    };

    // Initialize logging to stderr to keep stdout clean for data
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if cli.config.exists() {
        debug!("Loaded configuration from {}", cli.config.display());
    }

    match cli.command {
        Commands::Bitvector { layout, direction } => run_bitvector(&config, layout, direction),
        Commands::Program { matrix } => run_program(&config, matrix),
        Commands::Decode {
            input,
            split,
            long_counter,
        } => run_decode(&config, &input, split, long_counter),
        Commands::Configure { matrix, corrupt } => run_configure(&config, matrix, corrupt),
        Commands::Config { output } => generate_config_file(output),
    }
}

/// Load the matrix configuration from a file, or the chip defaults
fn load_matrix(chip: &ChipDescriptor, path: Option<&Path>) -> Result<MatrixConfig> {
    match path {
        Some(path) => {
            let file = read_matrix_file(chip, path)
                .with_context(|| format!("Failed to load matrix file {}", path.display()))?;
            Ok(file.config)
        }
        None => {
            warn!("No matrix file given, using {} defaults for every pixel", chip.name);
            Ok(MatrixConfig::default_for(chip))
        }
    }
}

fn bit_string(bits: &[bool]) -> String {
    bits.iter().map(|&b| if b { '1' } else { '0' }).collect()
}

fn run_bitvector(config: &AppConfig, layout: Option<PathBuf>, direction: Option<String>) -> Result<()> {
    let Some(path) = layout.or_else(|| config.registers.layout.clone()) else {
        bail!("No register layout given: use --layout or set [registers] layout");
    };
    let direction = match direction {
        Some(text) => text.parse::<ShiftDirection>()?,
        None => config.registers.direction,
    };

    let layout = RegisterLayout::load_from_file(&path)
        .with_context(|| format!("Failed to load register layout {}", path.display()))?;
    let registry = ParameterRegistry::from_layout(&layout)?;
    let bits = registry.generate_bit_vector(direction);
    info!(
        "{} parameters, {} bits, direction {}",
        registry.len(),
        bits.len(),
        direction
    );

    match config.output.format {
        OutputFormat::Hex => {
            println!("{}", bit_string(&bits));
            println!("{}", hex::encode(pack_bits(&bits)));
        }
        OutputFormat::Json => {
            let parameters: Vec<_> = registry
                .iter()
                .map(|(name, field)| {
                    json!({
                        "name": name,
                        "width": field.width(),
                        "bit_order": field.bit_order(),
                        "value": field.value(),
                    })
                })
                .collect();
            let output = json!({
                "direction": direction.as_str(),
                "length": bits.len(),
                "bits": bit_string(&bits),
                "bytes": hex::encode(pack_bits(&bits)),
                "parameters": parameters,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

fn run_program(config: &AppConfig, matrix: Option<PathBuf>) -> Result<()> {
    let chip = config.chip()?;
    let matrix = matrix.or_else(|| config.device.matrix.clone());
    let matrix_config = load_matrix(&chip, matrix.as_deref())?;

    let program = MatrixProgrammer::for_chip(&chip).program(&matrix_config)?;
    info!(
        "{} stage(s), {} register writes",
        program.stages.len(),
        program.total_writes()
    );

    match config.output.format {
        OutputFormat::Hex => {
            for stage in &program.stages {
                let pairs: Vec<u8> = stage
                    .writes
                    .iter()
                    .flat_map(|w| [w.address, w.value])
                    .collect();
                println!("stage {} ({} bits): {}", stage.stage + 1, stage.bit_count, hex::encode(pairs));
            }
        }
        OutputFormat::Json => {
            let stages: Vec<_> = program
                .stages
                .iter()
                .map(|stage| {
                    json!({
                        "stage": stage.stage + 1,
                        "bit_count": stage.bit_count,
                        "writes": stage.writes,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json!({ "chip": chip.name, "stages": stages }))?);
        }
    }
    Ok(())
}

/// Parse whitespace separated 32-bit hex words, `0x` prefix optional
fn read_frame_words(path: &Path) -> Result<Vec<u32>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read frame file {}", path.display()))?;

    content
        .split_whitespace()
        .enumerate()
        .map(|(index, token)| {
            let digits = token.trim_start_matches("0x").trim_start_matches("0X");
            let padded = format!("{:0>8}", digits);
            let bytes = hex::decode(&padded)
                .with_context(|| format!("Word {} \"{}\" is not hex", index, token))?;
            let bytes: [u8; 4] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("Word {} \"{}\" is wider than 32 bits", index, token))?;
            Ok(u32::from_be_bytes(bytes))
        })
        .collect()
}

fn run_decode(config: &AppConfig, input: &Path, split: bool, long_counter: bool) -> Result<()> {
    let chip = config.chip()?;
    let words = read_frame_words(input)?;
    debug!("Read {} words from {}", words.len(), input.display());

    if chip.packet.is_some() {
        if split {
            bail!("--split needs a zero-suppressed frame, {} reads out packets", chip.name);
        }
        let matrix = PacketDecoder::for_chip(&chip)?.decode(&words)?;
        let hits: Vec<_> = matrix.iter().filter(|(_, cell)| cell.latches() != 0).collect();
        info!("Decoded packet frame with {} hit pixel(s)", hits.len());
        return print_hits(config, &chip, &hits, false, None);
    }

    let options = DecodeOptions {
        long_counter: long_counter || config.device.long_counter,
    };
    let decoder = FrameDecoder::for_chip(&chip)?.with_options(options);

    if split {
        let fields = decoder.split_frame(&words);
        match config.output.format {
            OutputFormat::Hex => {
                for field in &fields {
                    println!("{:06x}", field);
                }
            }
            OutputFormat::Json => println!("{}", serde_json::to_string(&fields)?),
        }
        return Ok(());
    }

    let frame = decoder.decode_frame(&words)?;
    info!("Decoded frame with {} hit pixel(s)", frame.hits());

    let hits: Vec<_> = frame.iter().filter(|(_, cell)| cell.latches() != 0).collect();
    print_hits(config, &chip, &hits, frame.long_counter(), Some(frame.bits_consumed()))
}

fn print_hits(
    config: &AppConfig,
    chip: &ChipDescriptor,
    hits: &[(Coordinate, PixelCell)],
    long_counter: bool,
    bits_consumed: Option<usize>,
) -> Result<()> {
    match config.output.format {
        OutputFormat::Hex => {
            for (coordinate, cell) in hits {
                match chip.file_format {
                    MatrixFileFormat::Clictd => {
                        let readout = clictd::Readout::from_cell(*cell, long_counter);
                        println!("{} {} {:06x} {}", coordinate.column, coordinate.row, cell.latches(), readout);
                    }
                    MatrixFileFormat::Clicpix2 => {
                        let readout = clicpix2::Readout::new(cell.latches());
                        println!(
                            "{} {} {:04x} flag={} tot={} toa={}",
                            coordinate.column,
                            coordinate.row,
                            cell.latches(),
                            u8::from(readout.flag()),
                            readout.tot(),
                            readout.toa()
                        );
                    }
                }
            }
        }
        OutputFormat::Json => {
            let pixels: Vec<_> = hits
                .iter()
                .map(|(coordinate, cell)| {
                    json!({
                        "column": coordinate.column,
                        "row": coordinate.row,
                        "latches": cell.latches(),
                    })
                })
                .collect();
            let output = json!({
                "chip": chip.name,
                "long_counter": long_counter,
                "bits_consumed": bits_consumed,
                "hits": pixels,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

fn run_configure(config: &AppConfig, matrix: Option<PathBuf>, corrupt: u32) -> Result<()> {
    let chip = config.chip()?;
    let matrix = matrix.or_else(|| config.device.matrix.clone());
    let matrix_config = load_matrix(&chip, matrix.as_deref())?;

    let transport = LoopbackTransport::new(&chip).with_corrupt_reads(corrupt);
    let mut driver = MatrixDriver::new(chip, transport)?.with_retry_max(config.device.retry_matrix_config);

    let attempts = driver
        .configure_matrix(&matrix_config)
        .with_context(|| "Matrix configuration failed")?;
    let writes = driver.transport().writes().len();

    match config.output.format {
        OutputFormat::Hex => println!("configured after {} attempt(s), {} register writes", attempts, writes),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&json!({ "attempts": attempts, "writes": writes }))?
        ),
    }
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("Generated configuration file: {}", output_path.display());
    println!("Edit the file to customize settings, then run:");
    println!("   chipctl --config {} <command>", output_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_frame_words() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0xFFFFA800 1").unwrap();
        writeln!(file, "deadbeef").unwrap();
        file.flush().unwrap();

        let words = read_frame_words(file.path()).unwrap();
        assert_eq!(words, vec![0xFFFF_A800, 0x0000_0001, 0xDEAD_BEEF]);
    }

    #[test]
    fn test_decode_packet_frame_file() {
        let chip = ChipDescriptor::clicpix2();
        let mut matrix = chipcodec::PixelMatrix::new(clicpix2::PIXEL_BITS);
        matrix.insert(4, 4, PixelCell::new(clicpix2::PIXEL_BITS, 0x2105));
        let words = chipcodec::PacketEncoder::new(chip.packet.unwrap()).encode(&matrix).unwrap();

        let mut file = NamedTempFile::new().unwrap();
        for word in &words {
            writeln!(file, "{:08x}", word).unwrap();
        }
        file.flush().unwrap();

        let mut config = AppConfig::new();
        config.device.chip = "clicpix2".to_string();
        run_decode(&config, file.path(), false, false).unwrap();
        assert!(run_decode(&config, file.path(), true, false).is_err());
    }

    #[test]
    fn test_read_frame_words_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "12345678 1ffffffff").unwrap();
        file.flush().unwrap();
        assert!(read_frame_words(file.path()).is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "xyz").unwrap();
        file.flush().unwrap();
        assert!(read_frame_words(file.path()).is_err());
    }

    #[test]
    fn test_bit_string() {
        assert_eq!(bit_string(&[true, false, true]), "101");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["chipctl", "--chip", "clicpix2", "decode", "frame.txt", "--split", "--json"]).unwrap();
        assert_eq!(cli.chip.as_deref(), Some("clicpix2"));
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Decode { split: true, .. }));
    }
}
