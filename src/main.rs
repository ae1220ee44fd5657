// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

mod logging;

use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::path::PathBuf;
use tracing::info;
use xymodem::{
    BlockSize, CancelToken, OutgoingFile, Outcome, RealSerialPort, SessionController,
    TransferConfig, TransferRequest,
};

use crate::logging::{LogFormat, LogLevel, init_logging};

#[derive(Parser, Debug)]
#[command(name = "xymodem", version)]
#[command(about = "XMODEM/YMODEM file transfer over a serial port", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long, env = "XYMODEM_PORT")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// Log output format (stderr)
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send files (one file with --xmodem, a batch otherwise)
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Plain XMODEM instead of YMODEM
        #[arg(long)]
        xmodem: bool,

        /// Data block size (128 or 1024)
        #[arg(long, default_value = "1024", value_parser = parse_block_size, value_name = "BYTES")]
        block_size: BlockSize,
    },
    /// Receive files
    Receive {
        /// Directory to save received files
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Plain XMODEM instead of YMODEM
        #[arg(long)]
        xmodem: bool,

        /// File name to use when the sender supplies none (XMODEM)
        #[arg(long, default_value = "received.bin")]
        name: String,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn parse_block_size(s: &str) -> Result<BlockSize, String> {
    match s {
        "128" => Ok(BlockSize::Standard),
        "1024" | "1k" | "1K" => Ok(BlockSize::OneK),
        _ => Err(format!("Invalid block size: {}. Must be 128 or 1024", s)),
    }
}

/// Last path component of a name announced by the sender, if usable.
fn sanitize_filename(name: &str) -> Option<&str> {
    name.rsplit(['/', '\\'])
        .next()
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
}

fn install_ctrlc_handler(cancel: CancelToken) -> Result<(), String> {
    ctrlc::set_handler(move || cancel.cancel())
        .map_err(|err| format!("signal handler setup failed: {err}"))
}

fn exit_with(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { LogLevel::Debug } else { cli.log_level };
    init_logging(cli.log_format, level);

    let data_bits = parse_data_bits(cli.data_bits).unwrap_or_else(|e| exit_with(e));
    let parity = parse_parity(&cli.parity).unwrap_or_else(|e| exit_with(e));
    let stop_bits = parse_stop_bits(cli.stop_bits).unwrap_or_else(|e| exit_with(e));

    info!("Opening serial port: {}", cli.port);
    info!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits)
        .unwrap_or_else(|e| exit_with(format!("Failed to open serial port: {}", e)));

    let result = match cli.command {
        Commands::Send { files, xmodem, block_size } => send_files(serial_port, files, xmodem, block_size),
        Commands::Receive { output_dir, xmodem, name } => receive_files(serial_port, output_dir, xmodem, &name),
    };

    if let Err(e) = result {
        exit_with(e);
    }
}

fn transfer_config(xmodem: bool) -> TransferConfig {
    if xmodem {
        TransferConfig::xmodem()
    } else {
        TransferConfig::default()
    }
}

fn run(controller: SessionController) -> Result<Outcome, String> {
    install_ctrlc_handler(controller.cancel_token())?;
    controller
        .on_progress(|session| {
            info!(
                "{}: {} bytes",
                session.filename.as_deref().unwrap_or("transfer"),
                session.bytes_transferred
            )
        })
        .run()
        .map_err(|e| e.to_string())
}

fn send_files(serial_port: RealSerialPort, paths: Vec<PathBuf>, xmodem: bool, block_size: BlockSize) -> Result<(), String> {
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let data = std::fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| format!("{}: not a usable file name", path.display()))?;
        files.push(OutgoingFile::new(name, data));
    }

    let config = TransferConfig {
        block_size,
        ..transfer_config(xmodem)
    };

    let controller = SessionController::start(Box::new(serial_port), TransferRequest::Send { files }, config);
    if let Outcome::Sent(report) = run(controller)? {
        println!("Sent {} file(s), {} bytes", report.files, report.bytes_transferred);
    }
    Ok(())
}

fn receive_files(serial_port: RealSerialPort, output_dir: PathBuf, xmodem: bool, fallback_name: &str) -> Result<(), String> {
    if !output_dir.is_dir() {
        return Err(format!("Output directory not found: {}", output_dir.display()));
    }

    let controller = SessionController::start(Box::new(serial_port), TransferRequest::Receive, transfer_config(xmodem));
    let Outcome::Received(files) = run(controller)? else {
        return Ok(());
    };

    for file in files {
        let announced = file.filename.as_deref().unwrap_or(fallback_name);
        let name = sanitize_filename(announced)
            .ok_or_else(|| format!("Refusing to write file named {:?}", announced))?;
        let path = output_dir.join(name);
        std::fs::write(&path, &file.data).map_err(|e| format!("{}: {}", path.display(), e))?;
        println!("Received {} ({} bytes)", path.display(), file.data.len());
    }
    Ok(())
}
