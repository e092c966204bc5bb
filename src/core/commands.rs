//! Command lines for the external loader tool.
//!
//! The flag layout is fixed by the loader and must be reproduced exactly:
//!
//! - `loader -l`
//! - `loader -u <ftdi data file>`
//! - `loader [-p <au_loader.bin>] (-f|-r) <bin> -b <index>`
//! - `loader [-p <au_loader.bin>] -e -b <index>`

use std::path::Path;

use super::models::Board;
use super::process::CommandLine;
use crate::config::ToolPaths;

pub const LIST_FLAG: &str = "-l";
pub const EEPROM_FLAG: &str = "-u";
pub const LOADER_BIN_FLAG: &str = "-p";
pub const FLASH_FLAG: &str = "-f";
pub const RAM_FLAG: &str = "-r";
pub const ERASE_FLAG: &str = "-e";
pub const DEVICE_FLAG: &str = "-b";

pub fn list_devices(tools: &ToolPaths) -> CommandLine {
    CommandLine::new(&tools.loader).arg(LIST_FLAG)
}

pub fn flash_eeprom(tools: &ToolPaths, board: Board) -> CommandLine {
    CommandLine::new(&tools.loader)
        .arg(EEPROM_FLAG)
        .path_arg(tools.ftdi_data(board))
}

/// The Au bridge bitstream is only needed when writing the Au's flash.
pub fn program(
    tools: &ToolPaths,
    bin: &Path,
    board: Board,
    use_flash: bool,
    device_index: usize,
) -> CommandLine {
    let mut cmd = CommandLine::new(&tools.loader);
    if board == Board::Au && use_flash {
        cmd = cmd.arg(LOADER_BIN_FLAG).path_arg(&tools.au_loader_bin);
    }
    cmd.arg(if use_flash { FLASH_FLAG } else { RAM_FLAG })
        .path_arg(bin)
        .arg(DEVICE_FLAG)
        .arg(device_index.to_string())
}

pub fn erase(tools: &ToolPaths, board: Board, device_index: usize) -> CommandLine {
    let mut cmd = CommandLine::new(&tools.loader);
    if board == Board::Au {
        cmd = cmd.arg(LOADER_BIN_FLAG).path_arg(&tools.au_loader_bin);
    }
    cmd.arg(ERASE_FLAG)
        .arg(DEVICE_FLAG)
        .arg(device_index.to_string())
}
