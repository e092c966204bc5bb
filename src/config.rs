use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::Board;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "alchitry-loader.toml";

const ENV_PREFIX: &str = "ALCHITRY_LOADER_";

#[cfg(windows)]
const LOADER_EXECUTABLE: &str = "loader.exe";
#[cfg(not(windows))]
const LOADER_EXECUTABLE: &str = "loader";

const AU_FTDI_DATA: &str = "au_ftdi.data";
const CU_FTDI_DATA: &str = "cu_ftdi.data";
const AU_LOADER_BIN: &str = "au_loader.bin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the loader executable and its data files.
    pub tools_dir: PathBuf,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tools_dir: PathBuf::from("tools"),
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `ALCHITRY_LOADER_*` environment
    /// variables and finally command line overrides.
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn tools(&self) -> ToolPaths {
        ToolPaths::from_dir(&self.tools_dir)
    }
}

/// Resolved locations of the loader and the files it is handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub loader: PathBuf,
    pub au_ftdi_data: PathBuf,
    pub cu_ftdi_data: PathBuf,
    /// Always absolute; the loader is handed this path verbatim.
    pub au_loader_bin: PathBuf,
}

impl ToolPaths {
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let au_loader_bin = dir.join(AU_LOADER_BIN);
        let au_loader_bin = std::path::absolute(&au_loader_bin).unwrap_or(au_loader_bin);

        Self {
            loader: dir.join(LOADER_EXECUTABLE),
            au_ftdi_data: dir.join(AU_FTDI_DATA),
            cu_ftdi_data: dir.join(CU_FTDI_DATA),
            au_loader_bin,
        }
    }

    pub fn ftdi_data(&self, board: Board) -> &Path {
        match board {
            Board::Au => &self.au_ftdi_data,
            Board::Cu => &self.cu_ftdi_data,
        }
    }
}
