//! CLI command implementations.
//!
//! | Module   | Commands handled  |
//! |----------|-------------------|
//! | `run`    | `Run`, `Plan`     |
//! | `status` | `Status`, `Clean` |

pub mod run;
pub mod status;

pub use run::{RunArgs, cmd_run};
pub use status::{cmd_clean, cmd_status};

use anyhow::Result;
use forge_parallel::config::ParallelConfig;
use std::path::Path;

/// Explicit `--config` file, else the project's `.forge/parallel.toml`, else defaults.
pub fn load_config(project_dir: &Path, config_path: Option<&Path>) -> Result<ParallelConfig> {
    match config_path {
        Some(path) => ParallelConfig::load(path),
        None => ParallelConfig::load_or_default(project_dir),
    }
}
