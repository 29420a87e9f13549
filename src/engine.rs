// SPDX-License-Identifier: MIT
//! Resolution of the CodeQL CLI installation.
//!
//! Workers are spawned as `codeql execute <mode>` subcommands. The `codeql`
//! binary is found either on `PATH` or via the `CODEQL_PATH` environment
//! variable (an absolute path to the binary). When an explicit path is used,
//! its directory is prepended to the child's `PATH` so that helper tools
//! shipped alongside the CLI resolve to the same installation.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Result, WorkerError};

/// Environment variable naming the CodeQL CLI binary.
pub const ENGINE_PATH_VAR: &str = "CODEQL_PATH";

/// Default binary name when no explicit path is configured.
pub const DEFAULT_ENGINE: &str = "codeql";

/// Locates the CodeQL CLI to spawn workers from.
///
/// Explicit and injectable: tests point the locator at fixture scripts, and
/// independent [`ServerManager`](crate::manager::ServerManager) instances can
/// carry different locators side by side.
#[derive(Debug, Clone)]
pub struct EngineLocator {
    program: PathBuf,
}

impl EngineLocator {
    /// Locator for an explicit program path (or bare binary name).
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Resolve the engine from the environment.
    ///
    /// Honors `CODEQL_PATH` when set: the value must be an absolute path to
    /// an existing file. A basename other than `codeql` is accepted but
    /// warned about. Without the variable, the bare `codeql` name is used
    /// and resolution is left to `PATH` at spawn time.
    pub fn from_env() -> Result<Self> {
        let Some(raw) = env::var_os(ENGINE_PATH_VAR) else {
            return Ok(Self::new(DEFAULT_ENGINE));
        };
        let path = PathBuf::from(&raw);
        if !path.is_absolute() {
            return Err(WorkerError::EnginePath(format!(
                "{ENGINE_PATH_VAR} must be an absolute path, got: {}",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(WorkerError::EnginePath(format!(
                "{ENGINE_PATH_VAR} points to a file that does not exist: {}",
                path.display()
            )));
        }
        if path.file_stem().and_then(|s| s.to_str()) != Some(DEFAULT_ENGINE) {
            warn!(
                path = %path.display(),
                "{ENGINE_PATH_VAR} basename is not `codeql`, using it anyway"
            );
        }
        info!(path = %path.display(), "CodeQL CLI resolved via {ENGINE_PATH_VAR}");
        Ok(Self::new(path))
    }

    /// The program to spawn.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Directory containing the binary, when the program path is absolute.
    pub fn bin_dir(&self) -> Option<&Path> {
        if self.program.is_absolute() {
            self.program.parent()
        } else {
            None
        }
    }

    /// `PATH` value for spawned workers: the engine directory (if known)
    /// prepended to the current `PATH`.
    pub fn spawn_path(&self) -> Option<OsString> {
        let dir = self.bin_dir()?;
        let mut paths = vec![dir.to_path_buf()];
        if let Some(current) = env::var_os("PATH") {
            paths.extend(env::split_paths(&current));
        }
        env::join_paths(paths).ok()
    }
}

impl Default for EngineLocator {
    fn default() -> Self {
        Self::new(DEFAULT_ENGINE)
    }
}
