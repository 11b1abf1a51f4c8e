//! Runtime environment activation for the launcher's children.

use super::LaunchError;
use std::path::{Path, PathBuf};

/// Conventional location of the environment file, relative to the working directory.
pub const DEFAULT_ENV_FILE: &str = ".telemetry/env";

/// A program to run, plus the subcommand to put in front of its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramRef {
    pub path: PathBuf,
    pub subcommand: Option<&'static str>,
}

/// Everything the children need: which programs to run and which variables to set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub ingest: ProgramRef,
    pub view: ProgramRef,
    pub vars: Vec<(String, String)>,
}

/// Resolve both programs and load the env file.
///
/// `env_file = None` means the default location, which may be absent.
pub fn activate(
    env_file: Option<&Path>,
    ingest_program: Option<&Path>,
    view_program: Option<&Path>,
) -> Result<Environment, LaunchError> {
    let vars = match env_file {
        Some(p) => load_env_file(p)?,
        None => {
            let default = Path::new(DEFAULT_ENV_FILE);
            if default.is_file() {
                load_env_file(default)?
            } else {
                Vec::new()
            }
        }
    };

    let self_exe = || {
        std::env::current_exe()
            .map_err(|e| LaunchError::Activation(format!("locate current executable: {e}")))
    };
    let ingest = match ingest_program {
        Some(p) => ProgramRef {
            path: resolve_program(p)?,
            subcommand: None,
        },
        None => ProgramRef {
            path: self_exe()?,
            subcommand: Some("ingest"),
        },
    };
    let view = match view_program {
        Some(p) => ProgramRef {
            path: resolve_program(p)?,
            subcommand: None,
        },
        None => ProgramRef {
            path: self_exe()?,
            subcommand: Some("view"),
        },
    };

    Ok(Environment { ingest, view, vars })
}

/// Read a dotenv file: `#` comments (inline too), an optional `export `
/// prefix, single or double quotes, and escapes inside double quotes.
fn load_env_file(path: &Path) -> Result<Vec<(String, String)>, LaunchError> {
    let activation = |e: dotenvy::Error| {
        LaunchError::Activation(format!("env file {}: {e}", path.display()))
    };
    dotenvy::from_path_iter(path)
        .map_err(activation)?
        .map(|item| item.map_err(activation))
        .collect()
}

/// Paths with a directory part must exist; bare names are looked up on `PATH`.
fn resolve_program(p: &Path) -> Result<PathBuf, LaunchError> {
    if p.components().count() > 1 || p.is_absolute() {
        if p.is_file() {
            return Ok(p.to_path_buf());
        }
        return Err(LaunchError::Activation(format!(
            "program not found: {}",
            p.display()
        )));
    }
    std::env::var_os("PATH")
        .into_iter()
        .flat_map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .map(|dir| dir.join(p))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            LaunchError::Activation(format!("program not found on PATH: {}", p.display()))
        })
}
