//! Run directives: the `sim.ini` file written by the setup step.
//!
//! The file is a flat list of `key=value` lines describing where the
//! simulator lives, which scenario to run and where it writes its output.
//! Relative directories resolve against `baseDirSim`, which itself resolves
//! against the directory containing the directives file.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::supervisor::ProgramSpec;

/// Errors loading run directives.
#[derive(Debug, thiserror::Error)]
pub enum DirectivesError {
    /// The directives file could not be read.
    #[error("failed to read directives {}: {source}", .path.display())]
    Io {
        /// Directives file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A required key is absent or empty.
    #[error("directives are missing required key `{key}`")]
    MissingKey {
        /// The missing key.
        key: &'static str,
    },

    /// A boolean key holds something other than a recognised flag.
    #[error("directive `{key}` has invalid boolean value `{value}`")]
    InvalidBool {
        /// The offending key.
        key: &'static str,
        /// The raw value.
        value: String,
    },

    /// `extraArgs` could not be split into shell words.
    #[error("directive `extraArgs` is not valid shell syntax: {source}")]
    ExtraArgs {
        /// Tokenizer error.
        source: shell_words::ParseError,
    },
}

/// Parsed and resolved run directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectives {
    /// Simulator working directory.
    pub base_dir: PathBuf,
    /// Scenario file passed as `--config`.
    pub config_file: String,
    /// Directory the simulator writes agent snapshots into.
    pub agents_dir: PathBuf,
    /// Root directory watched for the dataset directories.
    pub output_dir: PathBuf,
    /// Executable override.
    pub exec_cmd: Option<PathBuf>,
    /// Extra command line arguments appended after `--config`.
    pub extra_args: Vec<String>,
    /// Flood output directory, when the flood dataset is enabled.
    pub flood_dir: Option<PathBuf>,
}

impl RunDirectives {
    /// Read and parse the directives file at `path`.
    pub async fn load(path: &Path) -> Result<Self, DirectivesError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DirectivesError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let anchor = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, anchor)
    }

    /// Parse directives text. Relative `baseDirSim` resolves against
    /// `anchor`.
    pub fn parse(text: &str, anchor: &Path) -> Result<Self, DirectivesError> {
        let mut raw = RawDirectives::default();

        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                debug!(line = index.saturating_add(1), text = trimmed, "Ignoring line without `=`");
                continue;
            };
            let value = unquote(value.trim());
            if value.is_empty() {
                continue;
            }
            let slot = match key.trim() {
                "baseDirSim" => &mut raw.base_dir,
                "configFile" => &mut raw.config_file,
                "agentsDir" => &mut raw.agents_dir,
                "outputDirectory" => &mut raw.output_dir,
                "execCmd" => &mut raw.exec_cmd,
                "extraArgs" => &mut raw.extra_args,
                "floodEnabled" => &mut raw.flood_enabled,
                "floodDir" => &mut raw.flood_dir,
                other => {
                    debug!(key = other, "Ignoring unknown directive");
                    continue;
                }
            };
            *slot = Some(value.to_owned());
        }

        raw.resolve(anchor)
    }

    /// Command that launches the simulator for these directives.
    ///
    /// Arguments are `--config <configFile>` followed by `extraArgs`.
    pub fn program_spec(&self, default_executable: &Path) -> ProgramSpec {
        let mut args = vec![String::from("--config"), self.config_file.clone()];
        args.extend(self.extra_args.iter().cloned());
        ProgramSpec {
            program: self
                .exec_cmd
                .clone()
                .unwrap_or_else(|| default_executable.to_path_buf()),
            args,
            working_dir: self.base_dir.clone(),
        }
    }

    /// Whether the flood dataset is streamed.
    pub const fn flood_enabled(&self) -> bool {
        self.flood_dir.is_some()
    }
}

#[derive(Default)]
struct RawDirectives {
    base_dir: Option<String>,
    config_file: Option<String>,
    agents_dir: Option<String>,
    output_dir: Option<String>,
    exec_cmd: Option<String>,
    extra_args: Option<String>,
    flood_enabled: Option<String>,
    flood_dir: Option<String>,
}

impl RawDirectives {
    fn resolve(self, anchor: &Path) -> Result<RunDirectives, DirectivesError> {
        let base_dir = anchor.join(required(self.base_dir, "baseDirSim")?);
        let config_file = required(self.config_file, "configFile")?;
        let agents_dir = base_dir.join(required(self.agents_dir, "agentsDir")?);
        let output_dir = self
            .output_dir
            .map_or_else(|| base_dir.clone(), |dir| base_dir.join(dir));

        let flood_enabled = match self.flood_enabled {
            Some(value) => parse_bool("floodEnabled", &value)?,
            None => false,
        };
        let flood_dir = if flood_enabled {
            Some(base_dir.join(required(self.flood_dir, "floodDir")?))
        } else {
            None
        };

        let extra_args = match self.extra_args {
            Some(args) => shell_words::split(&args)
                .map_err(|source| DirectivesError::ExtraArgs { source })?,
            None => Vec::new(),
        };

        Ok(RunDirectives {
            base_dir,
            config_file,
            agents_dir,
            output_dir,
            exec_cmd: self.exec_cmd.map(PathBuf::from),
            extra_args,
            flood_dir,
        })
    }
}

fn required(value: Option<String>, key: &'static str) -> Result<String, DirectivesError> {
    value.ok_or(DirectivesError::MissingKey { key })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, DirectivesError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(DirectivesError::InvalidBool {
            key,
            value: value.to_owned(),
        }),
    }
}

/// Strip one pair of matching surrounding quotes.
fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
