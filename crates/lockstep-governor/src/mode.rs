//! Run-mode selection from the process environment.

use std::env;

use thiserror::Error;

/// Environment variable selecting the run mode.
pub const MODE_ENV: &str = "GOV_MODE";
/// Environment variable fixing the random-mode seed.
pub const SEED_ENV: &str = "GOV_SEED";
/// Environment variable enabling the CPU-pinning diagnostic.
pub const PIN_ENV: &str = "GOV_CPU_PIN";

/// Errors from environment configuration. Always fatal at load.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognised GOV_MODE value {value:?}")]
    UnknownMode { value: String },

    #[error("invalid GOV_SEED value {value:?}")]
    InvalidSeed { value: String },
}

/// How scheduling decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Pick a uniformly random subscribed thread at every decision and
    /// record the choice.
    Random,
    /// Depth-first enumeration of all schedules, driven by the stored
    /// prefix from the previous run.
    Explore,
    /// Replay the stored schedule exactly, once.
    Preset,
}

impl RunMode {
    /// Parse a `GOV_MODE` value.
    pub fn parse(value: &str) -> Result<RunMode, ConfigError> {
        match value {
            "RUN_RANDOM" | "RANDOM" | "RAND" => Ok(RunMode::Random),
            "RUN_EXPLORE" | "EXPLORE" | "EXP" => Ok(RunMode::Explore),
            "RUN_PRESET" | "PRESET" | "PRE" => Ok(RunMode::Preset),
            _ => Err(ConfigError::UnknownMode {
                value: value.to_owned(),
            }),
        }
    }

    /// Read the mode from the environment; unset selects preset.
    pub fn from_env() -> Result<RunMode, ConfigError> {
        match env::var(MODE_ENV) {
            Ok(value) => RunMode::parse(&value),
            Err(_) => Ok(RunMode::Preset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_all_spellings() {
        for value in ["RUN_RANDOM", "RANDOM", "RAND"] {
            assert_eq!(RunMode::parse(value), Ok(RunMode::Random));
        }
        for value in ["RUN_EXPLORE", "EXPLORE", "EXP"] {
            assert_eq!(RunMode::parse(value), Ok(RunMode::Explore));
        }
        for value in ["RUN_PRESET", "PRESET", "PRE"] {
            assert_eq!(RunMode::parse(value), Ok(RunMode::Preset));
        }
    }

    #[test]
    fn rejects_unknown_values() {
        assert_eq!(
            RunMode::parse("random"),
            Err(ConfigError::UnknownMode {
                value: "random".to_owned()
            })
        );
        assert!(RunMode::parse("").is_err());
        assert!(RunMode::parse("RUN_FOREVER").is_err());
    }
}
