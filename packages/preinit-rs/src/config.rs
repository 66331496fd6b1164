//! Configuration read from the environment, with `.env` support.
//!
//! | variable                       | default           |
//! |--------------------------------|-------------------|
//! | `PREINIT_SNIPPET_VAR`          | `PREINIT_SNIPPET` |
//! | `PREINIT_SNIPPET_PATH`         | unset             |
//! | `PREINIT_IMPORT_SNIPPET`       | `true`            |
//! | `PREINIT_FLUSH`                | `standard`        |
//! | `PREINIT_INSPECTOR_DOCKING_MS` | `30000`           |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use dotenvy::dotenv;

use crate::error::PreInitError;
use crate::flush::FlushPlan;
use crate::snippet::SnippetSource;

/// Default variable holding the snippet JSON.
pub const DEFAULT_SNIPPET_VAR: &str = "PREINIT_SNIPPET";

/// Default inspector docking window.
pub const DEFAULT_INSPECTOR_DOCKING: Duration = Duration::from_secs(30);

/// Which flush plan runs at readiness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushMode {
    /// [`FlushPlan::standard`].
    #[default]
    Standard,
    /// [`FlushPlan::none`]; the loader flushes by hand.
    None,
}

impl FlushMode {
    /// The flush plan this mode stands for.
    pub fn plan(self) -> FlushPlan {
        match self {
            Self::Standard => FlushPlan::standard(),
            Self::None => FlushPlan::none(),
        }
    }
}

impl FromStr for FlushMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "none" => Ok(Self::None),
            other => Err(format!("expected `standard` or `none`, got {other:?}")),
        }
    }
}

/// Pre-initialization configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreInitConfig {
    /// Variable holding the snippet JSON.
    pub snippet_var: String,
    /// JSON file holding the snippet, if any.
    pub snippet_path: Option<PathBuf>,
    /// Seed the buffer with the snippet at construction.
    pub import_snippet: bool,
    /// Which flush plan runs at readiness.
    pub flush: FlushMode,
    /// How long inspector traces are kept before an inspector docks.
    pub inspector_docking: Duration,
}

impl Default for PreInitConfig {
    fn default() -> Self {
        Self {
            snippet_var: DEFAULT_SNIPPET_VAR.to_string(),
            snippet_path: None,
            import_snippet: true,
            flush: FlushMode::Standard,
            inspector_docking: DEFAULT_INSPECTOR_DOCKING,
        }
    }
}

impl PreInitConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self::from_lookup(|var| env::var(var).ok())?)
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PreInitError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            snippet_var: lookup("PREINIT_SNIPPET_VAR").unwrap_or(defaults.snippet_var),
            snippet_path: lookup("PREINIT_SNIPPET_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            import_snippet: match lookup("PREINIT_IMPORT_SNIPPET") {
                Some(value) => parse_bool(&value).ok_or_else(|| {
                    invalid(
                        "PREINIT_IMPORT_SNIPPET",
                        format!("expected a boolean, got {value:?}"),
                    )
                })?,
                None => defaults.import_snippet,
            },
            flush: match lookup("PREINIT_FLUSH") {
                Some(value) => value
                    .parse()
                    .map_err(|reason| invalid("PREINIT_FLUSH", reason))?,
                None => defaults.flush,
            },
            inspector_docking: match lookup("PREINIT_INSPECTOR_DOCKING_MS") {
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(|_| {
                        invalid(
                            "PREINIT_INSPECTOR_DOCKING_MS",
                            format!("expected milliseconds, got {value:?}"),
                        )
                    })?,
                None => defaults.inspector_docking,
            },
        })
    }

    /// Where to look for the snippet, in priority order.
    pub fn snippet_sources(&self) -> Vec<SnippetSource> {
        let mut sources = vec![SnippetSource::Env(self.snippet_var.clone())];
        if let Some(path) = &self.snippet_path {
            sources.push(SnippetSource::File(path.clone()));
        }
        sources
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid(var: &str, reason: String) -> PreInitError {
    PreInitError::InvalidConfig {
        var: var.to_string(),
        reason,
    }
}
