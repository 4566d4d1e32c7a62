//! Database configuration module.
//!
//! Options are built in code and can be overridden from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `PAGEKV_PAGE_SIZE`: Page size for newly created files (default: `4096`)
//! - `PAGEKV_PATH`: Database file used by the CLI when no path argument is given
//!
//! # Invariants
//!
//! - a validated `page_size` is a power of two between 1024 and 65536

use std::path::PathBuf;

use crate::storage::page::{DEFAULT_PAGE_SIZE, validate_page_size};

const PAGE_SIZE_VAR: &str = "PAGEKV_PAGE_SIZE";
const PATH_VAR: &str = "PAGEKV_PATH";

/// Options for opening a database.
///
/// # Post-conditions
///
/// After `validate()` succeeds, `page_size_or_default()` is a usable page size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Page size in bytes.
    ///
    /// Used when a new file is created. When opening an existing file, a
    /// value that differs from the file's page size is an error; `None`
    /// accepts whatever the file uses.
    pub page_size: Option<usize>,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// A value is set but invalid.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Options {
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Page size to use for a new file.
    #[must_use]
    pub fn page_size_or_default(&self) -> usize {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// Check that every set value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(page_size) = self.page_size {
            validate_page_size(page_size).map_err(|e| ConfigError::InvalidValue {
                name: "page_size".to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Load options from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `PAGEKV_PAGE_SIZE` is set but is not a valid page size.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let Some(value) = lookup(PAGE_SIZE_VAR) else {
            return Ok(Self::default());
        };
        let page_size = value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
            name: PAGE_SIZE_VAR.to_string(),
            message: format!("'{value}' is not a number"),
        })?;
        validate_page_size(page_size).map_err(|e| ConfigError::InvalidValue {
            name: PAGE_SIZE_VAR.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::default().with_page_size(page_size))
    }
}

/// Database path from `PAGEKV_PATH`.
///
/// # Errors
///
/// Returns an error if the variable is not set or is empty.
pub fn database_path_from_env() -> Result<PathBuf, ConfigError> {
    path_from_lookup(|name| std::env::var(name).ok())
}

fn path_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<PathBuf, ConfigError> {
    let path = lookup(PATH_VAR).ok_or_else(|| ConfigError::MissingEnvVar(PATH_VAR.to_string()))?;
    if path.is_empty() {
        return Err(ConfigError::InvalidValue {
            name: PATH_VAR.to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(PathBuf::from(path))
}
