use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors produced while decoding a single mapping record.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },

    #[error("truncated record: {needed} more byte(s) expected")]
    TruncatedRecord { needed: usize },

    #[error("IO error while reading record: {0}")]
    Io(#[from] std::io::Error),
}

impl FormatError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        FormatError::MalformedRecord {
            reason: reason.into(),
        }
    }
}

/// Errors produced when growing an output chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppendError {
    #[error("an input may have at most {max} outputs")]
    MaxOutputsExceeded { max: usize },
}

/// Errors produced while loading a mapping file.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("mapping file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("mapping file is empty (no mappings defined): {}", path.display())]
    FileEmpty { path: PathBuf },

    #[error("bad mapping record at byte offset {offset}: {source}")]
    Malformed {
        offset: usize,
        #[source]
        source: FormatError,
    },

    #[error("failed to read mapping file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced when editing a mapping table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("duplicate mapping: identical to record #{index}")]
    DuplicatePair { index: usize },
}

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to parse KDL")]
    #[diagnostic(code(keycap::config::parse_error))]
    ParseError {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source]
        source: kdl::KdlError,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(keycap::config::invalid))]
    Invalid { message: String },

    #[error("Invalid mapping: {message}")]
    #[diagnostic(code(keycap::config::invalid_mapping))]
    InvalidMapping {
        message: String,
        #[source_code]
        src: String,
        #[label("{message}")]
        span: miette::SourceSpan,
    },

    #[error("Unknown key: {key}")]
    #[diagnostic(
        code(keycap::config::unknown_key),
        help("use a key name such as \"A\", \"F5\", \"PageUp\" or a hex virtual-key code such as \"0x41\"")
    )]
    UnknownKey {
        key: String,
        #[source_code]
        src: String,
        #[label("unknown key")]
        span: miette::SourceSpan,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
