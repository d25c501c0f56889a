//! Mapping records, mapping tables and settings for keycap
//!
//! This crate owns the binary `.kfg` mapping format, the in-memory mapping
//! table used by the capture engine, and the KDL files keycap reads: the
//! settings file and mapping source that compiles to `.kfg`.

mod error;
mod generator;
mod model;
mod parser;
mod table;
pub mod vk;

pub use error::{AppendError, ConfigError, FormatError, LoadError, TableError};
pub use generator::{render_keymap_source, validate_rendered, write_keymap_source};
pub use model::*;
pub use parser::{
    default_settings_path, load_settings, parse_keymap_source, parse_keymap_str,
    parse_settings_str,
};
pub use table::{MappingTable, Signature};
