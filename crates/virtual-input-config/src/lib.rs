//! Configuration documents for virtual-input
//!
//! This crate parses the daemon configuration, key-table documents and
//! per-session post-lookup documents (all KDL), and writes key tables back.

mod error;
mod model;
mod parser;
mod generator;

pub use error::ConfigError;
pub use model::*;
pub use parser::{
    parse_config, parse_config_str, parse_key_table, parse_key_table_str, parse_post_lookup,
    parse_post_lookup_str,
};
pub use generator::{generate_key_table, write_key_table};
