//! Launch options, domain/BDNS derivation and the on-disk config layout

pub mod domains;
mod environment;
mod options;
mod substitution;
pub mod writer;

pub use domains::{BdnsEntry, BdnsMap};
pub use environment::*;
pub use options::*;
pub use substitution::*;
pub use writer::ConfigError;
