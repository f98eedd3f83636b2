//! Writing experiment output to disk.

#[cfg(feature = "csv")]
pub mod csv;
