//! Root filesystem assembly for corral containers.
//!
//! This crate turns an ordered stack of image layer archives (plain or
//! gzip-compressed tar) into a single root filesystem directory by physical
//! copy-merge: later layers overwrite earlier ones, and `.wh.` whiteout
//! entries delete paths contributed by lower layers. It also defines the
//! `LayerSource` interface through which the runtime obtains layers for an
//! image reference, with a directory-backed implementation.

pub mod assemble;
pub mod source;

pub use assemble::{assemble, AssemblyReport, Compression, Layer, WHITEOUT_OPAQUE, WHITEOUT_PREFIX};
pub use source::{DirectorySource, ImageLayers, ImageManifest, ImageRef, LayerSource};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("layer I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("layer {ordinal}: entry path escapes the root filesystem: {path}")]
    UnsafePath { ordinal: u32, path: String },
    #[error("duplicate layer ordinal {0}")]
    DuplicateOrdinal(u32),
    #[error("invalid image reference: {0}")]
    InvalidImageRef(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("invalid image manifest: {0}")]
    Manifest(String),
}
