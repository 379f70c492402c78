use crate::{Layer, LayerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const DEFAULT_TAG: &str = "latest";
pub const MANIFEST_FILE: &str = "manifest.json";

/// `name[:tag]` reference to a locally stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, LayerError> {
        let reference = reference.trim();
        let invalid = || LayerError::InvalidImageRef(reference.to_owned());

        let (name, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (reference, DEFAULT_TAG),
        };
        if name.is_empty() || tag.is_empty() || name.starts_with('/') {
            return Err(invalid());
        }
        let plain = |s: &str| Path::new(s).components().all(|c| matches!(c, Component::Normal(_)));
        if !plain(name) || !plain(tag) || tag.contains('/') {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_owned(),
            tag: tag.to_owned(),
        })
    }

    fn relative_dir(&self) -> PathBuf {
        Path::new(&self.name).join(&self.tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// On-disk description of an image: layer archives bottom-up plus an
/// optional opaque config blob, all relative to the manifest's directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    pub layers: Vec<String>,
}

pub struct ImageLayers {
    pub layers: Vec<Layer>,
    /// Raw config blob. Empty when the image carries none.
    pub config: Vec<u8>,
}

impl fmt::Debug for ImageLayers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLayers")
            .field("layers", &self.layers)
            .field("config_len", &self.config.len())
            .finish()
    }
}

/// Where layer streams for an image come from.
pub trait LayerSource: Send + Sync {
    fn fetch_layers(&self, image: &ImageRef) -> Result<ImageLayers, LayerError>;
}

/// Images laid out as `<root>/<name>/<tag>/manifest.json` with the layer
/// archives next to the manifest.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self, image: &ImageRef) -> Result<ImageManifest, LayerError> {
        let path = self.root.join(image.relative_dir()).join(MANIFEST_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LayerError::ImageNotFound(image.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| LayerError::Manifest(format!("{}: {e}", path.display())))
    }
}

fn blob_name(name: &str) -> Result<&str, LayerError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(LayerError::Manifest(format!(
            "blob reference must be a plain file name: {name:?}"
        ))),
    }
}

impl LayerSource for DirectorySource {
    fn fetch_layers(&self, image: &ImageRef) -> Result<ImageLayers, LayerError> {
        let manifest = self.manifest(image)?;
        let dir = self.root.join(image.relative_dir());

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for (ordinal, name) in manifest.layers.iter().enumerate() {
            let path = dir.join(blob_name(name)?);
            layers.push(Layer::open(ordinal as u32, &path)?);
        }
        let config = match &manifest.config {
            Some(name) => fs::read(dir.join(blob_name(name)?))?,
            None => Vec::new(),
        };

        debug!("image {image}: {} layers", layers.len());
        Ok(ImageLayers { layers, config })
    }
}
