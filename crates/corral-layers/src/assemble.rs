use crate::LayerError;
use flate2::read::GzDecoder;
use std::collections::{HashSet, VecDeque};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// File name prefix marking a deletion of the sibling named by the suffix.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker hiding everything lower layers put in its directory.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    Gzip,
    /// Sniff the gzip magic bytes at the head of the stream.
    #[default]
    Auto,
}

/// One image layer: an ordinal and the archive stream it contributes.
///
/// Layers are consumed by [`assemble`]; nothing keeps them afterwards.
pub struct Layer {
    ordinal: u32,
    compression: Compression,
    reader: Box<dyn Read + Send>,
}

impl Layer {
    pub fn new(ordinal: u32, reader: impl Read + Send + 'static) -> Self {
        Self {
            ordinal,
            compression: Compression::Auto,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(ordinal: u32, data: Vec<u8>) -> Self {
        Self::new(ordinal, io::Cursor::new(data))
    }

    pub fn open(ordinal: u32, path: &Path) -> Result<Self, LayerError> {
        let file = File::open(path)?;
        Ok(Self::new(ordinal, file))
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    fn into_decoded(self) -> io::Result<Box<dyn Read + Send>> {
        let mut reader = BufReader::new(self.reader);
        let gzip = match self.compression {
            Compression::None => false,
            Compression::Gzip => true,
            Compression::Auto => reader.fill_buf()?.starts_with(&GZIP_MAGIC),
        };
        if gzip {
            Ok(Box::new(GzDecoder::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("ordinal", &self.ordinal)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

/// Counters describing what an assembly run materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    pub layers: usize,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub hard_links: usize,
    /// Hard links that had to be materialized as byte copies.
    pub copied_links: usize,
    pub whiteouts: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkOutcome {
    Linked,
    Copied,
}

/// Merge `layers` into `destination`, lowest ordinal first.
///
/// Precondition: `destination` is empty or was populated by replaying the
/// exact same layer sequence. Assembling a different layer set on top of an
/// existing tree is not an incremental update and gives undefined results;
/// callers clear the directory first.
pub fn assemble(
    layers: impl IntoIterator<Item = Layer>,
    destination: &Path,
) -> Result<AssemblyReport, LayerError> {
    let mut layers: Vec<Layer> = layers.into_iter().collect();
    layers.sort_by_key(Layer::ordinal);
    for pair in layers.windows(2) {
        if pair[0].ordinal == pair[1].ordinal {
            return Err(LayerError::DuplicateOrdinal(pair[0].ordinal));
        }
    }

    fs::create_dir_all(destination)?;
    let mut report = AssemblyReport::default();
    for layer in layers {
        apply_layer(layer, destination, &mut report)?;
        report.layers += 1;
    }

    info!(
        "assembled {} layers into {}: {} files, {} dirs, {} whiteouts, {} skipped",
        report.layers,
        destination.display(),
        report.files,
        report.directories,
        report.whiteouts,
        report.skipped
    );
    Ok(report)
}

fn apply_layer(layer: Layer, root: &Path, report: &mut AssemblyReport) -> Result<(), LayerError> {
    let ordinal = layer.ordinal;
    debug!("applying layer {ordinal}");

    let mut archive = tar::Archive::new(layer.into_decoded()?);
    // Paths written by this layer and their parents; an opaque marker only
    // hides what lower layers left behind.
    let mut written: HashSet<PathBuf> = HashSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let unsafe_path = || LayerError::UnsafePath {
            ordinal,
            path: raw_path.display().to_string(),
        };
        let Some(rel) = normalize_entry_path(&raw_path).ok_or_else(unsafe_path)? else {
            continue;
        };
        let parent = rel.parent().unwrap_or_else(|| Path::new(""));
        let name = rel.file_name().unwrap_or_default().to_string_lossy();

        if name == WHITEOUT_OPAQUE {
            let dir = resolve_in_root(root, parent)?;
            debug!("opaque whiteout for {}", dir.display());
            clear_directory(&dir, root, &written)?;
            report.whiteouts += 1;
            continue;
        }
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            if target.is_empty() || target == "." || target == ".." {
                return Err(unsafe_path());
            }
            let victim = resolve_in_root(root, &parent.join(target))?;
            debug!("whiteout removes {}", victim.display());
            remove_path(&victim)?;
            report.whiteouts += 1;
            continue;
        }

        let dest = resolve_in_root(root, &rel)?;
        let entry_type = entry.header().entry_type();
        match entry_type {
            tar::EntryType::Directory => {
                let mode = entry.header().mode().unwrap_or(0o755);
                merge_directory(&dest, mode)?;
                report.directories += 1;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mode = entry.header().mode().unwrap_or(0o644);
                write_file(&mut entry, &dest, mode)?;
                report.files += 1;
            }
            tar::EntryType::Symlink => {
                let Some(target) = entry.link_name()? else {
                    warn!("layer {ordinal}: symlink {} has no target, skipping", rel.display());
                    report.skipped += 1;
                    continue;
                };
                replace_with_symlink(&target, &dest)?;
                report.symlinks += 1;
            }
            tar::EntryType::Link => {
                let target_rel = entry
                    .link_name()?
                    .and_then(|t| normalize_entry_path(&t))
                    .flatten()
                    .ok_or_else(unsafe_path)?;
                let target = resolve_in_root(root, &target_rel)?;
                if target == dest {
                    warn!("layer {ordinal}: hard link {} points at itself, skipping", rel.display());
                    report.skipped += 1;
                    continue;
                }
                remove_path(&dest)?;
                ensure_parent(&dest)?;
                match link_or_copy(&target, &dest, |src, dst| fs::hard_link(src, dst))? {
                    LinkOutcome::Linked => report.hard_links += 1,
                    LinkOutcome::Copied => report.copied_links += 1,
                }
            }
            tar::EntryType::XGlobalHeader => continue,
            other => {
                warn!(
                    "layer {ordinal}: skipping unsupported entry {} ({other:?})",
                    rel.display()
                );
                report.skipped += 1;
                continue;
            }
        }
        record_written(&mut written, &rel);
    }
    Ok(())
}

/// Record `rel` and every directory above it as produced by this layer.
fn record_written(written: &mut HashSet<PathBuf>, rel: &Path) {
    for path in rel.ancestors() {
        if path.as_os_str().is_empty() || !written.insert(path.to_path_buf()) {
            break;
        }
    }
}

/// Strip leading `/` and `./`; `None` inside means the archive root itself.
/// Returns `None` (outer) for paths that climb out with `..`.
fn normalize_entry_path(path: &Path) -> Option<Option<PathBuf>> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        Some(None)
    } else {
        Some(Some(out))
    }
}

/// Join `rel` onto `root`, resolving symlinks in every component but the
/// last as if `root` were `/`. Links pointing outside are clamped to `root`.
fn resolve_in_root(root: &Path, rel: &Path) -> io::Result<PathBuf> {
    let Some(file_name) = rel.file_name() else {
        return Ok(root.to_path_buf());
    };
    let mut pending: VecDeque<OsString> = rel
        .parent()
        .map(|p| p.iter().map(OsStr::to_os_string).collect())
        .unwrap_or_default();
    let mut current = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            current.pop();
            continue;
        }
        if part == "." || part == "/" {
            continue;
        }
        let candidate = current.join(&part);
        let on_disk = root.join(&candidate);
        match fs::symlink_metadata(&on_disk) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(io::Error::other(format!(
                        "too many levels of symbolic links resolving {}",
                        rel.display()
                    )));
                }
                let target = fs::read_link(&on_disk)?;
                if target.is_absolute() {
                    current = PathBuf::new();
                }
                let mut expanded: VecDeque<OsString> = target
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(p) => Some(p.to_os_string()),
                        Component::ParentDir => Some(OsString::from("..")),
                        _ => None,
                    })
                    .collect();
                expanded.extend(pending.drain(..));
                pending = expanded;
            }
            _ => current = candidate,
        }
    }
    Ok(root.join(current).join(file_name))
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Remove whatever lives at `path`. A missing path is not an error.
fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear_directory(dir: &Path, root: &Path, keep: &HashSet<PathBuf>) -> io::Result<()> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    for child in fs::read_dir(dir)? {
        let path = child?.path();
        let rel = path.strip_prefix(root).unwrap_or(&path);
        if keep.contains(rel) {
            if fs::symlink_metadata(&path)?.is_dir() {
                clear_directory(&path, root, keep)?;
            }
            continue;
        }
        remove_path(&path)?;
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

fn merge_directory(dest: &Path, mode: u32) -> io::Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            fs::remove_file(dest)?;
            fs::create_dir_all(dest)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(dest)?,
        Err(e) => return Err(e),
    }
    set_mode(dest, mode)
}

fn write_file(content: &mut impl Read, dest: &Path, mode: u32) -> io::Result<()> {
    // Unlink first: never write through a symlink or into a hard-linked sibling.
    remove_path(dest)?;
    ensure_parent(dest)?;
    let mut file = File::create(dest)?;
    io::copy(content, &mut file)?;
    set_mode(dest, mode)
}

fn replace_with_symlink(target: &Path, dest: &Path) -> io::Result<()> {
    remove_path(dest)?;
    ensure_parent(dest)?;
    std::os::unix::fs::symlink(target, dest)
}

fn link_or_copy<F>(target: &Path, dest: &Path, link: F) -> io::Result<LinkOutcome>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    match link(target, dest) {
        Ok(()) => Ok(LinkOutcome::Linked),
        Err(e) => {
            debug!(
                "hard link {} -> {} failed ({e}), copying",
                dest.display(),
                target.display()
            );
            fs::copy(target, dest)?;
            Ok(LinkOutcome::Copied)
        }
    }
}
