use core::fmt::Display;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use burn::config::Config;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::{Fetch, HttpFetcher, WeightSource};
use crate::WeightError;

const CHECKSUM_EXTENSION: &str = "sha256";

/// Configuration to create a [weight cache](WeightCache) using the [init function](WeightCacheConfig::init).
#[derive(Config, Debug)]
pub struct WeightCacheConfig {
    /// Directory where downloaded blobs are stored.
    ///
    /// Defaults to `<user cache dir>/burn-fidelity/weights`.
    pub root: Option<PathBuf>,

    /// Report download progress on stderr.
    #[config(default = true)]
    pub verbose: bool,
}

impl WeightCacheConfig {
    /// Initialize a new [weight cache](WeightCache) downloading over HTTP.
    pub fn init(&self) -> Result<WeightCache, WeightError> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => default_root()?,
        };

        Ok(WeightCache::with_fetcher(root, HttpFetcher::new(self.verbose)))
    }
}

fn default_root() -> Result<PathBuf, WeightError> {
    let cache_dir = dirs::cache_dir().ok_or(WeightError::NoCacheDir)?;

    Ok(cache_dir.join("burn-fidelity").join("weights"))
}

/// On-disk cache of pretrained weight blobs.
///
/// Blobs are keyed by the file name of their source URL. Every downloaded blob is stored with
/// a `.sha256` sidecar which is checked on each cache hit; torch hub style hash prefixes in the
/// file name are checked as well.
pub struct WeightCache {
    root: PathBuf,
    fetcher: Box<dyn Fetch>,
}

impl core::fmt::Debug for WeightCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WeightCache")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl WeightCache {
    /// Create a cache rooted at `root` that retrieves missing blobs with `fetcher`.
    pub fn with_fetcher<F: Fetch + 'static>(root: impl Into<PathBuf>, fetcher: F) -> Self {
        Self {
            root: root.into(),
            fetcher: Box::new(fetcher),
        }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of the blob, downloading it first when it is not cached yet.
    ///
    /// Downloads are streamed into a temporary file in the cache root and renamed into place
    /// once verified, so concurrent first use from several processes never exposes a partial
    /// file.
    pub fn fetch(&self, source: &WeightSource) -> Result<PathBuf, WeightError> {
        let path = self.root.join(source.file_name());

        if path.exists() {
            self.verify(source, &path)?;
            log::info!("Using cached {} weights: {}", source.name, path.display());
            return Ok(path);
        }

        fs::create_dir_all(&self.root)?;

        log::info!("Downloading {} weights from {}", source.name, source.url);
        let mut file = NamedTempFile::new_in(&self.root)?;
        let mut writer = HashingWriter::new(&mut file);
        self.fetcher.fetch(source.url, source.file_name(), &mut writer)?;
        let digest = writer.finish();

        if let Some(prefix) = source.hash_prefix() {
            if !digest.starts_with(prefix) {
                return Err(WeightError::Corrupt {
                    path,
                    reason: format!("downloaded content has hash {digest}, expected prefix {prefix}"),
                });
            }
        }

        file.as_file().sync_all()?;
        let checksum = Checksum::new(digest, &file.as_file().metadata()?);

        // The sidecar lands first so that a visible blob always has its checksum.
        self.write_atomic(&checksum_path(&path), checksum.to_string().as_bytes())?;
        file.persist(&path).map_err(|err| err.error)?;
        log::info!("Saved {} weights to {}", source.name, path.display());

        Ok(path)
    }

    /// Check a cached blob.
    ///
    /// A blob whose size and modification time match its sidecar is trusted as is. Otherwise
    /// the content is hashed and compared with the sidecar and the hash prefix, and the sidecar
    /// is refreshed.
    fn verify(&self, source: &WeightSource, path: &Path) -> Result<(), WeightError> {
        let metadata = fs::metadata(path)?;
        let sidecar = checksum_path(path);
        let recorded = match sidecar.exists() {
            true => Checksum::parse(&fs::read_to_string(&sidecar)?),
            false => None,
        };

        if recorded
            .as_ref()
            .is_some_and(|recorded| recorded.matches(&metadata))
        {
            return Ok(());
        }

        if recorded.is_none() && source.hash_prefix().is_none() {
            log::warn!(
                "No checksum recorded for {}, its integrity cannot be verified",
                path.display()
            );
            return Ok(());
        }

        let digest = file_digest(path)?;

        if let Some(prefix) = source.hash_prefix() {
            if !digest.starts_with(prefix) {
                return Err(WeightError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("cached content has hash {digest}, expected prefix {prefix}"),
                });
            }
        }

        if let Some(recorded) = recorded {
            if recorded.digest != digest {
                return Err(WeightError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("cached content has hash {digest}, recorded {}", recorded.digest),
                });
            }
        }

        log::debug!("Refreshing checksum of {}", path.display());
        let checksum = Checksum::new(digest, &metadata);
        self.write_atomic(&sidecar, checksum.to_string().as_bytes())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), WeightError> {
        let mut file = NamedTempFile::new_in(&self.root)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|err| err.error)?;

        Ok(())
    }
}

/// Content of a `.sha256` sidecar: `<hex digest> <size> <mtime nanos>`.
///
/// Size and modification time are optional, a sidecar holding only the digest is still valid.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Checksum {
    digest: String,
    size: Option<u64>,
    modified: Option<u128>,
}

impl Checksum {
    fn new(digest: String, metadata: &fs::Metadata) -> Self {
        Self {
            digest,
            size: Some(metadata.len()),
            modified: modified_nanos(metadata),
        }
    }

    fn parse(content: &str) -> Option<Self> {
        let mut fields = content.split_whitespace();
        let digest = fields.next()?.to_string();

        Some(Self {
            digest,
            size: fields.next().and_then(|size| size.parse().ok()),
            modified: fields.next().and_then(|modified| modified.parse().ok()),
        })
    }

    /// Whether the file metadata is unchanged since the checksum was taken.
    fn matches(&self, metadata: &fs::Metadata) -> bool {
        match (self.size, self.modified) {
            (Some(size), Some(modified)) => {
                size == metadata.len() && Some(modified) == modified_nanos(metadata)
            }
            _ => false,
        }
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.digest)?;
        if let Some(size) = self.size {
            write!(f, " {size}")?;
            if let Some(modified) = self.modified {
                write!(f, " {modified}")?;
            }
        }
        Ok(())
    }
}

fn modified_nanos(metadata: &fs::Metadata) -> Option<u128> {
    let modified = metadata.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_nanos())
}

/// Forwards writes while computing their SHA-256 digest.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(CHECKSUM_EXTENSION);
    path.with_file_name(name)
}

fn file_digest(path: &Path) -> Result<String, WeightError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;

    Ok(format!("{:x}", hasher.finalize()))
}
