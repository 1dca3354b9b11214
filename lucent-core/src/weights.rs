//! Resolution of weights identifiers to local directories.
//!
//! An identifier is a local directory, an `http(s)://` URL of a tar archive
//! (optionally gzip-compressed), or a hub repository id `owner/name`. Each one
//! is resolved at most once per process; the result stays cached until it is
//! evicted explicitly or pushed out by the LRU capacity.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use hf_hub::api::tokio::Api;
use log::{info, warn};
use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::bundle::BUNDLE_FILES;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Local(PathBuf),
    Url(String),
    Hub(String),
}

impl Source {
    fn classify(identifier: &str) -> Result<Self> {
        if identifier.starts_with("http://") || identifier.starts_with("https://") {
            return Ok(Self::Url(identifier.to_string()));
        }
        let path = Path::new(identifier);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        if is_repo_id(identifier) {
            return Ok(Self::Hub(identifier.to_string()));
        }
        Err(Error::download(identifier, "not a directory, URL or repository id"))
    }
}

fn is_repo_id(identifier: &str) -> bool {
    let mut parts = identifier.split('/');
    let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let valid = |s: &str| {
        !s.is_empty()
            && !s.starts_with('.')
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    valid(owner) && valid(name)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    dir: PathBuf,
    /// Directories under the cache root are removed on eviction. Local
    /// directories and hub snapshots are left alone.
    owned: bool,
}

pub struct WeightsCache {
    root: PathBuf,
    entries: LruCache<String, CacheEntry>,
    client: reqwest::Client,
    api: Api,
}

impl WeightsCache {
    pub fn new(root: impl Into<PathBuf>, max_entries: NonZeroUsize, api: Api) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            entries: LruCache::new(max_entries),
            client: reqwest::Client::new(),
            api,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains(identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deterministic download location for a URL identifier.
    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.root
            .join(hex::encode(Sha256::digest(identifier.as_bytes())))
    }

    pub async fn ensure(&mut self, identifier: &str) -> Result<PathBuf> {
        if let Some(entry) = self.entries.get(identifier) {
            return Ok(entry.dir.clone());
        }

        let entry = match Source::classify(identifier)? {
            Source::Local(dir) => CacheEntry { dir, owned: false },
            Source::Url(url) => CacheEntry {
                dir: self.fetch_archive(&url).await?,
                owned: true,
            },
            Source::Hub(repo) => CacheEntry {
                dir: self.fetch_repo(&repo).await?,
                owned: false,
            },
        };
        let dir = entry.dir.clone();
        if let Some((evicted, old)) = self.entries.push(identifier.to_string(), entry) {
            if evicted != identifier {
                info!("evicting least recently used weights {evicted}");
                remove_owned(&old);
            }
        }
        Ok(dir)
    }

    /// Forgets `identifier`, deleting its download when the cache created it.
    pub fn evict(&mut self, identifier: &str) -> bool {
        match self.entries.pop(identifier) {
            Some(entry) => {
                remove_owned(&entry);
                true
            }
            None => false,
        }
    }

    async fn fetch_archive(&self, url: &str) -> Result<PathBuf> {
        let dest = self.path_for(url);
        if dest.is_dir() {
            info!("reusing extracted weights for {url} at {}", dest.display());
            return Ok(dest);
        }

        info!("downloading {url}");
        let start = std::time::Instant::now();
        let mut archive = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&self.root)?;
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::download(url, e))?;
        while let Some(chunk) = response.chunk().await.map_err(|e| Error::download(url, e))? {
            archive.write_all(&chunk)?;
        }
        archive.flush()?;
        info!("downloading {url} took {:.1}s", start.elapsed().as_secs_f32());

        let root = self.root.clone();
        let identifier = url.to_string();
        tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let staged = tempfile::Builder::new()
                .prefix(".extract-")
                .tempdir_in(&root)?;
            extract_archive(archive.as_file_mut(), staged.path())
                .map_err(|e| Error::download(&identifier, e))?;
            commit_dir(staged, &dest)?;
            Ok(dest)
        })
        .await
        .map_err(|e| Error::download(url, e))?
    }

    async fn fetch_repo(&self, repo_id: &str) -> Result<PathBuf> {
        info!("fetching bundle from hub repository {repo_id}");
        let repo = self.api.model(repo_id.to_string());
        let listing = repo.info().await.map_err(|e| Error::download(repo_id, e))?;
        let mut snapshot = None;
        for file in BUNDLE_FILES {
            if !listing.siblings.iter().any(|s| s.rfilename == file) {
                continue;
            }
            let path = repo.get(file).await.map_err(|e| Error::download(repo_id, e))?;
            snapshot = path.parent().map(Path::to_path_buf);
        }
        snapshot.ok_or_else(|| Error::download(repo_id, "repository carries no bundle files"))
    }
}

fn remove_owned(entry: &CacheEntry) {
    if !entry.owned {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(&entry.dir) {
        warn!("failed to remove {}: {e}", entry.dir.display());
    }
}

/// Unpacks a tar archive, gzip-compressed or not, into `dest`.
pub fn extract_archive(file: &mut File, dest: &Path) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 2];
    let gzipped = file.read(&mut magic)? == 2 && magic == [0x1f, 0x8b];
    file.seek(SeekFrom::Start(0))?;
    let reader = BufReader::new(file);
    if gzipped {
        tar::Archive::new(GzDecoder::new(reader)).unpack(dest)
    } else {
        tar::Archive::new(reader).unpack(dest)
    }
}

/// Moves a fully extracted directory into its final place. When another
/// process won the race the existing directory is kept.
fn commit_dir(staged: tempfile::TempDir, dest: &Path) -> Result<()> {
    let staged = staged.into_path();
    if let Err(e) = std::fs::rename(&staged, dest) {
        let _ = std::fs::remove_dir_all(&staged);
        if !dest.is_dir() {
            return Err(e.into());
        }
    }
    Ok(())
}
