//! Locating pretrained weight files in a hub repository or a local
//! diffusers-layout directory.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use hf_hub::api::tokio::{Api, ApiRepo};
use hf_hub::Repo;
use log::{debug, info};

pub enum ModelSource {
    Hub { id: String, repo: ApiRepo },
    Dir(PathBuf),
}

impl ModelSource {
    /// Existing directories are read in place, anything else names a hub
    /// repository.
    pub fn new(api: &Api, identifier: &str) -> Self {
        let dir = PathBuf::from(identifier);
        if dir.is_dir() {
            return Self::Dir(dir);
        }
        Self::Hub {
            id: identifier.to_string(),
            repo: api.repo(Repo::model(identifier.to_string())),
        }
    }

    fn name(&self) -> String {
        match self {
            Self::Hub { id, .. } => id.clone(),
            Self::Dir(dir) => dir.display().to_string(),
        }
    }

    /// First of `candidates` that exists in the source.
    pub async fn get(&self, candidates: &[&str]) -> Result<PathBuf> {
        for candidate in candidates {
            match self {
                Self::Dir(dir) => {
                    let path = dir.join(candidate);
                    if path.is_file() {
                        return Ok(path);
                    }
                }
                Self::Hub { repo, .. } => match repo.get(candidate).await {
                    Ok(path) => {
                        info!("fetched {candidate} from {}", self.name());
                        return Ok(path);
                    }
                    Err(e) => debug!("{candidate} unavailable from {}: {e}", self.name()),
                },
            }
        }
        bail!("none of {candidates:?} found in {}", self.name())
    }
}

/// Candidate file names, the half-precision variant first when `fp16` is set.
pub fn variants(stem: &str, ext: &str, fp16: bool) -> Vec<String> {
    let full = format!("{stem}.{ext}");
    if fp16 {
        vec![format!("{stem}.fp16.{ext}"), full]
    } else {
        vec![full]
    }
}

pub async fn get_variant(source: &ModelSource, stem: &str, fp16: bool) -> Result<PathBuf> {
    let names = variants(stem, "safetensors", fp16);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    source
        .get(&names)
        .await
        .with_context(|| format!("failed to locate {stem}"))
}
