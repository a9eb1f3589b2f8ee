//! Archive expansion.
//!
//! ZIP and TAR payloads are expanded into synthetic member URLs of the form
//! `zip://<outer-path>!/<inner-path>` so each entry flows through the normal
//! page pipeline. Entries whose names escape the archive root (absolute
//! paths, `..` components) are rejected.

use async_trait::async_trait;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use url::Url;

use super::{detect_content_type, FetchOptions, Fetched, Fetcher, Probe};
use crate::error::FetchError;

/// Decompressed per-entry ceiling, independent of `document.maxSize`,
/// guarding against zip bombs.
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Tar | ArchiveKind::TarGz => "tar",
        }
    }
}

/// Recognise an archive by file name.
pub fn archive_kind(path: &str) -> Option<ArchiveKind> {
    let lowered = path.to_ascii_lowercase();
    if lowered.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if lowered.ends_with(".tar.gz") || lowered.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if lowered.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

/// Build the synthetic URL for one archive member.
pub fn member_url(kind: ArchiveKind, outer: &Path, inner: &str) -> Result<Url, FetchError> {
    let spec = format!(
        "{}://{}!/{}",
        kind.scheme(),
        outer.display(),
        inner.trim_start_matches('/')
    );
    Url::parse(&spec).map_err(|err| FetchError::InvalidUrl {
        url: spec,
        reason: err.to_string(),
    })
}

/// Split a synthetic archive URL back into (outer path, inner path).
pub fn split_member_url(url: &Url) -> Option<(PathBuf, String)> {
    let raw = url.as_str();
    let rest = raw
        .strip_prefix("zip://")
        .or_else(|| raw.strip_prefix("tar://"))?;
    let (outer, inner) = rest.split_once("!/")?;
    if outer.is_empty() || inner.is_empty() {
        return None;
    }
    Some((PathBuf::from(outer), inner.to_string()))
}

fn entry_name_is_safe(name: &str) -> bool {
    let path = Path::new(name);
    if path.is_absolute() {
        return false;
    }
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// One expanded archive member.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub inner_path: String,
    pub bytes: Vec<u8>,
}

/// Enumerate every regular-file entry of an in-memory archive, skipping
/// unsafe names.
pub fn expand(kind: ArchiveKind, bytes: &[u8], source: &str) -> Result<Vec<ArchiveEntry>, FetchError> {
    match kind {
        ArchiveKind::Zip => expand_zip(bytes, source),
        ArchiveKind::Tar => expand_tar(bytes, source),
        ArchiveKind::TarGz => {
            let mut decoder = flate2::read::GzDecoder::new(bytes);
            let mut inflated = Vec::new();
            decoder
                .read_to_end(&mut inflated)
                .map_err(|err| permanent(source, format!("gzip: {}", err)))?;
            expand_tar(&inflated, source)
        }
    }
}

fn expand_zip(bytes: &[u8], source: &str) -> Result<Vec<ArchiveEntry>, FetchError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| permanent(source, format!("zip: {}", err)))?;

    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|err| permanent(source, format!("zip entry {}: {}", i, err)))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if !entry_name_is_safe(&name) {
            tracing::warn!(archive = source, entry = %name, "skipping unsafe archive entry");
            continue;
        }
        let mut out = Vec::new();
        entry
            .take(MAX_ENTRY_BYTES)
            .read_to_end(&mut out)
            .map_err(|err| permanent(source, format!("zip entry {}: {}", name, err)))?;
        if out.len() as u64 >= MAX_ENTRY_BYTES {
            return Err(FetchError::TooLarge {
                url: format!("{}!/{}", source, name),
                size: out.len() as u64,
                limit: MAX_ENTRY_BYTES,
            });
        }
        entries.push(ArchiveEntry {
            inner_path: name,
            bytes: out,
        });
    }
    Ok(entries)
}

fn expand_tar(bytes: &[u8], source: &str) -> Result<Vec<ArchiveEntry>, FetchError> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut entries = Vec::new();

    let iter = archive
        .entries()
        .map_err(|err| permanent(source, format!("tar: {}", err)))?;
    for entry in iter {
        let mut entry = entry.map_err(|err| permanent(source, format!("tar entry: {}", err)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|err| permanent(source, format!("tar path: {}", err)))?
            .to_string_lossy()
            .to_string();
        if !entry_name_is_safe(&name) {
            tracing::warn!(archive = source, entry = %name, "skipping unsafe archive entry");
            continue;
        }
        let mut out = Vec::new();
        entry
            .by_ref()
            .take(MAX_ENTRY_BYTES)
            .read_to_end(&mut out)
            .map_err(|err| permanent(source, format!("tar entry {}: {}", name, err)))?;
        if out.len() as u64 >= MAX_ENTRY_BYTES {
            return Err(FetchError::TooLarge {
                url: format!("{}!/{}", source, name),
                size: out.len() as u64,
                limit: MAX_ENTRY_BYTES,
            });
        }
        entries.push(ArchiveEntry {
            inner_path: name,
            bytes: out,
        });
    }
    Ok(entries)
}

fn permanent(url: &str, reason: String) -> FetchError {
    FetchError::Permanent {
        url: url.to_string(),
        reason,
    }
}

/// Fetcher for `zip://…!/…` and `tar://…!/…` member URLs. Reads the outer
/// archive from disk and extracts the requested member.
pub struct ArchiveFetcher {
    max_document_size: u64,
}

impl ArchiveFetcher {
    pub fn new(max_document_size: u64) -> Self {
        Self { max_document_size }
    }

    async fn load_member(&self, url: &Url) -> Result<Fetched, FetchError> {
        let (outer, inner) = split_member_url(url).ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "expected <scheme>://<outer>!/<inner>".to_string(),
        })?;
        let kind = archive_kind(&outer.to_string_lossy()).ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "outer path is not a recognised archive".to_string(),
        })?;

        let bytes = tokio::fs::read(&outer)
            .await
            .map_err(|_| FetchError::NotFound {
                url: url.to_string(),
            })?;

        let entries = expand(kind, &bytes, &outer.to_string_lossy())?;
        let entry = entries
            .into_iter()
            .find(|e| e.inner_path == inner)
            .ok_or_else(|| FetchError::NotFound {
                url: url.to_string(),
            })?;

        if entry.bytes.len() as u64 > self.max_document_size {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                size: entry.bytes.len() as u64,
                limit: self.max_document_size,
            });
        }

        let content_type = detect_content_type(&entry.inner_path, &entry.bytes);
        Ok(Fetched {
            bytes: entry.bytes,
            content_type,
            etag: None,
            last_modified: None,
            final_url: url.clone(),
            status: 200,
        })
    }
}

#[async_trait]
impl Fetcher for ArchiveFetcher {
    fn can_fetch(&self, url: &Url) -> bool {
        matches!(url.scheme(), "zip" | "tar")
    }

    async fn fetch(&self, url: &Url, opts: &FetchOptions) -> Result<Fetched, FetchError> {
        if opts.cancel.is_cancelled() {
            return Err(FetchError::Cancelled {
                url: url.to_string(),
            });
        }
        self.load_member(url).await
    }

    async fn probe(&self, url: &Url, _opts: &FetchOptions) -> Result<Probe, FetchError> {
        let fetched = self.load_member(url).await?;
        Ok(Probe {
            status: fetched.status,
            etag: None,
            last_modified: None,
        })
    }
}
