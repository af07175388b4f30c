//! Large-file offload: oversized or matching-extension content is
//! diverted to a content-addressed local store and replaced in the
//! imported tree by a small pointer file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::util::{ensure_dir, hash_bytes, human_size};

pub const POINTER_VERSION: &str = "https://depotsync.dev/spec/v1";

/// Offload policy. All triggers are optional; with none configured the
/// store is inert and every file streams inline.
#[derive(Debug, Clone, Default)]
pub struct LargeFilePolicy {
    /// Offload when raw size strictly exceeds this.
    pub threshold: Option<u64>,
    /// Offload when the zstd-compressed size strictly exceeds this.
    /// Catches incompressible blobs that sit just under the raw limit.
    pub compressed_threshold: Option<u64>,
    /// Always-offload file extensions, without the leading dot.
    pub extensions: BTreeSet<String>,
}

impl LargeFilePolicy {
    pub fn is_active(&self) -> bool {
        self.threshold.is_some()
            || self.compressed_threshold.is_some()
            || !self.extensions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub oid: String,
    pub size: u64,
}

impl Pointer {
    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "version {}\noid blake3:{}\nsize {}\n",
            POINTER_VERSION, self.oid, self.size
        )
        .into_bytes()
    }

    /// Parse pointer-file content written by [`Pointer::to_bytes`].
    pub fn parse(content: &[u8]) -> Option<Pointer> {
        let text = std::str::from_utf8(content).ok()?;
        let mut lines = text.lines();
        let version = lines.next()?.strip_prefix("version ")?;
        if version != POINTER_VERSION {
            return None;
        }
        let oid = lines.next()?.strip_prefix("oid blake3:")?.to_string();
        let size = lines.next()?.strip_prefix("size ")?.parse().ok()?;
        Some(Pointer { oid, size })
    }
}

/// Content-addressed store plus the set of paths currently offloaded.
/// The tracked set feeds the attributes manifest, regenerated and
/// re-emitted whenever the set changes within an import.
#[derive(Debug)]
pub struct LargeFileStore {
    policy: LargeFilePolicy,
    store_dir: PathBuf,
    tracked: BTreeSet<String>,
    dirty: bool,
}

impl LargeFileStore {
    pub fn new(policy: LargeFilePolicy, store_dir: PathBuf) -> Self {
        LargeFileStore {
            policy,
            store_dir,
            tracked: BTreeSet::new(),
            dirty: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.policy.is_active()
    }

    fn has_large_extension(&self, repo_path: &str) -> bool {
        match repo_path.rsplit_once('.') {
            Some((_, ext)) => self.policy.extensions.contains(ext),
            None => false,
        }
    }

    /// Whether this file's content should be offloaded. Symlink targets
    /// never reach here; the stream writer handles mode 120000 first.
    /// Trigger order: extension, raw size, compressed size. Both size
    /// comparisons are strictly greater-than, so a file exactly at the
    /// limit stays inline.
    pub fn should_offload(&self, repo_path: &str, contents: &[u8]) -> Result<bool> {
        if self.has_large_extension(repo_path) {
            return Ok(true);
        }
        if let Some(limit) = self.policy.threshold {
            if contents.len() as u64 > limit {
                return Ok(true);
            }
        }
        if let Some(limit) = self.policy.compressed_threshold {
            let compressed =
                zstd::encode_all(contents, 0).context("compression probe failed")?;
            if compressed.len() as u64 > limit {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn object_path(&self, oid: &str) -> PathBuf {
        self.store_dir
            .join("objects")
            .join(&oid[..2])
            .join(&oid[2..4])
            .join(oid)
    }

    /// Store the content and return the pointer that replaces it in the
    /// tree. Idempotent per oid.
    pub fn ingest(&mut self, repo_path: &str, contents: &[u8]) -> Result<Pointer> {
        let oid = hash_bytes(contents);
        let target = self.object_path(&oid);
        if !target.exists() {
            let parent = target.parent().context("object path has no parent")?;
            ensure_dir(parent)?;
            let tmp = target.with_extension("tmp");
            std::fs::write(&tmp, contents)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            std::fs::rename(&tmp, &target)
                .with_context(|| format!("failed to move object into {}", target.display()))?;
        }
        if self.tracked.insert(repo_path.to_string()) {
            self.dirty = true;
        }
        debug!(
            path = repo_path,
            oid = %oid,
            size = %human_size(contents.len() as u64),
            "offloaded large file"
        );
        Ok(Pointer {
            oid,
            size: contents.len() as u64,
        })
    }

    /// A path that stopped being large must be untracked so the manifest
    /// shrinks with it.
    pub fn untrack(&mut self, repo_path: &str) {
        if self.tracked.remove(repo_path) {
            self.dirty = true;
        }
    }

    pub fn fetch(&self, pointer: &Pointer) -> Result<Vec<u8>> {
        let path = self.object_path(&pointer.oid);
        std::fs::read(&path)
            .with_context(|| format!("large-file object missing: {}", path.display()))
    }

    /// Attributes manifest content if the tracked set changed since the
    /// last call, clearing the dirty flag.
    pub fn take_manifest(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        let mut lines: Vec<String> = self
            .policy
            .extensions
            .iter()
            .map(|ext| format!("*.{ext} filter=depotsync -text"))
            .collect();
        lines.extend(
            self.tracked
                .iter()
                .map(|path| format!("/{path} filter=depotsync -text")),
        );
        Some(format!("{}\n", lines.join("\n")))
    }

    pub fn manifest_path(&self) -> &'static str {
        ".gitattributes"
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(policy: LargeFilePolicy) -> (LargeFileStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LargeFileStore::new(policy, dir.path().to_path_buf());
        (store, dir)
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let (store, _dir) = store(LargeFilePolicy {
            threshold: Some(10),
            ..Default::default()
        });
        assert!(!store.should_offload("a.bin", &[0u8; 10]).unwrap());
        assert!(store.should_offload("a.bin", &[0u8; 11]).unwrap());
    }

    #[test]
    fn extension_always_offloads() {
        let (store, _dir) = store(LargeFilePolicy {
            extensions: ["iso".to_string()].into_iter().collect(),
            ..Default::default()
        });
        assert!(store.should_offload("media/disk.iso", b"tiny").unwrap());
        assert!(!store.should_offload("media/disk.txt", b"tiny").unwrap());
    }

    #[test]
    fn ingest_round_trips_and_tracks() {
        let (mut store, _dir) = store(LargeFilePolicy {
            threshold: Some(1),
            ..Default::default()
        });
        let pointer = store.ingest("big/data.bin", b"payload").unwrap();
        assert_eq!(pointer.size, 7);
        assert_eq!(store.fetch(&pointer).unwrap(), b"payload");

        let parsed = Pointer::parse(&pointer.to_bytes()).unwrap();
        assert_eq!(parsed, pointer);
    }

    #[test]
    fn manifest_regenerates_only_on_change() {
        let (mut store, _dir) = store(LargeFilePolicy {
            threshold: Some(1),
            ..Default::default()
        });
        assert!(store.take_manifest().is_none());
        store.ingest("big/a.bin", b"aa").unwrap();
        let manifest = store.take_manifest().unwrap();
        assert!(manifest.contains("/big/a.bin filter=depotsync -text"));
        assert!(store.take_manifest().is_none());

        store.untrack("big/a.bin");
        assert_eq!(store.take_manifest().unwrap(), "\n");
    }

    #[test]
    fn pointer_rejects_foreign_content() {
        assert!(Pointer::parse(b"version something-else\noid blake3:ab\nsize 1\n").is_none());
        assert!(Pointer::parse(b"plain file").is_none());
    }
}
