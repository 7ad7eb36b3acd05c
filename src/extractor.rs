//! Carving of Windows PE images out of decrypted ViewState payloads.
//!
//! The extractor only looks for the DOS stub signature; it never parses the
//! PE headers. Everything from the signature to the end of the blob is
//! treated as the executable.

use log::{debug, info, warn};
use md5::{Digest, Md5};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::models::ExtractionResult;

/// `MZ` followed by the 0x90 byte emitted by the standard DOS stub.
pub const PE_SIGNATURE: [u8; 3] = [0x4d, 0x5a, 0x90];

/// Returns the offset of the first PE signature and the carved suffix.
pub fn locate_executable(blob: &[u8]) -> Option<(usize, &[u8])> {
    memchr::memmem::find(blob, &PE_SIGNATURE).map(|offset| (offset, &blob[offset..]))
}

/// Lowercase hex MD5 digest, used as the artifact name.
pub fn fingerprint(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// Directory where carved executables are preserved as evidence.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ArtifactStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(fingerprint)
    }

    /// Writes `data` under `digest`, its fingerprint. An existing file is kept
    /// only if its content hashes to the same digest; anything else (a
    /// truncated earlier write, a foreign file) is replaced.
    pub fn persist(&self, digest: &str, data: &[u8]) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(digest);
        match fs::read(&path) {
            Ok(existing) if fingerprint(&existing) == digest => {
                debug!("Artifact {} already present", path.display());
                return Ok(path);
            }
            Ok(existing) => {
                warn!(
                    "Artifact {} does not match its name ({} bytes on disk, {} expected), rewriting",
                    path.display(),
                    existing.len(),
                    data.len()
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        // Written aside and renamed so the final name never holds a partial image.
        let tmp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            digest,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let written = write_new(&tmp, data).and_then(|_| fs::rename(&tmp, &path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        debug!("Wrote {} byte artifact to {}", data.len(), path.display());
        Ok(path)
    }
}

static TMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn write_new(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

pub struct Extractor {
    store: Option<ArtifactStore>,
}

impl Extractor {
    pub fn new(store: Option<ArtifactStore>) -> Self {
        Extractor { store }
    }

    /// Extractor that fingerprints but never touches the filesystem.
    pub fn detached() -> Self {
        Extractor { store: None }
    }

    pub fn extract(&self, blob: &[u8]) -> ExtractionResult {
        let (offset, image) = match locate_executable(blob) {
            Some(hit) => hit,
            None => return ExtractionResult::not_found(),
        };

        let digest = fingerprint(image);
        info!("Embedded executable at offset {} ({} bytes, md5 {})", offset, image.len(), digest);

        let fingerprint = match &self.store {
            Some(store) => match store.persist(&digest, image) {
                Ok(_) => Some(digest),
                Err(e) => {
                    warn!("Failed to write artifact {} to {}: {}", digest, store.dir().display(), e);
                    None
                }
            },
            None => Some(digest),
        };

        ExtractionResult {
            found: true,
            fingerprint,
            offset: Some(offset),
            size: Some(image.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_locate_first_signature() {
        let blob = b"xxMZ\x90aaMZ\x90bb";
        let (offset, image) = locate_executable(blob).unwrap();
        assert_eq!(offset, 2);
        assert_eq!(image, b"MZ\x90aaMZ\x90bb");
    }

    #[test]
    fn test_plain_mz_is_not_a_signature() {
        assert!(locate_executable(b"MZ\x00MZ\x91").is_none());
        assert!(locate_executable(b"").is_none());
        assert!(locate_executable(b"MZ").is_none());
    }

    #[test]
    fn test_fingerprint_known_digest() {
        assert_eq!(fingerprint(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(fingerprint(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_persist_twice_keeps_content() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let data = b"MZ\x90payload";
        let digest = fingerprint(data);

        let first = store.persist(&digest, data).unwrap();
        let second = store.persist(&digest, data).unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(&first).unwrap(), data);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_truncated_artifact_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let data = b"MZ\x90 a complete image";
        let digest = fingerprint(data);
        fs::write(store.path_for(&digest), &data[..5]).unwrap();

        let path = store.persist(&digest, data).unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_failure_drops_fingerprint_only() {
        let dir = TempDir::new().unwrap();
        // A regular file where the artifact directory should be.
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"not a dir").unwrap();
        let extractor = Extractor::new(Some(ArtifactStore::new(&blocker)));

        let result = extractor.extract(b"..MZ\x90..");
        assert!(result.found);
        assert_eq!(result.fingerprint, None);
        assert_eq!(result.offset, Some(2));
    }
}
