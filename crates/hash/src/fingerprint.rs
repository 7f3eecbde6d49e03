//! Per-file content fingerprints.
//!
//! A fingerprint is the git blob object id of the file: SHA-1 over
//! `"blob " + <decimal length> + NUL + <contents>`. Using the same scheme as
//! git means an index that already knows a file's blob id can supply the
//! fingerprint without the file being read again.

use crate::{Error, Result};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Fingerprint an in-memory blob.
#[must_use]
pub fn git_blob_hash(contents: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", contents.len()).as_bytes());
    hasher.update(contents);
    hex::encode(hasher.finalize())
}

/// Fingerprint the file at `path`.
///
/// Symlinks are not followed: the fingerprint covers the link target string,
/// with `\` normalized to `/` so the same link hashes identically on every
/// platform.
pub fn hash_file(path: &Path) -> Result<String> {
    let _span = tracing::trace_span!("hash_file", path = %path.display()).entered();

    let metadata = fs::symlink_metadata(path).map_err(|e| Error::io(e, path, "stat"))?;
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(path).map_err(|e| Error::io(e, path, "readlink"))?;
        let target = target.to_string_lossy().replace('\\', "/");
        return Ok(git_blob_hash(target.as_bytes()));
    }

    let mut file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", metadata.len()).as_bytes());

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::io(e, path, "read"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    // The header already committed to the stat length.
    if total != metadata.len() {
        return Err(Error::io(
            std::io::Error::other(format!(
                "file changed while hashing (expected {} bytes, read {total})",
                metadata.len()
            )),
            path,
            "read",
        ));
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint a set of repo-relative files.
///
/// The returned map is keyed by the same repo-relative paths, so its
/// iteration order is already the canonical sorted order.
pub fn hash_files<I, S>(repo_root: &Path, files: I) -> Result<BTreeMap<String, String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hashes = BTreeMap::new();
    for rel in files {
        let rel = rel.as_ref();
        let hash = hash_file(&repo_root.join(rel))?;
        hashes.insert(rel.to_string(), hash);
    }
    tracing::debug!(file_count = hashes.len(), "Fingerprinted files");
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_matches_git_object_ids() {
        // `git hash-object` of an empty file and of "hello\n"
        assert_eq!(
            git_blob_hash(b""),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
        assert_eq!(
            git_blob_hash(b"hello\n"),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
    }

    #[test]
    fn test_hash_file_streams_same_digest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("greeting.txt");
        fs::write(&path, b"hello\n").unwrap();

        assert_eq!(hash_file(&path).unwrap(), git_blob_hash(b"hello\n"));
    }

    #[test]
    fn test_large_file_spanning_buffers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("big.bin");
        let contents: Vec<u8> = (0..READ_BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &contents).unwrap();

        assert_eq!(hash_file(&path).unwrap(), git_blob_hash(&contents));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_hashes_target_string() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("real.txt"), b"contents").unwrap();
        let link = tmp.path().join("link.txt");
        std::os::unix::fs::symlink("real.txt", &link).unwrap();

        assert_eq!(hash_file(&link).unwrap(), git_blob_hash(b"real.txt"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = hash_file(&tmp.path().join("gone.txt")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_hash_files_keys_by_relative_path() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/b.ts"), b"b").unwrap();
        fs::write(tmp.path().join("src/a.ts"), b"a").unwrap();

        let hashes = hash_files(tmp.path(), ["src/b.ts", "src/a.ts"]).unwrap();
        let keys: Vec<_> = hashes.keys().cloned().collect();
        assert_eq!(keys, vec!["src/a.ts", "src/b.ts"]);
        assert_eq!(hashes["src/a.ts"], git_blob_hash(b"a"));
    }
}
