//! Snapshot extraction.
//!
//! Archives are gzip-compressed tarballs whose only top-level entry is the
//! source root. Each snapshot is extracted into its own working directory,
//! which is owned by the build step for that commit alone.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::CommitId;
use crate::fetch::FetchedSnapshot;

/// An extracted source tree and the working directory that contains it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSnapshot {
    pub commit: CommitId,
    /// Private working directory; removing it removes everything below.
    pub workspace: PathBuf,
    /// Root of the extracted source tree (inside `workspace`).
    pub source_root: PathBuf,
}

impl ExtractedSnapshot {
    /// Remove the working directory and everything in it.
    pub async fn discard(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.workspace).await {
            Ok(()) => {
                debug!(path = %self.workspace.display(), "working directory removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Extract `snapshot` into a fresh directory under `work_dir`, then delete
/// the archive.
pub async fn extract_snapshot(
    snapshot: &FetchedSnapshot,
    work_dir: &Path,
) -> io::Result<ExtractedSnapshot> {
    let workspace = work_dir.join(format!("{}-{}", snapshot.commit, Uuid::new_v4().simple()));
    let archive = snapshot.archive.clone();
    let target = workspace.clone();

    info!(archive = %archive.display(), "extracting");
    let extracted = tokio::task::spawn_blocking(move || unpack_tar_gz(&archive, &target))
        .await
        .map_err(io::Error::other)?;

    let source_root = match extracted {
        Ok(root) => root,
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_dir_all(&workspace).await {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %workspace.display(),
                        error = %rm,
                        "failed to remove partial extraction"
                    );
                }
            }
            return Err(e);
        }
    };
    info!(archive = %snapshot.archive.display(), root = %source_root.display(), "extracted");

    match tokio::fs::remove_file(&snapshot.archive).await {
        Ok(()) => debug!(archive = %snapshot.archive.display(), "archive removed"),
        Err(e) => warn!(
            archive = %snapshot.archive.display(),
            error = %e,
            "failed to remove archive"
        ),
    }

    Ok(ExtractedSnapshot {
        commit: snapshot.commit.clone(),
        workspace,
        source_root,
    })
}

/// Unpack a `.tar.gz` into `dest` and return the extraction root.
///
/// Global/extended pax headers are skipped. Entries that would land outside
/// `dest` are refused by `unpack_in`.
pub fn unpack_tar_gz(archive_path: &Path, dest: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dest)?;

    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut root: Option<PathBuf> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if matches!(
            entry.header().entry_type(),
            EntryType::XGlobalHeader | EntryType::XHeader
        ) {
            continue;
        }

        let path = entry.path()?.into_owned();
        let top = match path.components().next() {
            Some(Component::Normal(first)) => PathBuf::from(first),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected archive entry {}", path.display()),
                ))
            }
        };
        match &root {
            None => root = Some(top),
            Some(expected) if *expected != top => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "archive has more than one top-level entry: {} and {}",
                        expected.display(),
                        top.display()
                    ),
                ))
            }
            Some(_) => {}
        }

        if !entry.unpack_in(dest)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive entry escapes extraction root: {}", path.display()),
            ));
        }
    }

    let root = root
        .map(|r| dest.join(r))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "archive is empty"))?;
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("archive root {} is not a directory", root.display()),
        ));
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::write_source_archive;
    use tempfile::tempdir;

    #[test]
    fn test_unpack_returns_single_root() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("src.tar.gz");
        let files = [("setup.py", "print(1)"), ("docs/index.rst", "Hi")];
        write_source_archive(&archive, "acme-widgets-1234567", &files).unwrap();

        let root = unpack_tar_gz(&archive, &dir.path().join("out")).unwrap();
        assert_eq!(root, dir.path().join("out").join("acme-widgets-1234567"));
        assert_eq!(std::fs::read_to_string(root.join("docs/index.rst")).unwrap(), "Hi");
    }

    #[test]
    fn test_unpack_rejects_second_top_level_entry() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("two-roots.tar.gz");
        let file = File::create(&archive).unwrap();
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            file,
            flate2::Compression::fast(),
        ));
        for name in ["acme-widgets-1234567/setup.py", "stray/evil.py"] {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(1);
            builder.append_data(&mut header, name, &b"x"[..]).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let out = dir.path().join("out");
        let err = unpack_tar_gz(&archive, &out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!out.join("stray").exists());
    }

    #[test]
    fn test_unpack_garbage_fails() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("bad.tar.gz");
        std::fs::write(&archive, b"definitely not gzip").unwrap();
        assert!(unpack_tar_gz(&archive, &dir.path().join("out")).is_err());
    }

    #[tokio::test]
    async fn test_extract_snapshot_removes_archive() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("a.tar.gz");
        write_source_archive(&archive, "root", &[("README", "x")]).unwrap();
        let snapshot = FetchedSnapshot {
            commit: CommitId::parse(&"a".repeat(40)).unwrap(),
            archive: archive.clone(),
            bytes: 0,
            sha256: String::new(),
        };

        let extracted = extract_snapshot(&snapshot, &dir.path().join("_work")).await.unwrap();
        assert!(!archive.exists());
        assert!(extracted.source_root.join("README").is_file());
        assert!(extracted.source_root.starts_with(&extracted.workspace));

        extracted.discard().await.unwrap();
        assert!(!extracted.workspace.exists());
        extracted.discard().await.unwrap();
    }
}
