//! Canonical archive serialization of a store path's subtree.
//!
//! The on-wire container is a tar stream with every nondeterministic header
//! field pinned: entries are walked in lexicographic order, mtime/uid/gid are
//! zero, user and group names are empty, and modes collapse to 0o755
//! (directories and executables), 0o644 (other files) or 0o777 (symlinks).
//! Two subtrees with identical content therefore encode to identical bytes no
//! matter how the filesystem enumerates them. Only regular files, directories
//! and symlinks are representable; anything else is rejected, never dropped.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};

use crate::error::SyncError;

const DIR_MODE: u32 = 0o755;
const EXEC_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const LINK_MODE: u32 = 0o777;

/// Serialize the subtree rooted at `dir` into `writer`.
/// File contents stream through; nothing is fully buffered by the codec.
pub fn encode_into<W: Write>(dir: &Path, writer: W) -> Result<(), SyncError> {
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);
    append_dir_contents(&mut builder, dir, Path::new(""))?;
    builder
        .into_inner()
        .and_then(|mut w| w.flush())
        .map_err(|e| SyncError::io("archive encode", Some(&dir.to_string_lossy()), e))?;
    Ok(())
}

/// Serialize the subtree rooted at `dir` into a byte vector.
pub fn encode(dir: &Path) -> Result<Vec<u8>, SyncError> {
    let mut out = Vec::new();
    encode_into(dir, &mut out)?;
    Ok(out)
}

/// Reconstruct a subtree from an archive stream into `dest`.
/// `dest` is created if missing; foreign entry kinds and path traversal
/// are rejected.
pub fn decode_into<R: Read>(reader: R, dest: &Path) -> Result<(), SyncError> {
    fs::create_dir_all(dest)
        .map_err(|e| SyncError::io("archive decode", Some(&dest.to_string_lossy()), e))?;

    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| SyncError::io("archive decode", Some(&dest.to_string_lossy()), e))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| SyncError::io("archive decode", Some(&dest.to_string_lossy()), e))?;
        let rel = entry
            .path()
            .map_err(|e| SyncError::io("archive decode", None, e))?
            .into_owned();
        let target = safe_join(dest, &rel)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)
                    .map_err(|e| SyncError::io("archive decode", Some(&target.to_string_lossy()), e))?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| SyncError::io("archive decode", Some(&target.to_string_lossy()), e))?;
                }
                let mut file = File::create(&target)
                    .map_err(|e| SyncError::io("archive decode", Some(&target.to_string_lossy()), e))?;
                io::copy(&mut entry, &mut file)
                    .map_err(|e| SyncError::io("archive decode", Some(&target.to_string_lossy()), e))?;
                let executable = entry.header().mode().map(|m| m & 0o111 != 0).unwrap_or(false);
                set_file_mode(&target, if executable { EXEC_MODE } else { FILE_MODE })?;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| SyncError::io("archive decode", Some(&target.to_string_lossy()), e))?
                    .ok_or_else(|| SyncError::Io {
                        operation: "archive decode".to_string(),
                        path: Some(target.to_string_lossy().into_owned()),
                        source: "symlink entry without target".to_string(),
                    })?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| SyncError::io("archive decode", Some(&target.to_string_lossy()), e))?;
                }
                make_symlink(link.as_ref(), &target)?;
            }
            other => {
                return Err(SyncError::UnsupportedEntryKind {
                    path: rel.to_string_lossy().into_owned(),
                    kind: format!("{:?}", other),
                });
            }
        }
    }
    Ok(())
}

/// Append `dir`'s children (not `dir` itself) under the archive path `prefix`,
/// in lexicographic order.
fn append_dir_contents<W: Write>(
    builder: &mut Builder<W>,
    dir: &Path,
    prefix: &Path,
) -> Result<(), SyncError> {
    let mut names: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| SyncError::io("archive encode", Some(&dir.to_string_lossy()), e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<_>>()
        .map_err(|e| SyncError::io("archive encode", Some(&dir.to_string_lossy()), e))?;
    // Canonical order: byte-wise on the file name, independent of how the
    // filesystem happened to enumerate.
    names.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    for path in names {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let archive_path = prefix.join(&name);
        let meta = fs::symlink_metadata(&path)
            .map_err(|e| SyncError::io("archive encode", Some(&path.to_string_lossy()), e))?;
        let ftype = meta.file_type();

        if ftype.is_dir() {
            let mut header = canonical_header(EntryType::Directory, 0, DIR_MODE);
            builder
                .append_data(&mut header, &archive_path, io::empty())
                .map_err(|e| SyncError::io("archive encode", Some(&path.to_string_lossy()), e))?;
            append_dir_contents(builder, &path, &archive_path)?;
        } else if ftype.is_file() {
            let mode = if is_executable(&meta) { EXEC_MODE } else { FILE_MODE };
            let mut header = canonical_header(EntryType::Regular, meta.len(), mode);
            let file = File::open(&path)
                .map_err(|e| SyncError::io("archive encode", Some(&path.to_string_lossy()), e))?;
            builder
                .append_data(&mut header, &archive_path, file)
                .map_err(|e| SyncError::io("archive encode", Some(&path.to_string_lossy()), e))?;
        } else if ftype.is_symlink() {
            let target = fs::read_link(&path)
                .map_err(|e| SyncError::io("archive encode", Some(&path.to_string_lossy()), e))?;
            let mut header = canonical_header(EntryType::Symlink, 0, LINK_MODE);
            builder
                .append_link(&mut header, &archive_path, &target)
                .map_err(|e| SyncError::io("archive encode", Some(&path.to_string_lossy()), e))?;
        } else {
            return Err(SyncError::UnsupportedEntryKind {
                path: path.to_string_lossy().into_owned(),
                kind: entry_kind_name(&ftype),
            });
        }
    }
    Ok(())
}

fn canonical_header(kind: EntryType, size: u64, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn entry_kind_name(ftype: &fs::FileType) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if ftype.is_fifo() {
            return "fifo".to_string();
        }
        if ftype.is_socket() {
            return "socket".to_string();
        }
        if ftype.is_block_device() || ftype.is_char_device() {
            return "device".to_string();
        }
    }
    format!("{:?}", ftype)
}

fn is_executable(meta: &fs::Metadata) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        return meta.permissions().mode() & 0o111 != 0;
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        false
    }
}

fn set_file_mode(path: &Path, mode: u32) -> Result<(), SyncError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| SyncError::io("archive decode", Some(&path.to_string_lossy()), e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

fn make_symlink(target: &Path, at: &Path) -> Result<(), SyncError> {
    #[cfg(unix)]
    {
        if at.exists() || fs::symlink_metadata(at).is_ok() {
            fs::remove_file(at)
                .map_err(|e| SyncError::io("archive decode", Some(&at.to_string_lossy()), e))?;
        }
        std::os::unix::fs::symlink(target, at)
            .map_err(|e| SyncError::io("archive decode", Some(&at.to_string_lossy()), e))
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(SyncError::Io {
            operation: "archive decode".to_string(),
            path: Some(at.to_string_lossy().into_owned()),
            source: "symlinks unsupported on this platform".to_string(),
        })
    }
}

/// Join an archive-relative path under `dest`, rejecting traversal.
fn safe_join(dest: &Path, rel: &Path) -> Result<PathBuf, SyncError> {
    let mut out = dest.to_path_buf();
    for comp in rel.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => {
                return Err(SyncError::Io {
                    operation: "archive decode".to_string(),
                    path: Some(rel.to_string_lossy().into_owned()),
                    source: "path escapes extraction root".to_string(),
                });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn write_file(path: &Path, content: &[u8], executable: bool) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
        #[cfg(unix)]
        if executable {
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = executable;
    }

    fn sample_tree(root: &Path) {
        write_file(&root.join("bin/run"), b"#!/bin/sh\necho hi\n", true);
        write_file(&root.join("share/doc/readme.txt"), b"docs", false);
        write_file(&root.join("share/data.bin"), &[0u8, 1, 2, 3], false);
        #[cfg(unix)]
        std::os::unix::fs::symlink("../bin/run", root.join("share/run-link")).unwrap();
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let src = tempfile::tempdir().unwrap();
        sample_tree(src.path());

        let bytes = encode(src.path()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        decode_into(&bytes[..], dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("bin/run")).unwrap(), b"#!/bin/sh\necho hi\n");
        assert_eq!(fs::read(dst.path().join("share/doc/readme.txt")).unwrap(), b"docs");
        assert_eq!(fs::read(dst.path().join("share/data.bin")).unwrap(), &[0u8, 1, 2, 3]);

        #[cfg(unix)]
        {
            let mode = fs::metadata(dst.path().join("bin/run")).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0, "executable bit lost");
            let mode = fs::metadata(dst.path().join("share/data.bin")).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0, "executable bit invented");

            let link = fs::read_link(dst.path().join("share/run-link")).unwrap();
            assert_eq!(link, PathBuf::from("../bin/run"));
        }

        // Re-encoding the decoded tree reproduces the bytes.
        assert_eq!(encode(dst.path()).unwrap(), bytes);
    }

    #[test]
    fn test_encode_is_deterministic_across_creation_order() {
        let a = tempfile::tempdir().unwrap();
        write_file(&a.path().join("zebra.txt"), b"z", false);
        write_file(&a.path().join("alpha.txt"), b"a", false);
        write_file(&a.path().join("mid/inner.txt"), b"m", false);

        let b = tempfile::tempdir().unwrap();
        write_file(&b.path().join("mid/inner.txt"), b"m", false);
        write_file(&b.path().join("alpha.txt"), b"a", false);
        write_file(&b.path().join("zebra.txt"), b"z", false);

        assert_eq!(encode(a.path()).unwrap(), encode(b.path()).unwrap());
    }

    #[test]
    fn test_encode_ignores_mtime() {
        let a = tempfile::tempdir().unwrap();
        write_file(&a.path().join("f.txt"), b"same", false);
        let first = encode(a.path()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(a.path().join("f.txt"), b"same").unwrap();
        assert_eq!(encode(a.path()).unwrap(), first);
    }

    #[test]
    #[cfg(unix)]
    fn test_encode_rejects_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("pipe");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .expect("mkfifo not available");
        assert!(status.success());

        match encode(dir.path()) {
            Err(SyncError::UnsupportedEntryKind { kind, .. }) => assert_eq!(kind, "fifo"),
            other => panic!("expected UnsupportedEntryKind, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_decode_rejects_foreign_entry_type() {
        let mut raw = Vec::new();
        {
            let mut builder = Builder::new(&mut raw);
            let mut header = canonical_header(EntryType::Fifo, 0, 0o644);
            builder.append_data(&mut header, "pipe", io::empty()).unwrap();
            builder.finish().unwrap();
        }

        let dst = tempfile::tempdir().unwrap();
        assert!(matches!(
            decode_into(&raw[..], dst.path()),
            Err(SyncError::UnsupportedEntryKind { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_path_traversal() {
        let mut raw = Vec::new();
        {
            let mut builder = Builder::new(&mut raw);
            let mut header = canonical_header(EntryType::Regular, 4, 0o644);
            // `append_data` refuses `..` components, so write the hostile name
            // into the raw header bytes to exercise the decoder's own guard.
            let name = b"../escape";
            header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
            header.set_cksum();
            builder.append(&header, &b"oops"[..]).unwrap();
            builder.finish().unwrap();
        }

        let dst = tempfile::tempdir().unwrap();
        assert!(decode_into(&raw[..], dst.path()).is_err());
    }
}
