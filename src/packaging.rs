//! `.tar.gz` deploy archives.
//!
//! The CLI packs a project directory with [`pack_dir`]; the server checks
//! uploads with [`inspect_archive`] before anything is persisted, stages them
//! with [`unpack_into`] / [`save_file`] and repacks the staged directory for
//! the hosting provider. All functions do blocking IO.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::{Archive, Builder, Entry};

/// Directories never shipped in a deploy archive.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", ".ntl"];

/// Most files a single upload may expand to.
pub const MAX_ARCHIVE_FILES: usize = 20_000;

#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("path escapes the deployment directory: {0}")]
    UnsafePath(String),

    #[error("nothing to package in {0}")]
    Empty(PathBuf),

    #[error("upload expands past the {limit} byte / {} file limit", MAX_ARCHIVE_FILES)]
    TooLarge { limit: u64 },

    #[error("archive entry {0} is not a regular file or directory")]
    UnsupportedEntry(String),

    #[error("archive is not a readable .tar.gz: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Resolve an uploaded entry name to a path relative to the deployment root.
pub fn sanitize_relative(name: &str) -> Result<PathBuf, PackagingError> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PackagingError::UnsafePath(name.to_string()))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(PackagingError::UnsafePath(name.to_string()));
    }
    Ok(out)
}

/// Write one uploaded file under `root`, creating parent directories.
pub fn save_file(root: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, PackagingError> {
    let relative = sanitize_relative(name)?;
    let target = root.join(&relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, bytes)?;
    Ok(relative)
}

/// Running totals of an upload, checked against a byte budget.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub bytes: u64,
}

impl ArchiveSummary {
    /// Count one plain file of `size` bytes.
    pub fn add_file(&mut self, size: u64, max_bytes: u64) -> Result<(), PackagingError> {
        self.files += 1;
        self.bytes = self.bytes.saturating_add(size);
        if self.files > MAX_ARCHIVE_FILES || self.bytes > max_bytes {
            return Err(PackagingError::TooLarge { limit: max_bytes });
        }
        Ok(())
    }

    /// Vet one archive entry. `Ok(false)` means the entry is skipped.
    fn admit<R: Read>(&mut self, entry: &Entry<'_, R>, max_bytes: u64) -> Result<bool, PackagingError> {
        let name = entry.path()?.to_string_lossy().into_owned();
        if Path::new(&name).components().all(|c| c == Component::CurDir) {
            return Ok(false); // "./" root entry from `tar -C dir .`
        }
        sanitize_relative(&name)?;

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            return Ok(true);
        }
        if !kind.is_file() {
            return Err(PackagingError::UnsupportedEntry(name));
        }
        self.add_file(entry.header().size()?, max_bytes)?;
        Ok(true)
    }
}

/// Walk a gzipped tarball without writing anything: every name must stay
/// inside the deployment directory, only files and directories are allowed,
/// and the expanded size must fit `max_bytes`.
pub fn inspect_archive(archive: &[u8], max_bytes: u64) -> Result<ArchiveSummary, PackagingError> {
    let walk = || -> Result<ArchiveSummary, PackagingError> {
        let mut archive = Archive::new(GzDecoder::new(archive));
        let mut summary = ArchiveSummary::default();
        for entry in archive.entries()? {
            summary.admit(&entry?, max_bytes)?;
        }
        Ok(summary)
    };
    walk().map_err(|err| match err {
        PackagingError::Io(io) => PackagingError::Corrupt(io.to_string()),
        other => other,
    })
}

/// Unpack a gzipped tarball into `root` under the same rules as
/// [`inspect_archive`]. Returns the number of files written.
pub fn unpack_into(root: &Path, archive: &[u8], max_bytes: u64) -> Result<usize, PackagingError> {
    fs::create_dir_all(root)?;
    let mut archive = Archive::new(GzDecoder::new(archive));
    let mut summary = ArchiveSummary::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if summary.admit(&entry, max_bytes)? {
            entry.unpack_in(root)?;
        }
    }
    Ok(summary.files)
}

/// Pack every file under `dir` into an in-memory `.tar.gz`, paths relative to `dir`.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>, PackagingError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    let mut files = 0;
    append_tree(&mut builder, dir, Path::new(""), &mut files)?;
    if files == 0 {
        return Err(PackagingError::Empty(dir.to_path_buf()));
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_tree<W: std::io::Write>(
    builder: &mut Builder<W>,
    root: &Path,
    relative: &Path,
    files: &mut usize,
) -> Result<(), PackagingError> {
    let mut entries = fs::read_dir(root.join(relative))?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let rel = relative.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                continue;
            }
            append_tree(builder, root, &rel, files)?;
        } else if file_type.is_file() {
            builder.append_path_with_name(entry.path(), &rel)?;
            *files += 1;
        }
    }
    Ok(())
}

/// Files staged for a deployment, relative to `root`.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, PackagingError> {
    let mut out = Vec::new();
    if root.exists() {
        collect(root, Path::new(""), &mut out)?;
    }
    out.sort();
    Ok(out)
}

fn collect(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> Result<(), PackagingError> {
    for entry in fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let rel = relative.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            collect(root, &rel, out)?;
        } else {
            out.push(rel);
        }
    }
    Ok(())
}

/// Build a .tar.gz with raw header names, bypassing the tar crate's own
/// path checks so hostile names can be produced.
#[cfg(test)]
pub(crate) fn raw_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, body) in entries {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(body.len() as u64);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, *body).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: u64 = 1024 * 1024;

    fn read_entries(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = Archive::new(GzDecoder::new(archive));
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            out.push((name, bytes));
        }
        out
    }


    #[test]
    fn rejects_traversal_names() {
        for bad in ["../etc/passwd", "/abs/path", "a/../../b", ""] {
            assert!(sanitize_relative(bad).is_err(), "{bad} should be rejected");
        }
        assert_eq!(
            sanitize_relative("./assets/app.js").unwrap(),
            PathBuf::from("assets/app.js")
        );
    }

    #[test]
    fn packs_project_and_skips_vcs_dirs() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("index.html"), "<h1>hi</h1>").unwrap();
        fs::create_dir_all(src.path().join("css")).unwrap();
        fs::write(src.path().join("css/site.css"), "body{}").unwrap();
        fs::create_dir_all(src.path().join(".git")).unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref").unwrap();

        let packed = pack_dir(src.path()).unwrap();
        let names: Vec<String> = read_entries(&packed)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["css/site.css", "index.html"]);

        let dest = tempfile::tempdir().unwrap();
        assert_eq!(inspect_archive(&packed, BUDGET).unwrap().files, 2);
        assert_eq!(unpack_into(dest.path(), &packed, BUDGET).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(dest.path().join("index.html")).unwrap(),
            "<h1>hi</h1>"
        );
    }

    #[test]
    fn empty_directory_is_an_error() {
        let src = tempfile::tempdir().unwrap();
        assert!(matches!(pack_dir(src.path()), Err(PackagingError::Empty(_))));
    }

    #[test]
    fn saved_files_land_under_root() {
        let root = tempfile::tempdir().unwrap();
        save_file(root.path(), "nested/page.html", b"x").unwrap();
        assert!(save_file(root.path(), "../escape.html", b"x").is_err());
        assert_eq!(
            list_files(root.path()).unwrap(),
            vec![PathBuf::from("nested/page.html")]
        );
    }

    #[test]
    fn traversal_entries_are_refused_before_writing() {
        let hostile = raw_archive(&[("index.html", "ok".as_bytes()), ("../evil.html", "pwned".as_bytes())]);
        assert!(matches!(
            inspect_archive(&hostile, BUDGET),
            Err(PackagingError::UnsafePath(name)) if name == "../evil.html"
        ));

        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("site");
        assert!(unpack_into(&root, &hostile, BUDGET).is_err());
        assert!(!parent.path().join("evil.html").exists());
    }

    #[test]
    fn expanded_size_is_capped() {
        let big = vec![0u8; 64 * 1024];
        let archive = raw_archive(&[("a.bin", big.as_slice()), ("b.bin", big.as_slice())]);
        assert_eq!(inspect_archive(&archive, BUDGET).unwrap().bytes, 128 * 1024);
        assert!(matches!(
            inspect_archive(&archive, 100 * 1024),
            Err(PackagingError::TooLarge { limit: 102_400 })
        ));

        let dest = tempfile::tempdir().unwrap();
        assert!(unpack_into(dest.path(), &archive, 100 * 1024).is_err());
    }

    #[test]
    fn garbage_is_reported_as_corrupt() {
        assert!(matches!(
            inspect_archive(b"definitely not gzip", BUDGET),
            Err(PackagingError::Corrupt(_))
        ));
    }
}
