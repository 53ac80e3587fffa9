use crate::error::{RelmaError, Result};
use crate::github::ReleaseSource;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use tempfile::TempDir;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarXz,
    Tar,
    Zip,
    /// The asset is the executable itself.
    Bare,
}

const TAR_GZ_EXTS: &[&str] = &[".tar.gz", ".tgz"];
const TAR_XZ_EXTS: &[&str] = &[".tar.xz", ".txz"];
const TAR_EXTS: &[&str] = &[".tar"];
const ZIP_EXTS: &[&str] = &[".zip"];
const UNSUPPORTED_EXTS: &[&str] = &[
    ".tar.bz2", ".tbz", ".tbz2", ".tar.zst", ".7z", ".rar", ".gz", ".xz", ".bz2", ".deb",
    ".rpm", ".apk", ".dmg", ".pkg", ".msi", ".whl", ".sha256", ".sha512", ".sig", ".asc", ".pem",
    ".sbom", ".json", ".txt", ".md",
];

impl ArchiveKind {
    /// Pick the container format from the asset file name.
    pub fn detect(asset_file_name: &str) -> Result<Self> {
        let name = asset_file_name.to_lowercase();
        let has = |exts: &[&str]| exts.iter().any(|ext| name.ends_with(ext));

        if has(TAR_GZ_EXTS) {
            Ok(ArchiveKind::TarGz)
        } else if has(TAR_XZ_EXTS) {
            Ok(ArchiveKind::TarXz)
        } else if has(TAR_EXTS) {
            Ok(ArchiveKind::Tar)
        } else if has(ZIP_EXTS) {
            Ok(ArchiveKind::Zip)
        } else if has(UNSUPPORTED_EXTS) {
            Err(RelmaError::UnsupportedFormat {
                asset: asset_file_name.to_string(),
                reason: "not an archive relma can unpack, nor a bare executable".to_string(),
            })
        } else {
            Ok(ArchiveKind::Bare)
        }
    }
}

/// One regular file produced by unpacking, relative to the scratch root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntry {
    pub relative_path: PathBuf,
    pub is_executable: bool,
    pub mode: Option<u32>,
}

/// Unpacked asset contents. The scratch directory is deleted on drop.
#[derive(Debug)]
pub struct Unpacked {
    scratch: TempDir,
    pub kind: ArchiveKind,
    pub asset_file_name: String,
    pub entries: Vec<ExtractedEntry>,
}

impl Unpacked {
    pub fn root(&self) -> &Path {
        self.scratch.path()
    }

    pub fn path_of(&self, entry: &ExtractedEntry) -> PathBuf {
        self.root().join(&entry.relative_path)
    }
}

/// Download `url` and unpack it into a fresh scratch directory.
pub async fn fetch_and_unpack(
    source: &dyn ReleaseSource,
    url: &str,
    asset_file_name: &str,
) -> Result<Unpacked> {
    // Reject unusable formats before spending a download on them.
    ArchiveKind::detect(asset_file_name)?;

    let bytes = source
        .fetch_bytes(url)
        .await
        .map_err(|source| RelmaError::Download {
            url: url.to_string(),
            source,
        })?;

    unpack_bytes(&bytes, asset_file_name)
}

pub fn unpack_bytes(bytes: &[u8], asset_file_name: &str) -> Result<Unpacked> {
    let kind = ArchiveKind::detect(asset_file_name)?;
    let unsupported = |reason: String| RelmaError::UnsupportedFormat {
        asset: asset_file_name.to_string(),
        reason,
    };

    let scratch = tempfile::Builder::new()
        .prefix("relma-")
        .tempdir()
        .map_err(|e| RelmaError::filesystem(std::env::temp_dir(), e))?;
    tracing::debug!(
        "Unpacking {} ({:?}) into {}",
        asset_file_name,
        kind,
        scratch.path().display()
    );

    match kind {
        ArchiveKind::TarGz => extract_tar(GzDecoder::new(bytes), scratch.path())
            .map_err(|e| unsupported(format!("could not unpack gzip tarball: {}", e)))?,
        ArchiveKind::TarXz => extract_tar(xz2::read::XzDecoder::new(bytes), scratch.path())
            .map_err(|e| unsupported(format!("could not unpack xz tarball: {}", e)))?,
        ArchiveKind::Tar => extract_tar(bytes, scratch.path())
            .map_err(|e| unsupported(format!("could not unpack tarball: {}", e)))?,
        ArchiveKind::Zip => extract_zip(bytes, scratch.path())
            .map_err(|e| unsupported(format!("could not unpack zip archive: {}", e)))?,
        ArchiveKind::Bare => {
            if bytes.is_empty() {
                return Err(unsupported("downloaded asset is empty".to_string()));
            }
            write_bare(bytes, asset_file_name, scratch.path())
                .map_err(|e| RelmaError::filesystem(scratch.path(), e))?
        }
    }

    let entries = collect_entries(scratch.path(), kind)?;
    if entries.is_empty() {
        return Err(unsupported("archive contains no regular files".to_string()));
    }

    tracing::info!(
        "Extracted {} file(s) from {}",
        entries.len(),
        asset_file_name
    );
    Ok(Unpacked {
        scratch,
        kind,
        asset_file_name: asset_file_name.to_string(),
        entries,
    })
}

fn extract_tar<R: Read>(reader: R, extract_dir: &Path) -> io::Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        // unpack_in refuses paths escaping the extraction directory
        if !entry.unpack_in(extract_dir)? {
            tracing::warn!(
                "Skipping unsafe path in tarball: {}",
                entry.path()?.display()
            );
        }
    }
    Ok(())
}

fn extract_zip(bytes: &[u8], extract_dir: &Path) -> io::Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let relative = match file.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                tracing::warn!("Skipping unsafe path in zip: {}", file.name());
                continue;
            }
        };
        let outpath = extract_dir.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = fs::File::create(&outpath)?;
        io::copy(&mut file, &mut outfile)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }
    Ok(())
}

fn write_bare(bytes: &[u8], asset_file_name: &str, extract_dir: &Path) -> io::Result<()> {
    let name = Path::new(asset_file_name)
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "asset has no file name"))?;
    let target = extract_dir.join(name);
    fs::write(&target, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn collect_entries(extract_dir: &Path, kind: ArchiveKind) -> Result<Vec<ExtractedEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(extract_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(extract_dir).to_path_buf();
            RelmaError::filesystem(path, io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative_path = path
            .strip_prefix(extract_dir)
            .unwrap_or(path)
            .to_path_buf();
        let mode = file_mode(path).map_err(|e| RelmaError::filesystem(path, e))?;
        let is_executable = kind == ArchiveKind::Bare || is_executable(path, mode);

        entries.push(ExtractedEntry {
            relative_path,
            is_executable,
            mode,
        });
    }
    Ok(entries)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> io::Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;
    Ok(Some(fs::metadata(path)?.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> io::Result<Option<u32>> {
    Ok(None)
}

fn is_executable(path: &Path, mode: Option<u32>) -> bool {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase();
    // Libraries often carry the exec bit but are never what a user runs.
    if matches!(ext.as_str(), "so" | "dylib" | "dll") {
        return false;
    }
    match mode {
        Some(mode) => mode & 0o111 != 0,
        None => matches!(ext.as_str(), "exe" | "cmd" | "bat"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn tar_gz(files: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, data, mode) in files {
            let mut header = tar::Header::new_gnu();
            if path.ends_with('/') {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
            } else {
                header.set_size(data.len() as u64);
            }
            header.set_mode(*mode);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_detect_kind() {
        assert_eq!(ArchiveKind::detect("tool_linux.tar.gz").unwrap(), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect("TOOL.TGZ").unwrap(), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect("tool.tar.xz").unwrap(), ArchiveKind::TarXz);
        assert_eq!(ArchiveKind::detect("tool_windows.zip").unwrap(), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::detect("tool_linux.tar").unwrap(), ArchiveKind::Tar);
        assert_eq!(ArchiveKind::detect("tool").unwrap(), ArchiveKind::Bare);
        assert_eq!(ArchiveKind::detect("tool-linux-amd64").unwrap(), ArchiveKind::Bare);
        assert_eq!(ArchiveKind::detect("tool.exe").unwrap(), ArchiveKind::Bare);
        assert_eq!(ArchiveKind::detect("tool_1.2.0_linux_x86_64").unwrap(), ArchiveKind::Bare);

        for name in ["tool.deb", "tool.tar.bz2", "checksums.txt", "tool.tar.gz.sha256"] {
            assert!(matches!(
                ArchiveKind::detect(name),
                Err(RelmaError::UnsupportedFormat { .. })
            ));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_tar_gz_preserves_exec_bit() {
        let bytes = tar_gz(&[
            ("tool_linux/", b"", 0o755),
            ("tool_linux/tool", b"#!/bin/sh\necho tool\n", 0o755),
            ("tool_linux/README.md", b"# tool\n", 0o644),
        ]);

        let unpacked = unpack_bytes(&bytes, "tool_linux.tar.gz").unwrap();
        assert_eq!(unpacked.kind, ArchiveKind::TarGz);
        assert_eq!(unpacked.entries.len(), 2);

        let readme = &unpacked.entries[0];
        assert_eq!(readme.relative_path, PathBuf::from("tool_linux/README.md"));
        assert!(!readme.is_executable);

        let tool = &unpacked.entries[1];
        assert_eq!(tool.relative_path, PathBuf::from("tool_linux/tool"));
        assert!(tool.is_executable);
        assert_eq!(tool.mode, Some(0o755));
        assert!(unpacked.path_of(tool).is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_plain_tar() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, "tool_linux/tool", &b"tool"[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let unpacked = unpack_bytes(&bytes, "tool_linux.tar").unwrap();
        assert_eq!(unpacked.kind, ArchiveKind::Tar);
        assert_eq!(unpacked.entries.len(), 1);
        assert_eq!(unpacked.entries[0].relative_path, PathBuf::from("tool_linux/tool"));
        assert!(unpacked.entries[0].is_executable);
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_zip_uses_unix_mode() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let exec = zip::write::FileOptions::default().unix_permissions(0o755);
        let plain = zip::write::FileOptions::default().unix_permissions(0o644);
        writer.add_directory("dist/", plain).unwrap();
        writer.start_file("dist/tool", exec).unwrap();
        writer.write_all(b"binary").unwrap();
        writer.start_file("dist/libtool.so", exec).unwrap();
        writer.write_all(b"library").unwrap();
        writer.start_file("dist/LICENSE", plain).unwrap();
        writer.write_all(b"MIT").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let unpacked = unpack_bytes(&bytes, "tool.zip").unwrap();
        let executables: Vec<_> = unpacked
            .entries
            .iter()
            .filter(|e| e.is_executable)
            .map(|e| e.relative_path.clone())
            .collect();
        assert_eq!(executables, vec![PathBuf::from("dist/tool")]);
        assert_eq!(unpacked.entries.len(), 3);
    }

    #[test]
    fn test_unpack_bare_binary() {
        let unpacked = unpack_bytes(b"\x7fELF fake", "tool-linux-amd64").unwrap();
        assert_eq!(unpacked.kind, ArchiveKind::Bare);
        assert_eq!(unpacked.entries.len(), 1);
        assert_eq!(unpacked.entries[0].relative_path, PathBuf::from("tool-linux-amd64"));
        assert!(unpacked.entries[0].is_executable);
    }

    #[test]
    fn test_unpack_rejects_empty_and_corrupt_assets() {
        assert!(matches!(
            unpack_bytes(b"", "tool"),
            Err(RelmaError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            unpack_bytes(b"definitely not gzip", "tool.tar.gz"),
            Err(RelmaError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            unpack_bytes(&tar_gz(&[("empty/", b"", 0o755)]), "tool.tar.gz"),
            Err(RelmaError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_scratch_is_removed_on_drop() {
        let unpacked = unpack_bytes(b"bin", "tool").unwrap();
        let root = unpacked.root().to_path_buf();
        assert!(root.exists());
        drop(unpacked);
        assert!(!root.exists());
    }
}
