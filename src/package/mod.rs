use anyhow::{bail, Context, Result};
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter},
    path::{Path, PathBuf},
};
use glob::glob;
use tracing::{info, warn};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

/// Write `files` into a new archive at `archive`, each under its bare file
/// name. Returns `None` without creating anything when `files` is empty.
pub fn zip_files(files: &[PathBuf], archive: &Path) -> Result<Option<PathBuf>> {
    if files.is_empty() {
        return Ok(None);
    }
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)?;
    }
    let out = File::create(archive).with_context(|| format!("creating archive {}", archive.display()))?;
    let mut writer = ZipWriter::new(BufWriter::new(out));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for file in files {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            bail!("cannot archive path without a file name: {}", file.display());
        };
        writer
            .start_file(name, options)
            .with_context(|| format!("adding {} to {}", name, archive.display()))?;
        let mut input = BufReader::new(
            File::open(file).with_context(|| format!("opening {}", file.display()))?,
        );
        io::copy(&mut input, &mut writer)?;
    }
    writer.finish().with_context(|| format!("finishing archive {}", archive.display()))?;
    info!(archive = %archive.display(), files = files.len(), "zip file created");
    Ok(Some(archive.to_path_buf()))
}

/// Move every `.zip` found under `from` (recursively) into `to`.
pub fn move_archives(from: &Path, to: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(to)?;
    let mut moved = Vec::new();
    for src in zip_files_under(from)? {
        let Some(name) = src.file_name() else { continue };
        let dst = to.join(name);
        if src == dst {
            continue;
        }
        fs::rename(&src, &dst)
            .or_else(|_| fs::copy(&src, &dst).and_then(|_| fs::remove_file(&src)))
            .with_context(|| format!("moving {} to {}", src.display(), dst.display()))?;
        info!(path = %dst.display(), "moved zip file");
        moved.push(dst);
    }
    moved.sort();
    Ok(moved)
}

/// Delete every directory directly inside `dir`, keeping its files.
pub fn remove_subdirectories(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let path = entry.path();
            fs::remove_dir_all(&path).with_context(|| format!("deleting {}", path.display()))?;
            info!(path = %path.display(), "deleted directory");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Unpack the `<type>_with_*.zip` archives in `archive_dir` back into
/// `<result_dir>/<type>/<base>/<file>`, so that a resumed run packages them
/// together with its new files. Files already present are left alone.
pub fn restore_archives(archive_dir: &Path, result_dir: &Path) -> Result<usize> {
    let pattern = format!("{}/*_with_*.zip", archive_dir.display());
    let mut restored = 0;
    for archive in glob(&pattern)? {
        let archive = archive?;
        let Some((process_type, _)) = archive
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.split_once("_with_"))
        else {
            continue;
        };
        let file = File::open(&archive).with_context(|| format!("opening archive {}", archive.display()))?;
        let mut zip = ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("reading archive {}", archive.display()))?;

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let Some(name) = entry
                .enclosed_name()
                .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            else {
                warn!(archive = %archive.display(), entry = entry.name(), "unsafe entry name, skipped");
                continue;
            };
            let Some((base, _)) = name.rsplit_once("_with_") else {
                continue;
            };
            let dst = result_dir.join(process_type).join(base).join(&name);
            if dst.exists() {
                continue;
            }
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = BufWriter::new(
                File::create(&dst).with_context(|| format!("creating {}", dst.display()))?,
            );
            io::copy(&mut entry, &mut out).with_context(|| format!("extracting {}", dst.display()))?;
            restored += 1;
        }
    }
    if restored > 0 {
        info!(files = restored, "restored outputs of the previous run");
    }
    Ok(restored)
}

fn zip_files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/**/*.zip", dir.display());
    let mut found = Vec::new();
    for entry in glob(&pattern)? {
        found.push(entry?);
    }
    Ok(found)
}
