use std::{
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
};

use anyhow::Context;
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

fn normalize_rel_path(rel: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(rel);
    if p.is_absolute() {
        anyhow::bail!("absolute path not allowed");
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => anyhow::bail!("path traversal is not allowed"),
            Component::Prefix(_) | Component::RootDir => anyhow::bail!("absolute path not allowed"),
        }
    }
    Ok(out)
}

fn entry_name(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(seg) => Some(seg.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Zips everything under `src_dir` into `zip_path`, keeping paths relative to
/// `src_dir`. Empty directories are stored as directory entries. Symlinks are
/// followed and stored as the content they point at.
///
/// The archive is written next to its destination and renamed into place.
/// Any entry that cannot be stored fails the whole call and leaves no archive.
pub fn compress_dir(src_dir: &Path, zip_path: &Path) -> anyhow::Result<()> {
    if !src_dir.is_dir() {
        anyhow::bail!("site folder not found: {}", src_dir.display());
    }
    if let Some(parent) = zip_path.parent() {
        fs::create_dir_all(parent).context("create archive dir")?;
    }

    let tmp_path = zip_path.with_extension("zip.tmp");
    if let Err(e) = write_zip(src_dir, &tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fs::rename(&tmp_path, zip_path).context("persist archive")?;
    Ok(())
}

fn write_zip(src_dir: &Path, tmp_path: &Path) -> anyhow::Result<()> {
    let out = fs::File::create(tmp_path).context("create archive temp file")?;
    let mut zip = ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let walk = WalkDir::new(src_dir)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name();
    for entry in walk {
        let entry = entry.context("walk site folder")?;
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .context("strip site folder prefix")?;
        let name = entry_name(rel);
        if name.is_empty() {
            continue;
        }

        let ft = entry.file_type();
        if ft.is_dir() {
            zip.add_directory(format!("{name}/"), options)
                .with_context(|| format!("add directory {name}"))?;
        } else if ft.is_file() {
            zip.start_file(name.as_str(), options)
                .with_context(|| format!("add file {name}"))?;
            let data = fs::read(entry.path()).with_context(|| format!("read {name}"))?;
            zip.write_all(&data)
                .with_context(|| format!("compress {name}"))?;
        } else {
            anyhow::bail!("cannot archive special file {name}");
        }
    }

    let mut out = zip.finish().context("finalize archive")?;
    out.flush().ok();
    out.sync_all().ok();
    Ok(())
}

/// Extracts `zip_path` into `out_dir`, refusing entries that escape it.
pub fn extract_zip_safely(zip_path: &Path, out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)?;
    let f = fs::File::open(zip_path).context("open archive")?;
    let mut archive = ZipArchive::new(f).context("read archive")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel =
            normalize_rel_path(trimmed).with_context(|| format!("invalid zip path {trimmed:?}"))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = out_dir.join(&rel);
        if name.ends_with('/') {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("create {}", rel.display()))?;
        std::io::copy(&mut file, &mut out).with_context(|| format!("extract {}", rel.display()))?;
    }
    Ok(())
}
