//! Zip backup of the whole repository.
//!
//! Every item file and attachment under the storage root goes into the
//! archive with its path relative to the root, so unpacking the archive into
//! an empty directory yields a working store. The derived `.chaos` directory
//! (search index) is left out.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::Config;

const INTERNAL_DIR: &str = ".chaos";

/// Writes the archive of `root` to `writer`, skipping `skip` if it lies
/// inside the root. Returns the number of files archived.
pub fn write_archive<W: Write + Seek>(root: &Path, writer: W, skip: Option<&Path>) -> Result<usize> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut count = 0;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == INTERNAL_DIR));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if skip.is_some_and(|s| s == path) {
            continue;
        }
        // Leftovers of interrupted atomic writes.
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') && name.ends_with(".tmp") {
            continue;
        }

        let rel = path.strip_prefix(root)?;
        let archive_name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        zip.start_file(archive_name, options)?;
        zip.write_all(&bytes)?;
        count += 1;
    }

    zip.finish()?;
    Ok(count)
}

fn default_output() -> PathBuf {
    PathBuf::from(format!(
        "chaos-export-{}.zip",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    ))
}

/// `chaos export`
pub async fn run_export(config: &Config, output: Option<&Path>) -> Result<()> {
    let output = output.map(Path::to_path_buf).unwrap_or_else(default_output);
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(&output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let skip = output.canonicalize().ok();
    let root = config
        .storage
        .root
        .canonicalize()
        .with_context(|| format!("Storage root {} does not exist", config.storage.root.display()))?;
    let count = write_archive(&root, file, skip.as_deref())?;

    tracing::info!(files = count, output = %output.display(), "exported archive");
    eprintln!("Exported {} files to {}", count, output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use tempfile::TempDir;

    #[test]
    fn archives_items_without_index() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("notes")).unwrap();
        std::fs::create_dir_all(root.join("images/pic")).unwrap();
        std::fs::create_dir_all(root.join(".chaos")).unwrap();
        std::fs::write(root.join("notes/a.md"), "---\ntitle: A\n---\nhello\n").unwrap();
        std::fs::write(root.join("images/pic/cat.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(root.join("notes/.b.md.tmp"), "partial").unwrap();
        std::fs::write(root.join(".chaos/index.sqlite"), "index").unwrap();

        let mut buf = Vec::new();
        let count = write_archive(root, Cursor::new(&mut buf), None).unwrap();
        assert_eq!(count, 2);

        let mut archive = zip::ZipArchive::new(Cursor::new(buf)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["images/pic/cat.png", "notes/a.md"]);

        let mut text = String::new();
        archive
            .by_name("notes/a.md")
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.ends_with("hello\n"));
    }
}
