//! Zip archives of batch outputs.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Writes `files` into a zip at `dest`, stored without compression (the
/// media is already compressed). Entries are named by file name.
pub(crate) async fn write_archive(dest: PathBuf, files: Vec<PathBuf>) -> io::Result<PathBuf> {
    tokio::task::spawn_blocking(move || write_archive_sync(&dest, &files).map(|_| dest))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn write_archive_sync(dest: &Path, files: &[PathBuf]) -> io::Result<()> {
    let partial = dest.with_extension("zip.partial");
    let mut zip = zip::ZipWriter::new(File::create(&partial)?);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .large_file(true);

    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        zip.start_file(name, options).map_err(zip_error)?;
        io::copy(&mut File::open(path)?, &mut zip)?;
    }
    zip.finish().map_err(zip_error)?;
    std::fs::rename(&partial, dest)
}

fn zip_error(e: zip::result::ZipError) -> io::Error {
    match e {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}
