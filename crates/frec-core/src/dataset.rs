//! Enrollment dataset layout: one subdirectory per identity, named after it,
//! holding that identity's face images.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'))
}

pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

/// Identity directories under `root` as `(name, path)`, sorted by name.
/// Hidden entries and plain files are skipped.
pub fn identity_dirs(root: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut dirs: Vec<(String, PathBuf)> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && !is_hidden(path))
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            Some((name, path))
        })
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Image files directly inside `dir`, sorted by path.
pub fn image_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| !is_hidden(path) && is_image_file(path))
        .collect();
    images.sort();
    Ok(images)
}

/// Next free `<n>.jpg` in `dir`, starting at 1.
pub fn next_image_path(dir: &Path) -> PathBuf {
    (1u32..)
        .map(|n| dir.join(format!("{n}.jpg")))
        .find(|p| !p.exists())
        .unwrap_or_else(|| dir.join("0.jpg"))
}
