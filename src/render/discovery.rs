//! Locating render artifacts in a working directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions treated as rendered video.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "avi"];

/// Intermediate segment directory the renderer leaves behind.
const PARTIAL_DIR: &str = "partial_movie_files";

/// Quality subdirectories the renderer writes to.
const QUALITY_DIRS: &[&str] = &["480p15", "720p30", "1080p60", "1440p60", "2160p60"];

pub fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(ext)))
}

fn walk(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == PARTIAL_DIR))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
}

/// Most recently modified file under `root` matching `predicate`, skipping
/// partial segment directories.
pub fn find_latest_matching<P>(root: &Path, predicate: P) -> Option<PathBuf>
where
    P: Fn(&Path) -> bool,
{
    walk(root)
        .filter(|e| predicate(e.path()))
        .map(|e| {
            let modified = e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.into_path())
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
        .map(|(_, path)| path)
}

/// Every file under `root` matching `predicate`, sorted by path.
pub fn find_all_matching<P>(root: &Path, predicate: P) -> Vec<PathBuf>
where
    P: Fn(&Path) -> bool,
{
    let mut found: Vec<PathBuf> = walk(root)
        .filter(|e| predicate(e.path()))
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}

/// Directories checked, in order, for the expected file name once the root
/// path misses.
pub fn candidate_dirs(work_dir: &Path, stem: &str) -> Vec<PathBuf> {
    let videos = work_dir.join("media").join("videos");
    let scene_dir = videos.join(stem);
    let mut dirs = vec![scene_dir.clone()];
    dirs.extend(QUALITY_DIRS.iter().map(|q| scene_dir.join(q)));
    dirs.push(videos.join("scenes").join(stem));
    dirs.push(videos);
    dirs
}

/// Find the render output for `stem` and move it to `<work_dir>/<file_name>`.
///
/// A match outside the root path is renamed there; if the rename fails the
/// found path is returned as is.
pub fn locate_output(work_dir: &Path, stem: &str, file_name: &str) -> Option<PathBuf> {
    let expected = work_dir.join(file_name);
    if expected.is_file() {
        return Some(expected);
    }

    let found = candidate_dirs(work_dir, stem)
        .into_iter()
        .map(|dir| dir.join(file_name))
        .find(|p| p.is_file())
        .or_else(|| find_latest_matching(work_dir, is_video))?;

    debug!(found = %found.display(), "Output found outside root path");
    match std::fs::rename(&found, &expected) {
        Ok(()) => Some(expected),
        Err(e) => {
            warn!(from = %found.display(), error = %e, "Could not move output to root path");
            Some(found)
        }
    }
}
