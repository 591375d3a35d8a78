use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MP3_EXTENSIONS: &[&str] = &["mp3"];

pub fn scan_mp3_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !is_resource_fork(e.path()) && is_mp3(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

/// Resolve command line inputs (files, directories or glob patterns) to MP3 files.
pub fn collect_inputs(inputs: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for input in inputs {
        let expanded = shellexpand::tilde(input);
        let path = PathBuf::from(expanded.as_ref());

        if path.is_dir() {
            files.extend(scan_mp3_files(&path));
        } else if path.is_file() {
            files.push(path);
        } else if is_pattern(&expanded) {
            let matches = glob::glob(&expanded)
                .with_context(|| format!("Invalid pattern: {}", input))?;
            for entry in matches.filter_map(|e| e.ok()) {
                if entry.is_file() && !is_resource_fork(&entry) && is_mp3(&entry) {
                    files.push(entry);
                }
            }
        } else {
            bail!("No such file or directory: {}", input);
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// macOS AppleDouble/resource fork files
fn is_resource_fork(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with("._"))
        .unwrap_or(false)
}

fn is_pattern(input: &str) -> bool {
    input.contains(['*', '?', '['])
}

pub fn is_mp3(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| MP3_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn get_supported_extensions() -> Vec<&'static str> {
    MP3_EXTENSIONS.to_vec()
}
