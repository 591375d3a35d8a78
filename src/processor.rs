use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::cut::{CropReport, ScanOptions, ScannedMp3};
use crate::id3::{self, Id3v1};
use crate::track::{self, NameFields, Track};

/// A scanned input file.
pub struct SourceFile {
    pub path: PathBuf,
    pub scanned: ScannedMp3,
    pub id3v1: Option<Id3v1>,
}

impl SourceFile {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub struct ProcessResult {
    pub track: u32,
    pub path: PathBuf,
    pub report: Option<CropReport>,
    pub error: Option<String>,
}

/// Album-level names, used when a track carries none of its own.
#[derive(Debug, Clone, Default)]
pub struct Naming {
    pub scheme: String,
    pub album: Option<String>,
    pub performer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlannedTrack {
    pub track: Track,
    pub path: PathBuf,
}

/// Scan the MPEG region of a file, between its ID3v2 and ID3v1 tags.
pub fn scan_file(path: &Path, options: &ScanOptions) -> Result<SourceFile> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let (region, id3v1) = id3::locate_audio(&mut file)
        .with_context(|| format!("Failed to read tags of {}", path.display()))?;

    let limit = options
        .stream_limit
        .map_or(region.len(), |limit| limit.min(region.len()));
    let options = ScanOptions {
        stream_limit: Some(limit),
        ..*options
    };
    let scanned = ScannedMp3::scan(BufReader::new(file), region.start, &options)
        .with_context(|| format!("Failed to scan {}", path.display()))?;

    Ok(SourceFile {
        path: path.to_path_buf(),
        scanned,
        id3v1,
    })
}

pub fn ensure_output_dir(dir: &str) -> Result<PathBuf> {
    let dir = PathBuf::from(shellexpand::tilde(dir).as_ref());
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    Ok(dir)
}

/// Work out the output file of every track.
pub fn plan_tracks(
    source: &SourceFile,
    tracks: Vec<Track>,
    naming: &Naming,
    out_dir: &Path,
) -> Result<Vec<PlannedTrack>> {
    if tracks.len() > 1 && !track::scheme_distinguishes_tracks(&naming.scheme) {
        bail!("The naming scheme must contain %n or %t to extract more than one track");
    }

    // `./a.mp3` and `a.mp3` name the same file, so compare resolved paths
    let source_path = fs::canonicalize(&source.path)
        .with_context(|| format!("Failed to resolve {}", source.path.display()))?;
    let resolved_dir = fs::canonicalize(out_dir)
        .with_context(|| format!("Failed to resolve {}", out_dir.display()))?;

    let stem = source.stem();
    let tag = source.id3v1.as_ref();
    let album = naming
        .album
        .clone()
        .or_else(|| tag.map(|t| t.album.clone()))
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let mut planned = Vec::with_capacity(tracks.len());
    for track in tracks {
        let title = track
            .title
            .clone()
            .unwrap_or_else(|| format!("Track {}", track::leading_zero(track.number)));
        let performer = track
            .performer
            .clone()
            .or_else(|| naming.performer.clone())
            .or_else(|| tag.map(|t| t.artist.clone()).filter(|a| !a.is_empty()))
            .unwrap_or_else(|| "Unknown Artist".to_string());

        let name = track::output_file_name(
            &naming.scheme,
            &NameFields {
                source: &stem,
                number: track.number,
                title: &title,
                performer: &performer,
                album: &album,
            },
        );
        if resolved_dir.join(&name) == source_path {
            bail!("Track {} would overwrite the source file", track.number);
        }
        let path = out_dir.join(name);
        if !seen.insert(path.clone()) {
            bail!("Two tracks map to the same file name: {}", path.display());
        }
        planned.push(PlannedTrack { track, path });
    }
    Ok(planned)
}

/// Crop one track into its output file. The file only appears once it is complete.
pub fn write_track(source: &SourceFile, planned: &PlannedTrack) -> Result<CropReport> {
    let part_path = planned.path.with_extension("mp3.part");
    let result = crop_into(source, &planned.track, &part_path);
    match result {
        Ok(report) => {
            fs::rename(&part_path, &planned.path).context("Failed to rename output file")?;
            Ok(report)
        }
        Err(e) => {
            // Clean up partial output
            let _ = fs::remove_file(&part_path);
            Err(e)
        }
    }
}

fn crop_into(source: &SourceFile, track: &Track, part_path: &Path) -> Result<CropReport> {
    let input = File::open(&source.path).context("Failed to reopen source file")?;
    let mut input = BufReader::new(input);
    let output = File::create(part_path)
        .with_context(|| format!("Failed to create {}", part_path.display()))?;
    let mut output = BufWriter::new(output);

    let report = source
        .scanned
        .crop(track.start, track.end, &mut input, &mut output)
        .with_context(|| format!("Failed to cut track {}", track.number))?;
    output.flush().context("Failed to write output file")?;
    Ok(report)
}

pub fn process_track(source: &SourceFile, planned: &PlannedTrack) -> ProcessResult {
    let mut result = ProcessResult {
        track: planned.track.number,
        path: planned.path.clone(),
        report: None,
        error: None,
    };

    match write_track(source, planned) {
        Ok(report) => result.report = Some(report),
        Err(e) => result.error = Some(format!("{:#}", e)),
    }
    result
}
