//! Track lists and output naming
//!
//! Tracks come either from a manual crop list (`t:s-e[,t:s-e...]`) or from a CUE
//! sheet. Positions are sample numbers; the crop list also accepts times written
//! as `[XXm]YY[.ZZ]s`.

use std::collections::HashSet;
use thiserror::Error;

/// CD frames per second in CUE `mm:ss:ff` positions.
const CUE_FRAMES_PER_SECOND: i64 = 75;
/// Samples per CD frame at 44.1 kHz.
const SAMPLES_PER_CUE_FRAME: i64 = 588;

const EVIL_CHARS: &[(char, char)] = &[
    ('?', ' '),
    ('*', ' '),
    ('"', '\''),
    (':', ' '),
    ('/', ' '),
    ('\\', ' '),
];

pub const DEFAULT_NAMING_SCHEME: &str = "%n. %p - %t";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackListError {
    #[error("malformed track entry '{0}', expected <track>:<start>-<end>")]
    Malformed(String),

    #[error("invalid position '{0}'")]
    InvalidPosition(String),

    #[error("invalid CUE index '{0}'")]
    InvalidIndex(String),

    #[error("CUE sheet has no tracks")]
    NoTracks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub number: u32,
    /// First sample, inclusive.
    pub start: i64,
    /// Last sample, exclusive.
    pub end: i64,
    pub title: Option<String>,
    pub performer: Option<String>,
}

impl Track {
    fn new(number: u32, start: i64, end: i64) -> Self {
        Self {
            number,
            start,
            end,
            title: None,
            performer: None,
        }
    }
}

/// Parse a manual crop list. Duplicate track numbers move to the next free number.
pub fn parse_crop_list(list: &str, sample_rate: u32) -> Result<Vec<Track>, TrackListError> {
    let mut used = HashSet::new();
    let mut tracks = Vec::new();

    for entry in list.split(',').filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry
            .split(|c| c == ':' || c == '-')
            .filter(|p| !p.is_empty())
            .collect();
        let [number, start, end] = parts.as_slice() else {
            return Err(TrackListError::Malformed(entry.to_string()));
        };

        let mut number: u32 = number
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|n| u32::try_from(n.unsigned_abs()).ok())
            .ok_or_else(|| TrackListError::Malformed(entry.to_string()))?;
        while !used.insert(number) {
            number += 1;
        }

        tracks.push(Track::new(
            number,
            parse_position(start, sample_rate)?,
            parse_position(end, sample_rate)?,
        ));
    }
    Ok(tracks)
}

/// A sample number, or a time like `3m10s`, `88.23s` or `1m` converted at `sample_rate`.
pub fn parse_position(token: &str, sample_rate: u32) -> Result<i64, TrackListError> {
    let token = token.trim().to_lowercase();
    let invalid = || TrackListError::InvalidPosition(token.clone());

    if !token.contains('s') && !token.contains('m') {
        return token
            .parse::<i64>()
            .map(i64::abs)
            .map_err(|_| invalid());
    }

    let rest = token.strip_suffix('s').unwrap_or(&token);
    let (minutes, seconds) = match rest.split_once('m') {
        Some((m, s)) => (m, s),
        None => ("", rest),
    };
    let minutes: f64 = if minutes.is_empty() {
        0.0
    } else {
        minutes.parse::<u32>().map_err(|_| invalid())?.into()
    };
    let seconds: f64 = if seconds.is_empty() {
        0.0
    } else {
        seconds.parse().map_err(|_| invalid())?
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(invalid());
    }
    Ok(((minutes * 60.0 + seconds) * f64::from(sample_rate)).round() as i64)
}

/// Parsed CUE sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CueSheet {
    /// First `FILE` entry.
    pub file: Option<String>,
    pub album: Option<String>,
    pub performer: Option<String>,
    /// Tracks in sheet order. Each ends where the next one starts; the last is open.
    pub tracks: Vec<Track>,
}

impl CueSheet {
    pub fn parse(text: &str) -> Result<Self, TrackListError> {
        let mut sheet = CueSheet::default();
        let mut current: Option<u32> = None;
        let mut title: Option<String> = None;
        let mut performer: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            let Some((keyword, rest)) = split_keyword(line) else {
                continue;
            };
            match keyword.to_lowercase().as_str() {
                "file" => {
                    if sheet.file.is_none() {
                        // FILE "name with spaces.mp3" MP3
                        let name = match rest.rsplit_once(char::is_whitespace) {
                            Some((name, _kind)) => name,
                            None => rest,
                        };
                        sheet.file = Some(unquote(name.trim()).to_string());
                    }
                }
                "performer" | "title" => {
                    let value = unquote(&collapse_spaces(rest)).to_string();
                    let is_title = keyword.eq_ignore_ascii_case("title");
                    match (current, is_title) {
                        (None, true) => sheet.album = Some(value),
                        (None, false) => sheet.performer = Some(value),
                        (Some(_), true) => title = Some(value),
                        (Some(_), false) => performer = Some(value),
                    }
                }
                "track" => {
                    let number = rest.split_whitespace().next().unwrap_or("");
                    let number = number
                        .parse::<u32>()
                        .map_err(|_| TrackListError::Malformed(line.to_string()))?;
                    current = Some(number);
                    title = None;
                    performer = None;
                }
                "index" => {
                    let mut fields = rest.split_whitespace();
                    let (Some(index), Some(position)) = (fields.next(), fields.next()) else {
                        return Err(TrackListError::InvalidIndex(line.to_string()));
                    };
                    if index.parse::<u32>().ok() != Some(1) {
                        continue;
                    }
                    let sector = msf_to_sector(position)
                        .ok_or_else(|| TrackListError::InvalidIndex(position.to_string()))?;
                    let number = current.unwrap_or(sheet.tracks.len() as u32 + 1);
                    sheet
                        .tracks
                        .push(Track::new(number, sector * SAMPLES_PER_CUE_FRAME, i64::MAX));
                }
                _ => {}
            }
            // titles and performers may follow the INDEX line
            if let (Some(number), Some(track)) = (current, sheet.tracks.last_mut()) {
                if track.number == number {
                    if title.is_some() {
                        track.title = title.clone();
                    }
                    if performer.is_some() {
                        track.performer = performer.clone();
                    }
                }
            }
        }

        for i in 1..sheet.tracks.len() {
            sheet.tracks[i - 1].end = sheet.tracks[i].start;
        }
        Ok(sheet)
    }

    /// Tracks covering the whole stream: the first starts at 0, the last ends at `total_samples`.
    pub fn into_tracks(self, total_samples: i64) -> Result<Vec<Track>, TrackListError> {
        let mut tracks = self.tracks;
        if tracks.is_empty() {
            return Err(TrackListError::NoTracks);
        }
        tracks[0].start = 0;
        let last = tracks.len() - 1;
        tracks[last].end = total_samples;
        Ok(tracks)
    }
}

fn split_keyword(line: &str) -> Option<(&str, &str)> {
    if line.is_empty() {
        return None;
    }
    Some(match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (line, ""),
    })
}

fn unquote(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn collapse_spaces(s: &str) -> String {
    s.split(' ').filter(|t| !t.is_empty()).collect::<Vec<_>>().join(" ")
}

/// `mm:ss:ff` to CD frames.
pub fn msf_to_sector(time: &str) -> Option<i64> {
    let mut parts = time.trim().splitn(3, ':');
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    let frames: i64 = parts.next()?.parse().ok()?;
    Some(frames + CUE_FRAMES_PER_SECOND * (seconds + 60 * minutes))
}

/// Values substituted into a naming scheme.
#[derive(Debug, Clone, Copy)]
pub struct NameFields<'a> {
    pub source: &'a str,
    pub number: u32,
    pub title: &'a str,
    pub performer: &'a str,
    pub album: &'a str,
}

/// Expand `%s`, `%n`, `%t`, `%p`, `%a` and `%%`. Unknown escapes are dropped.
pub fn eval_scheme(scheme: &str, fields: &NameFields<'_>) -> String {
    let mut out = String::with_capacity(scheme.len() + 32);
    let mut chars = scheme.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push_str(fields.source),
            Some('n') => out.push_str(&leading_zero(fields.number)),
            Some('t') => out.push_str(fields.title),
            Some('p') => out.push_str(fields.performer),
            Some('a') => out.push_str(fields.album),
            Some('%') => out.push('%'),
            _ => {}
        }
    }
    out
}

pub fn leading_zero(number: u32) -> String {
    format!("{:02}", number)
}

/// Replace characters most file systems reject and collapse runs of spaces.
pub fn replace_evil_chars(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            EVIL_CHARS
                .iter()
                .find(|(evil, _)| *evil == c)
                .map_or(c, |(_, with)| *with)
        })
        .collect();
    collapse_spaces(&replaced)
}

/// File name for one track, extension included.
pub fn output_file_name(scheme: &str, fields: &NameFields<'_>) -> String {
    format!("{}.mp3", replace_evil_chars(&eval_scheme(scheme, fields)))
}

/// Whether the scheme yields distinct names for different tracks.
pub fn scheme_distinguishes_tracks(scheme: &str) -> bool {
    scheme.contains("%n") || scheme.contains("%t")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crop_list() {
        let tracks = parse_crop_list("1:0-8000,2:88.23s-3m10s", 44100).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!((tracks[0].number, tracks[0].start, tracks[0].end), (1, 0, 8000));
        assert_eq!(tracks[1].number, 2);
        assert_eq!(tracks[1].start, 3_890_943);
        assert_eq!(tracks[1].end, 190 * 44100);
    }

    #[test]
    fn test_duplicate_track_numbers_bumped() {
        let tracks = parse_crop_list("3:0-10,3:10-20,4:20-30", 44100).unwrap();
        let numbers: Vec<u32> = tracks.iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![3, 4, 5]);
    }

    #[test]
    fn test_malformed_crop_list() {
        assert_eq!(
            parse_crop_list("1:0", 44100),
            Err(TrackListError::Malformed("1:0".to_string()))
        );
        assert!(matches!(
            parse_crop_list("x:0-10", 44100),
            Err(TrackListError::Malformed(_))
        ));
        assert!(matches!(
            parse_crop_list("1:0-1.5.2s", 44100),
            Err(TrackListError::InvalidPosition(_))
        ));
    }

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("1234", 44100), Ok(1234));
        assert_eq!(parse_position("1s", 48000), Ok(48000));
        assert_eq!(parse_position("2m", 32000), Ok(120 * 32000));
        assert_eq!(parse_position("1m0.5s", 44100), Ok(60 * 44100 + 22050));
        assert_eq!(parse_position("0.00001s", 44100), Ok(0));
    }

    const CUE: &str = r#"
PERFORMER "Some Band"
TITLE "Live   Album"
FILE "live set.mp3" MP3
  TRACK 01 AUDIO
    TITLE "Opening"
    INDEX 00 00:00:00
    INDEX 01 00:00:32
  TRACK 02 AUDIO
    INDEX 01 03:10:15
    TITLE "Second: Part"
    PERFORMER "Guest"
  TRACK 03 AUDIO
    TITLE "Encore"
    INDEX 01 07:00:00
"#;

    #[test]
    fn test_parse_cue() {
        let sheet = CueSheet::parse(CUE).unwrap();
        assert_eq!(sheet.file.as_deref(), Some("live set.mp3"));
        assert_eq!(sheet.album.as_deref(), Some("Live Album"));
        assert_eq!(sheet.performer.as_deref(), Some("Some Band"));
        assert_eq!(sheet.tracks.len(), 3);

        let second_start = (15 + 75 * 190) * 588;
        assert_eq!(sheet.tracks[0].start, 32 * 588);
        assert_eq!(sheet.tracks[0].end, second_start);
        assert_eq!(sheet.tracks[0].title.as_deref(), Some("Opening"));
        assert_eq!(sheet.tracks[1].title.as_deref(), Some("Second: Part"));
        assert_eq!(sheet.tracks[1].performer.as_deref(), Some("Guest"));
        assert_eq!(sheet.tracks[2].number, 3);
        assert_eq!(sheet.tracks[2].title.as_deref(), Some("Encore"));

        let tracks = sheet.into_tracks(20_000_000).unwrap();
        assert_eq!(tracks[0].start, 0);
        assert_eq!(tracks[2].end, 20_000_000);
    }

    #[test]
    fn test_cue_without_tracks() {
        let sheet = CueSheet::parse("FILE \"a.mp3\" MP3\n").unwrap();
        assert_eq!(sheet.into_tracks(100), Err(TrackListError::NoTracks));
        assert!(matches!(
            CueSheet::parse("TRACK 01 AUDIO\nINDEX 01 aa:00:00\n"),
            Err(TrackListError::InvalidIndex(_))
        ));
    }

    #[test]
    fn test_msf_to_sector() {
        assert_eq!(msf_to_sector("01:02:03"), Some(3 + 75 * 62));
        assert_eq!(msf_to_sector("01:02"), None);
    }

    #[test]
    fn test_eval_scheme() {
        let fields = NameFields {
            source: "big",
            number: 7,
            title: "Song",
            performer: "Band",
            album: "LP",
        };
        assert_eq!(eval_scheme(DEFAULT_NAMING_SCHEME, &fields), "07. Band - Song");
        assert_eq!(eval_scheme("%s-%a-100%%%x", &fields), "big-LP-100%");
        assert_eq!(leading_zero(123), "123");
    }

    #[test]
    fn test_output_file_name() {
        let fields = NameFields {
            source: "src",
            number: 2,
            title: "What? \"Now\": a/b",
            performer: "A*B",
            album: "",
        };
        assert_eq!(
            output_file_name(DEFAULT_NAMING_SCHEME, &fields),
            "02. A B - What 'Now' a b.mp3"
        );
        assert_eq!(replace_evil_chars("  a\\\\b  "), "a b");
    }

    #[test]
    fn test_scheme_distinguishes_tracks() {
        assert!(scheme_distinguishes_tracks("%n"));
        assert!(scheme_distinguishes_tracks("x %t"));
        assert!(!scheme_distinguishes_tracks("%s - %p"));
    }
}
