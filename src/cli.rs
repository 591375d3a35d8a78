use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use console::{style, Style};
use dialoguer::{theme::ColorfulTheme, Confirm};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cut::ScanOptions;
use crate::processor::{self, Naming, SourceFile};
use crate::report::{self, ScanRow};
use crate::scanner;
use crate::track::{self, CueSheet, DEFAULT_NAMING_SCHEME};

#[derive(Parser, Debug)]
#[command(name = "mp3crop", version, about = "Sample-accurate lossless MP3 cutter")]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print stream information for MP3 files
    Scan(ScanArgs),
    /// Cut tracks out of an MP3 file
    Crop(CropArgs),
}

#[derive(Args, Debug, Clone, Copy)]
struct DefaultsArgs {
    /// Encoder delay assumed for streams without a LAME tag
    #[arg(long, default_value_t = 576)]
    default_delay: u16,

    /// Encoder padding assumed for streams without a LAME tag
    #[arg(long, default_value_t = 1152)]
    default_padding: u16,
}

impl DefaultsArgs {
    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            default_delay: self.default_delay,
            default_padding: self.default_padding,
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Files, directories or glob patterns
    #[arg(default_value = ".")]
    paths: Vec<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Save a CSV report in the current directory
    #[arg(long)]
    report: bool,

    #[command(flatten)]
    defaults: DefaultsArgs,
}

#[derive(Args, Debug)]
struct CropArgs {
    /// Source MP3 (defaults to the FILE entry of the CUE sheet)
    source: Option<PathBuf>,

    /// Track list: <track>:<start>-<end>[,...], positions in samples or [XXm]YY[.ZZ]s
    #[arg(short, long, conflicts_with = "cue")]
    crop: Option<String>,

    /// Split along a CUE sheet
    #[arg(long)]
    cue: Option<PathBuf>,

    /// Output naming scheme: %s source, %n track, %t title, %p performer, %a album
    #[arg(short, long, default_value = DEFAULT_NAMING_SCHEME)]
    out: String,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    dir: String,

    /// Album name used for naming
    #[arg(long)]
    album: Option<String>,

    /// Performer used for every track
    #[arg(long)]
    artist: Option<String>,

    /// Overwrite existing files without asking
    #[arg(short, long)]
    yes: bool,

    #[command(flatten)]
    defaults: DefaultsArgs,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Scan(args) => run_scan(&args),
        Command::Crop(args) => run_crop(&args),
    }
}

fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    } else if verbose {
        builder.filter_level(LevelFilter::Debug);
    } else {
        builder.filter_level(LevelFilter::Warn);
    }
    builder.init();
}

fn run_scan(args: &ScanArgs) -> Result<()> {
    if !args.json {
        print_banner();
    }

    let files = scanner::collect_inputs(&args.paths)?;
    if files.is_empty() {
        println!("\n{} No MP3 files found", style("⚠").yellow());
        println!(
            "  Supported formats: {}",
            scanner::get_supported_extensions().join(", ")
        );
        return Ok(());
    }

    if !args.json {
        println!(
            "{} Found {} MP3 files",
            style("✓").green(),
            style(files.len()).cyan()
        );
    }

    let sources = scan_files(&files, &args.defaults.scan_options())?;
    let rows: Vec<ScanRow> = sources
        .iter()
        .map(|s| ScanRow::new(s.filename(), s.scanned.result().clone()))
        .collect();

    if args.json {
        report::print_json(&rows)?;
    } else {
        report::print_table(&rows);
    }

    if args.report && !rows.is_empty() {
        let target_dir = std::env::current_dir().context("Failed to get current directory")?;
        let csv_path = report::generate_csv(&rows, &target_dir)?;
        println!(
            "{} Report saved: {}",
            style("✓").green(),
            csv_path.display()
        );
    }

    Ok(())
}

fn run_crop(args: &CropArgs) -> Result<()> {
    print_banner();

    let cue = args.cue.as_deref().map(read_cue).transpose()?;
    let source_path = match (&args.source, &cue) {
        (Some(path), _) => path.clone(),
        (None, Some((cue_path, sheet))) => cue_source(cue_path, sheet)?,
        (None, None) => bail!("No source file given"),
    };

    println!(
        "{} Source: {}",
        style("▸").cyan(),
        style(source_path.display()).bold()
    );
    let source = processor::scan_file(&source_path, &args.defaults.scan_options())?;
    print_source_summary(&source);

    let info = source.scanned.result();
    let mut naming = Naming {
        scheme: args.out.clone(),
        album: args.album.clone(),
        performer: args.artist.clone(),
    };
    let mut tracks = match (&args.crop, cue) {
        (Some(list), _) => track::parse_crop_list(list, info.sample_rate)?,
        (None, Some((_, sheet))) => {
            naming.album = naming.album.take().or_else(|| sheet.album.clone());
            naming.performer = naming.performer.take().or_else(|| sheet.performer.clone());
            sheet.into_tracks(source.scanned.total_samples())?
        }
        (None, None) => {
            report::print_table(&[ScanRow::new(source.filename(), info.clone())]);
            println!(
                "{} Nothing to cut. Pass --crop or --cue to extract tracks.",
                style("ℹ").blue()
            );
            return Ok(());
        }
    };
    if args.artist.is_some() {
        for track in &mut tracks {
            track.performer = None;
        }
    }

    let out_dir = processor::ensure_output_dir(&args.dir)?;
    let planned = processor::plan_tracks(&source, tracks, &naming, &out_dir)?;

    let existing = planned.iter().filter(|p| p.path.exists()).count();
    if existing > 0
        && !args.yes
        && !Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Overwrite {} existing files?", existing))
            .default(false)
            .interact()?
    {
        println!("Done. No files were written.");
        return Ok(());
    }

    let pb = ProgressBar::new(planned.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Cutting... [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("█▓░"),
    );

    let mut written = 0;
    let mut degraded = 0;
    let mut silenced = 0;
    for plan in &planned {
        let result = processor::process_track(&source, plan);
        if let Some(err) = &result.error {
            pb.println(format!(
                "{} Track {}: {}",
                style("⚠").yellow(),
                result.track,
                err
            ));
        }
        if let Some(report) = &result.report {
            written += 1;
            silenced += report.silenced_frames;
            if let Some(reason) = report.degradation() {
                degraded += 1;
                pb.println(format!(
                    "{} Track {}: {}",
                    style("⚠").yellow(),
                    result.track,
                    reason
                ));
            }
            log::debug!(
                "track {} -> {}: {} samples, frames {}..{}, delay {}, padding {}, {} bytes",
                result.track,
                result.path.display(),
                report.sample_count(),
                report.first_frame,
                report.last_frame,
                report.enc_delay,
                report.enc_padding,
                report.bytes_written
            );
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!(
        "\n{} Done! {} of {} tracks written to {}",
        style("✓").green().bold(),
        written,
        planned.len(),
        out_dir.display()
    );
    if degraded > 0 {
        println!(
            "  {} {} tracks start with an incomplete bit reservoir ({} frames silenced)",
            style("ℹ").dim(),
            degraded,
            silenced
        );
    }

    if written < planned.len() {
        bail!("{} tracks failed", planned.len() - written);
    }
    Ok(())
}

fn read_cue(path: &Path) -> Result<(PathBuf, CueSheet)> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read CUE sheet {}", path.display()))?;
    let sheet = CueSheet::parse(&text)
        .with_context(|| format!("Failed to parse CUE sheet {}", path.display()))?;
    Ok((path.to_path_buf(), sheet))
}

/// The sheet's FILE entry, next to the sheet, with an .mp3 extension.
fn cue_source(cue_path: &Path, sheet: &CueSheet) -> Result<PathBuf> {
    let Some(file) = &sheet.file else {
        bail!("CUE sheet has no FILE entry; pass the source file explicitly");
    };
    let dir = cue_path.parent().unwrap_or_else(|| Path::new(""));
    Ok(dir.join(file).with_extension("mp3"))
}

fn print_source_summary(source: &SourceFile) {
    let info = source.scanned.result();
    println!(
        "  {} MPEG {} layer {}, {} Hz, {}, {:.1} kbps {}",
        style("•").dim(),
        info.version,
        info.layer,
        info.sample_rate,
        info.channel_mode,
        info.avg_bitrate_kbps,
        if info.is_vbr { "VBR" } else { "CBR" }
    );
    println!(
        "  {} {} frames, {} samples ({}), delay {}, padding {}",
        style("•").dim(),
        info.frame_count,
        info.total_samples(),
        report::format_duration(info.duration_secs()),
        info.enc_delay,
        info.enc_padding
    );
    if let Some(tag) = &source.id3v1 {
        println!(
            "  {} ID3v1: {} - {} ({})",
            style("•").dim(),
            tag.artist,
            tag.title,
            tag.album
        );
    }
    if !info.has_lame_tag {
        println!(
            "  {} No LAME tag, assuming default delay and padding",
            style("ℹ").dim()
        );
    }
    if let Some(start) = info.start_sample {
        println!(
            "  {} Cut earlier from sample {} of its source",
            style("ℹ").dim(),
            start
        );
    }
    if info.reservoir_violations > 0 {
        println!(
            "  {} {} frames reference missing reservoir data",
            style("⚠").yellow(),
            info.reservoir_violations
        );
    }
}

fn print_banner() {
    let banner_style = Style::new().cyan().bold();
    let version = format!("mp3crop v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("{}", banner_style.apply_to("╭─────────────────────────────────────╮"));
    println!("{}", banner_style.apply_to(format!("│{:^37}│", version)));
    println!("{}", banner_style.apply_to("│    Sample-accurate MP3 Cutting      │"));
    println!("{}", banner_style.apply_to("╰─────────────────────────────────────╯"));
    println!();
}

fn scan_files(files: &[PathBuf], options: &ScanOptions) -> Result<Vec<SourceFile>> {
    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Scanning... [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("█▓░"),
    );

    // Parallel scan using rayon; collect keeps the input order
    let results: Vec<(&PathBuf, Result<SourceFile>)> = files
        .par_iter()
        .map(|file| {
            let result = processor::scan_file(file, options);
            pb.inc(1);
            (file, result)
        })
        .collect();

    pb.finish_and_clear();

    let mut sources = Vec::with_capacity(results.len());
    for (file, result) in results {
        match result {
            Ok(source) => sources.push(source),
            Err(e) => eprintln!(
                "{} Failed to scan {}: {:#}",
                style("⚠").yellow(),
                file.display(),
                e
            ),
        }
    }
    Ok(sources)
}
