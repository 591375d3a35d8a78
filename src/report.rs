use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::bitstream::StreamEnd;
use crate::cut::ScanResult;

/// One scanned file, as printed and exported.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRow {
    pub filename: String,
    #[serde(flatten)]
    pub result: ScanResult,
    pub total_samples: i64,
}

impl ScanRow {
    pub fn new(filename: String, result: ScanResult) -> Self {
        let total_samples = result.total_samples();
        Self {
            filename,
            result,
            total_samples,
        }
    }
}

pub fn format_duration(secs: f64) -> String {
    let millis = (secs * 1000.0).round() as u64;
    format!(
        "{}:{:02}.{:03}",
        millis / 60_000,
        millis / 1000 % 60,
        millis % 1000
    )
}

pub fn describe_stream_end(end: &StreamEnd) -> String {
    match end {
        StreamEnd::EndOfStream => "ok".to_string(),
        StreamEnd::TruncatedPayload { offset, .. } => format!("truncated frame @{}", offset),
        StreamEnd::FrameExceedsStream { offset, .. } => format!("frame past end @{}", offset),
        StreamEnd::InconsistentStream { offset } => format!("inconsistent @{}", offset),
    }
}

pub fn generate_csv(rows: &[ScanRow], output_dir: &Path) -> Result<PathBuf> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let filename = format!("mp3crop_report_{}.csv", timestamp);
    let output_path = output_dir.join(&filename);

    let mut writer = csv::Writer::from_path(&output_path)
        .context("Failed to create CSV file")?;

    // Write header
    writer
        .write_record([
            "Filename",
            "Format",
            "Sample Rate",
            "Channel Mode",
            "Frames",
            "Samples",
            "Duration",
            "Avg kbps",
            "VBR",
            "Delay",
            "Padding",
            "Encoder",
            "Start Sample",
            "Junk Bytes",
            "Reservoir Violations",
            "Stream End",
        ])
        .context("Failed to write CSV header")?;

    // Write data
    for row in rows {
        let r = &row.result;
        writer
            .write_record([
                &row.filename,
                &format!("MPEG {} layer {}", r.version, r.layer),
                &r.sample_rate.to_string(),
                &r.channel_mode.to_string(),
                &r.frame_count.to_string(),
                &row.total_samples.to_string(),
                &format_duration(r.duration_secs()),
                &format!("{:.1}", r.avg_bitrate_kbps),
                &r.is_vbr.to_string(),
                &r.enc_delay.to_string(),
                &r.enc_padding.to_string(),
                r.encoder.as_deref().unwrap_or(""),
                &r.start_sample.map(|s| s.to_string()).unwrap_or_default(),
                &r.junk_bytes.to_string(),
                &r.reservoir_violations.to_string(),
                &describe_stream_end(&r.stream_end),
            ])
            .context("Failed to write CSV record")?;
    }

    writer.flush().context("Failed to flush CSV")?;

    Ok(output_path)
}

pub fn print_json(rows: &[ScanRow]) -> Result<()> {
    let json = serde_json::to_string_pretty(rows).context("Failed to serialize scan results")?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(rows: &[ScanRow]) {
    use console::Style;

    let header_style = Style::new().bold().cyan();
    let value_style = Style::new().green();
    let warn_style = Style::new().yellow();
    let dim_style = Style::new().dim();

    // Calculate column widths
    let filename_width = rows
        .iter()
        .map(|r| r.filename.chars().count())
        .max()
        .unwrap_or(8)
        .max(8);

    // Print header
    println!();
    println!(
        "{} {:>10} {:>9} {:>5} {:>6} {:>8} {:>10}",
        header_style.apply_to(format!("{:<width$}", "Filename", width = filename_width)),
        header_style.apply_to("Duration"),
        header_style.apply_to("kbps"),
        header_style.apply_to("Mode"),
        header_style.apply_to("Delay"),
        header_style.apply_to("Padding"),
        header_style.apply_to("Stream"),
    );
    println!("{}", "─".repeat(filename_width + 10 + 9 + 5 + 6 + 8 + 10 + 6));

    // Print rows
    for row in rows {
        let r = &row.result;
        let mode = if r.is_vbr { "VBR" } else { "CBR" };
        let stream = describe_stream_end(&r.stream_end);
        let stream = if r.stream_end == StreamEnd::EndOfStream && r.reservoir_violations == 0 {
            value_style.apply_to(stream)
        } else {
            warn_style.apply_to(stream)
        };
        let delay = if r.has_lame_tag {
            value_style.apply_to(r.enc_delay.to_string())
        } else {
            dim_style.apply_to(r.enc_delay.to_string())
        };

        println!(
            "{:<width$} {:>10} {:>9.1} {:>5} {:>6} {:>8} {:>10}",
            row.filename,
            format_duration(r.duration_secs()),
            r.avg_bitrate_kbps,
            mode,
            delay,
            r.enc_padding,
            stream,
            width = filename_width,
        );
    }
    println!();
}
