//! Rendering of benchmark results.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use bytesize::ByteSize;
use uploadbench_engine::aggregate::BenchmarkReport;
use uploadbench_engine::config::AveragingMode;
use yansi::Paint;

/// Prints a human readable summary of the report to stdout.
pub fn print_report(report: &BenchmarkReport) {
    let total = ByteSize::b(report.block_size.as_u64() * report.uploads_succeeded as u64);

    print!(
        "{} ({} uploads of {}",
        "UPLOAD:".bold().green(),
        report.uploads_succeeded.bold(),
        report.block_size
    );
    if report.uploads_failed > 0 {
        print!(
            ", {}",
            format!("{} FAILURES", report.uploads_failed).bold().red()
        );
    }
    println!(")");
    println!(
        "  {} workers; {} in {:.2?}",
        report.workers,
        total.bold(),
        report.wall_clock
    );

    let (headline, alternative, alternative_name) = match report.averaging {
        AveragingMode::WallClock => (
            report.average_wall_clock,
            report.average_worker_time,
            "worker time",
        ),
        AveragingMode::WorkerTime => (
            report.average_worker_time,
            report.average_wall_clock,
            "wall clock",
        ),
    };
    println!("  average: {}", headline.bold());
    println!("  average ({alternative_name}): {}", alternative);

    if report.samples.is_empty() {
        println!("  peak: {}", "no network samples".dim());
    } else {
        println!(
            "  peak: {}; sampled average: {} ({} samples)",
            report.peak.bold(),
            report.sampled_average,
            report.samples.len()
        );
    }

    if let Some(latency) = &report.latency {
        println!(
            "  latency avg: {:.2?}; p50: {:.2?}; p90: {:.2?}; p99: {:.2?}",
            latency.avg.bold(),
            latency.p50,
            latency.p90,
            latency.p99
        );
    }

    if !report.is_comparable() {
        println!(
            "{}",
            "some uploads failed, the result is not comparable to other runs"
                .bold()
                .yellow()
        );
    }
}

/// Writes the report as pretty printed JSON.
pub fn write_json(path: &Path, report: &BenchmarkReport) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    writer.flush()
}
