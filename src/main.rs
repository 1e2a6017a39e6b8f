use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use behavior_trigger::*;
use clap::Parser;
use serde::Serialize;

/// Replays recorded pose frames through a behavior trigger.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Trigger configuration (YAML).
    #[arg(short, long)]
    config: PathBuf,

    /// Skeleton frames, one JSON object per line. `-` reads stdin.
    #[arg(short, long, default_value = "-")]
    frames: String,

    /// Pace frames at this rate instead of replaying as fast as possible.
    #[arg(long)]
    fps: Option<f32>,
}

#[derive(Serialize)]
struct Line<'a> {
    frame: u64,
    result: bool,
    status: &'a str,
    stale: bool,
    feature_id: Option<FeatureId>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    let mut trigger = TriggerEvaluator::from_config(&config)
        .with_context(|| format!("building trigger from {}", args.config.display()))?;

    let input: Box<dyn BufRead> = if args.frames == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let f = File::open(&args.frames).with_context(|| format!("opening {}", args.frames))?;
        Box::new(BufReader::new(f))
    };
    let period = args
        .fps
        .filter(|fps| *fps > 0.0)
        .map(|fps| Duration::from_secs_f32(1.0 / fps));

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut count = 0u64;
    for (lineno, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: SkeletonFrame = serde_json::from_str(&line)
            .with_context(|| format!("frame on line {}", lineno + 1))?;

        let started = Instant::now();
        let response = trigger.evaluate(&frame);
        count += 1;

        serde_json::to_writer(
            &mut out,
            &Line {
                frame: count,
                result: response.result,
                status: &response.body.status,
                stale: response.body.stale,
                feature_id: response.body.feature_id,
            },
        )?;
        writeln!(out)?;

        if let Some(period) = period {
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }

    let stats = trigger.pool().stats();
    log::info!(
        "{count} frames: {} windows accepted, {} dropped, {} collected, {} lost, {} restarts",
        stats.accepted,
        stats.dropped,
        stats.collected,
        stats.lost,
        stats.restarts
    );
    let truncated = trigger.accumulator().pose().truncated_frames();
    if truncated > 0 {
        log::warn!("{truncated} frames did not fit the configured pose width");
    }
    trigger.stop();
    Ok(())
}
