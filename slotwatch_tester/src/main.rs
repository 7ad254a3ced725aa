// THEORY:
// `slotwatch_tester` replays a directory of frames against a grid declaration,
// writes the annotated frames and logs every committed state change.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{info, warn};
use slotwatch::codec::{decode_frame, encode_jpeg};
use slotwatch::{GridConfig, ManualClock, ServiceContext, SessionConfig, TimingConfig};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SESSION_ID: &str = "replay";
const FRAME_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Grid declaration (JSON).
    #[arg(long)]
    grid: PathBuf,
    /// Directory of frames, replayed in file-name order.
    #[arg(long)]
    frames: PathBuf,
    /// Output directory for annotated frames and the event log.
    #[arg(long, default_value = "slotwatch_out")]
    out: PathBuf,
    /// Empty-lot reference frame. Defaults to the first replayed frame.
    #[arg(long)]
    reference: Option<PathBuf>,
    /// Timing preset: `strict` or `responsive`.
    #[arg(long, default_value = "strict")]
    preset: String,
    /// Replay rate used to timestamp frames.
    #[arg(long, default_value_t = 2.0)]
    fps: f64,
    /// Request object labels (every fifth frame).
    #[arg(long)]
    use_ai: bool,
    /// JPEG quality of the annotated output.
    #[arg(long, default_value_t = 85)]
    quality: u8,
}

fn load_session_config(grid_path: &Path, preset: &str) -> Result<SessionConfig> {
    let json = fs::read_to_string(grid_path)
        .with_context(|| format!("read grid {}", grid_path.display()))?;
    let grid = GridConfig::from_json(&json).context("parse grid")?;
    let timing =
        TimingConfig::preset(preset).ok_or_else(|| anyhow!("unknown preset `{}`", preset))?;
    Ok(SessionConfig {
        timing,
        ..SessionConfig::with_grid(grid)
    })
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read frames dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    frames.sort();
    Ok(frames)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.fps <= 0.0 {
        return Err(anyhow!("fps must be positive"));
    }

    let config = load_session_config(&args.grid, &args.preset)?;
    let frames = list_frames(&args.frames)?;
    if frames.is_empty() {
        return Err(anyhow!("no frames in {}", args.frames.display()));
    }
    fs::create_dir_all(&args.out)?;

    let clock = Arc::new(ManualClock::new(0.0));
    let service = ServiceContext::new(clock.clone());
    let slots = service.start(SESSION_ID, config).await?;
    info!("replaying {} frames over {} slots", frames.len(), slots);

    if let Some(path) = &args.reference {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        service
            .set_reference(SESSION_ID, decode_frame(&bytes)?)
            .await?;
    }

    let mut events_log = BufWriter::new(File::create(args.out.join("events.jsonl"))?);
    let mut last_summary = None;
    for (index, path) in frames.iter().enumerate() {
        clock.set(index as f64 / args.fps);
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let frame = match decode_frame(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: {}", path.display(), e);
                continue;
            }
        };
        let report = service.process(SESSION_ID, frame, args.use_ai).await?;
        for event in &report.events {
            info!(
                "frame {}: slot {} {:?} -> {:?}",
                report.frame_count, event.slot_number, event.old_status, event.new_status
            );
            serde_json::to_writer(&mut events_log, event)?;
            events_log.write_all(b"\n")?;
        }
        if let Some(annotated) = &report.annotated {
            let name = format!("frame_{:05}.jpg", index);
            fs::write(args.out.join(name), encode_jpeg(annotated, args.quality)?)?;
        }
        last_summary = Some(report.summary);
    }
    events_log.flush()?;

    if let Some(summary) = last_summary {
        info!(
            "final: {} occupied, {} vacant of {}",
            summary.occupied, summary.vacant, summary.total
        );
    }
    service.shutdown().await;
    info!("output saved to {}", args.out.display());
    Ok(())
}
