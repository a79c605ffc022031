use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use samkit::config::Config;
use samkit::engine::PromptPoint;
use samkit::provider::{SegmentationProvider, SegmentationRequest};
use samkit::store::ModelStore;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Point-prompt SAM2 segmentation", long_about = None)]
struct Args {
    /// Input image (any format the image crate reads)
    #[arg(short, long)]
    image: PathBuf,

    /// Foreground prompt point as "x,y" (repeatable)
    #[arg(short = 'p', long = "point")]
    points: Vec<String>,

    /// Background prompt point as "x,y" (repeatable)
    #[arg(short = 'n', long = "neg-point")]
    neg_points: Vec<String>,

    /// Output path for the selected mask
    #[arg(short, long, default_value = "mask.png")]
    output: PathBuf,

    /// Write every candidate mask as <output>.N.png
    #[arg(long)]
    all_candidates: bool,

    /// Force CPU execution
    #[arg(long)]
    cpu: bool,

    /// Override the model cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Print the result summary as JSON
    #[arg(long)]
    json: bool,
}

fn parse_point(s: &str) -> Result<(f32, f32)> {
    let (x, y) = s
        .split_once(',')
        .with_context(|| format!("point '{s}' is not in x,y form"))?;
    Ok((x.trim().parse()?, y.trim().parse()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "samkit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.points.is_empty() && args.neg_points.is_empty() {
        bail!("at least one --point or --neg-point is required");
    }

    let mut points = Vec::new();
    for p in &args.points {
        let (x, y) = parse_point(p)?;
        points.push(PromptPoint::foreground(x, y));
    }
    for p in &args.neg_points {
        let (x, y) = parse_point(p)?;
        points.push(PromptPoint::background(x, y));
    }

    let mut config = Config::from_env();
    if args.cpu {
        config.engine.prefer_cpu = true;
    }
    if let Some(dir) = args.cache_dir {
        config.models.cache_dir = dir;
    }

    let capabilities = samkit::probe_gpu().await;
    if !capabilities.available {
        info!(
            "no GPU available ({}), running on CPU",
            capabilities
                .unavailable_reason
                .as_deref()
                .unwrap_or("unknown")
        );
    } else if capabilities.is_low_vram {
        warn!(
            "GPU reports only ~{} MiB of estimated VRAM; expect slow encodes",
            capabilities.estimated_vram_bytes / (1024 * 1024)
        );
    }

    let image = image::open(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    info!("loaded {} ({}x{})", args.image.display(), width, height);

    let store = ModelStore::open(&config.models).await?;
    let provider = SegmentationProvider::new(Arc::new(store), config.engine);
    provider.set_progress_handler(Arc::new(|progress| {
        let percent = if progress.total > 0 {
            progress.loaded * 100 / progress.total
        } else {
            0
        };
        info!(
            "loading models: {}% ({:?})",
            percent.min(100),
            progress.stage
        );
    }));

    let backend = provider.initialize().await?;
    info!("engine ready on {} backend", backend);

    provider.start_new_session().await;
    let output = provider
        .segment_single_view(SegmentationRequest {
            rgba: image.into_raw(),
            width,
            height,
            points,
            threshold: None,
        })
        .await?;

    if args.json {
        let summary = serde_json::json!({
            "width": output.width,
            "height": output.height,
            "selected_mask_index": output.selected_mask_index,
            "candidates": output
                .all_masks
                .iter()
                .map(|c| serde_json::json!({ "index": c.index, "iou_score": c.iou_score }))
                .collect::<Vec<_>>(),
            "encode_ms": output.timing.encode_ms,
            "decode_ms": output.timing.decode_ms,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for candidate in &output.all_masks {
            let marker = if candidate.index == output.selected_mask_index {
                " (selected)"
            } else {
                ""
            };
            println!(
                "candidate {}: IoU {:.3}{}",
                candidate.index, candidate.iou_score, marker
            );
        }
        println!(
            "encode {:.0} ms, decode {:.0} ms",
            output.timing.encode_ms, output.timing.decode_ms
        );
    }

    write_mask(&args.output, &output.mask, output.width, output.height)?;
    info!("wrote {}", args.output.display());

    if args.all_candidates {
        for candidate in &output.all_masks {
            let path = args.output.with_extension(format!("{}.png", candidate.index));
            write_mask(&path, &candidate.mask, candidate.width, candidate.height)?;
            info!("wrote {}", path.display());
        }
    }

    provider.dispose().await;
    Ok(())
}

fn write_mask(path: &std::path::Path, mask: &[u8], width: u32, height: u32) -> Result<()> {
    let gray = image::GrayImage::from_raw(width, height, mask.to_vec())
        .context("mask buffer does not match its dimensions")?;
    gray.save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("320,180").unwrap(), (320.0, 180.0));
        assert_eq!(parse_point(" 1.5 , 2.5 ").unwrap(), (1.5, 2.5));
        assert!(parse_point("nope").is_err());
        assert!(parse_point("1;2").is_err());
    }
}
