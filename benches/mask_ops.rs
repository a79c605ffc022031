//! Micro-benchmarks for the raster hot paths
//!
//! These isolate the CPU-intensive parts of a segmentation round:
//! - encoder preprocessing (resize + channel-first repack)
//! - binary mask upscaling (decode output -> image resolution)
//! - smooth mask upscaling (preview overlays)
//!
//! Run with: cargo bench --bench mask_ops

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use samkit::tensor::{
    candidate_mask_from_logits, preprocess_image, resize_mask_binary, resize_mask_smooth,
};

/// Generate an RGBA frame with smooth gradients and a blob in the middle
fn generate_frame(width: u32, height: u32) -> Vec<u8> {
    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    for y in 0..height {
        for x in 0..width {
            let dx = (x as f32 - cx) / cx;
            let dy = (y as f32 - cy) / cy;
            let blob = ((1.0 - (dx * dx + dy * dy)).max(0.0) * 255.0) as u8;
            rgba.push(blob);
            rgba.push((x * 255 / width.max(1)) as u8);
            rgba.push((y * 255 / height.max(1)) as u8);
            rgba.push(255);
        }
    }
    rgba
}

/// A 256x256 logits plane with a centered disc of positive scores
fn generate_logits() -> Vec<f32> {
    let mut logits = Vec::with_capacity(256 * 256);
    for y in 0..256 {
        for x in 0..256 {
            let dx = (x as f32 - 128.0) / 128.0;
            let dy = (y as f32 - 128.0) / 128.0;
            logits.push(1.0 - 2.0 * (dx * dx + dy * dy));
        }
    }
    logits
}

fn bench_preprocess(c: &mut Criterion) {
    let mut group = c.benchmark_group("preprocess_image");
    group.sample_size(10);

    for (width, height) in [(640u32, 360u32), (1280, 720), (1920, 1080)] {
        let frame = generate_frame(width, height);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{width}x{height}")),
            &frame,
            |b, frame| {
                b.iter(|| preprocess_image(black_box(frame), width, height).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_mask_resize(c: &mut Criterion) {
    let logits = generate_logits();
    let mask = candidate_mask_from_logits(&logits, 0.0);

    let mut group = c.benchmark_group("mask_resize");
    for (width, height) in [(640u32, 360u32), (1920, 1080)] {
        group.throughput(Throughput::Elements((width * height) as u64));
        group.bench_with_input(
            BenchmarkId::new("binary", format!("{width}x{height}")),
            &mask,
            |b, mask| {
                b.iter(|| resize_mask_binary(black_box(mask), 256, 256, width, height));
            },
        );
        group.bench_with_input(
            BenchmarkId::new("smooth", format!("{width}x{height}")),
            &mask,
            |b, mask| {
                b.iter(|| resize_mask_smooth(black_box(mask), 256, 256, width, height));
            },
        );
    }
    group.finish();
}

fn bench_thresholding(c: &mut Criterion) {
    let logits = generate_logits();
    c.bench_function("candidate_mask_from_logits", |b| {
        b.iter(|| candidate_mask_from_logits(black_box(&logits), 0.0));
    });
}

criterion_group!(benches, bench_preprocess, bench_mask_resize, bench_thresholding);
criterion_main!(benches);
