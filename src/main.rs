use std::time::Duration;

use anyhow::Result;
use nalgebra::Vector3;
use tracing_subscriber::EnvFilter;

use monoscan::config::PipelineConfig;
use monoscan::geometry::CameraIntrinsics;
use monoscan::system::SlamPipeline;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const FRAMES: usize = 60;
/// True camera translation per frame along world x.
const STEP: f64 = 0.02;
/// Half extent of a rendered square marker, in pixels.
const HALF: i64 = 6;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            println!("Loading config from: {path}");
            PipelineConfig::from_toml_path(&path)?
        }
        None => {
            let mut config = PipelineConfig::default();
            // Match the dead-reckoning step to the synthetic motion so the
            // reconstruction comes out at true scale.
            config.mapper.translation_step = STEP;
            config
        }
    };

    let scene = synthetic_scene();
    println!(
        "Synthetic sweep: {FRAMES} frames of {WIDTH}x{HEIGHT} over {} scene markers",
        scene.len()
    );

    let mut pipeline = SlamPipeline::new(config)?;

    let mut keyframes = 0usize;
    let mut degraded = 0usize;
    for i in 0..FRAMES {
        let frame = render_frame(&scene, STEP * i as f64);
        let timestamp = Duration::from_millis(33 * i as u64);
        let result = pipeline.process_gray(&frame, WIDTH, HEIGHT, timestamp)?;

        if result.keyframe_id.is_some() {
            keyframes += 1;
        }
        if result.status.is_degraded() {
            degraded += 1;
        }
        if i % 10 == 0 {
            let t = result.pose.translation;
            println!(
                "Frame {i:>3}: {:?}, pose=[{:.3}, {:.3}, {:.3}], features={}, inliers={}, {:.1}ms",
                result.status,
                t.x,
                t.y,
                t.z,
                result.metrics.n_features,
                result.metrics.n_inliers,
                result.timing.total_ms
            );
        }
    }

    let snapshot = pipeline.snapshot();
    println!(
        "Done: {keyframes} keyframes ({} in map), {} map points, {} cloud points, {degraded} degraded frames",
        pipeline.num_keyframes(),
        pipeline.num_map_points(),
        snapshot.count
    );
    println!(
        "Trajectory: traveled {:.3} (ground truth {:.3})",
        pipeline.current_pose().translation.norm(),
        STEP * (FRAMES - 1) as f64
    );

    // Joins the refinement worker.
    pipeline.shutdown();

    Ok(())
}

/// A lattice of wall markers ahead of the sweep, wide enough that a good
/// share stays in view across the whole camera path.
fn synthetic_scene() -> Vec<Vector3<f64>> {
    let mut points = Vec::new();
    for row in 0..3 {
        for col in 0..9 {
            let x = -1.0 + 0.4 * col as f64;
            let y = -0.7 + 0.7 * row as f64;
            let z = 2.5 + 0.11 * ((col + row * 3) % 10) as f64;
            points.push(Vector3::new(x, y, z));
        }
    }
    points
}

/// Render the markers as bright squares seen from a camera at `cam_x` on
/// the world x axis. Each square gives the detector 4 corners.
fn render_frame(scene: &[Vector3<f64>], cam_x: f64) -> Vec<u8> {
    let camera = CameraIntrinsics::default();
    let mut pixels = vec![40u8; (WIDTH * HEIGHT) as usize];
    for p in scene {
        let local = Vector3::new(p.x - cam_x, p.y, p.z);
        let Some(px) = camera.project(&local) else {
            continue;
        };
        let (cu, cv) = (px.x.round() as i64, px.y.round() as i64);
        for dy in -HALF..HALF {
            for dx in -HALF..HALF {
                let (x, y) = (cu + dx, cv + dy);
                if x >= 0 && x < WIDTH as i64 && y >= 0 && y < HEIGHT as i64 {
                    pixels[(y * WIDTH as i64 + x) as usize] = 230;
                }
            }
        }
    }
    pixels
}
