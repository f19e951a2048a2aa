//! Pipeline entry point and thread orchestration.
//!
//! `SlamPipeline` is the struct callers interact with. It owns the shared
//! map and cloud stores, runs detection, tracking, and keyframe mapping on
//! the calling thread, and spawns one background worker for window
//! refinement and cloud filtering.
//!
//! Frame processing takes `&self` so a capture thread can feed frames while
//! a render thread pulls snapshots. There is no frame queue: if a frame
//! arrives while the previous one is still being processed, it is dropped
//! and reported as such, which keeps latency bounded on slow machines.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cloud::{CloudAccumulator, CloudSnapshot};
use crate::config::PipelineConfig;
use crate::features::{FeatureDetector, FeatureMatcher, FeatureSet};
use crate::geometry::{CameraIntrinsics, SE3};
use crate::image::FramePixels;
use crate::mapping::{FrameInput, Mapper, MapperState, Refiner};
use crate::optimizer::BaConfig;
use crate::tracking::{PoseEstimator, RelativePose};

use super::messages::RefineTask;
use super::result::{FrameMetrics, FrameResult, FrameStatus, StageTimings};
use super::shared_state::SharedState;

/// Capacity of the refine-task channel. A full channel is fine: the worker
/// always refines the freshest window, so a skipped task costs nothing.
const REFINE_CHANNEL_CAPACITY: usize = 2;

/// Per-frame state owned by whichever thread currently processes a frame.
struct PipelineCore {
    detector: FeatureDetector,
    matcher: FeatureMatcher,
    estimator: PoseEstimator,
    mapper: Mapper,
    /// Features of the last successfully tracked frame. Kept across degraded
    /// frames so tracking can re-lock against the same reference.
    previous: Option<FeatureSet>,
    /// World pose after every successfully tracked frame.
    trajectory: Vec<SE3>,
    consecutive_failures: u32,
}

/// Monocular pipeline: frames in, poses and a point cloud out.
pub struct SlamPipeline {
    config: PipelineConfig,
    shared: Arc<SharedState>,
    core: Mutex<PipelineCore>,
    /// Last pose reported to any caller, readable without the core lock so
    /// dropped frames still carry a sensible pose.
    last_pose: Mutex<SE3>,
    refine_sender: Sender<RefineTask>,
    worker: Option<JoinHandle<()>>,
}

impl SlamPipeline {
    /// Validate the configuration, build all stages, and spawn the
    /// refinement worker.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let detector = FeatureDetector::new(config.detector.clone())?;
        let matcher = FeatureMatcher::new(config.matcher.clone())?;
        let estimator = PoseEstimator::new(config.estimator.clone())?;
        let mapper = Mapper::new(config.mapper.clone(), config.matcher.clone(), config.camera)?;
        let cloud = CloudAccumulator::new(config.cloud.clone())?;

        let shared = SharedState::new(cloud);
        let (refine_sender, refine_receiver) = bounded::<RefineTask>(REFINE_CHANNEL_CAPACITY);
        let worker = Self::spawn_refiner(
            shared.clone(),
            refine_receiver,
            config.camera,
            config.refine.clone(),
        );

        info!(
            "pipeline ready: fx={} fy={} window={} max_keypoints={}",
            config.camera.fx, config.camera.fy, config.refine.window, config.detector.max_keypoints
        );

        Ok(Self {
            config,
            shared,
            core: Mutex::new(PipelineCore {
                detector,
                matcher,
                estimator,
                mapper,
                previous: None,
                trajectory: Vec::new(),
                consecutive_failures: 0,
            }),
            last_pose: Mutex::new(SE3::identity()),
            refine_sender,
            worker: Some(worker),
        })
    }

    fn spawn_refiner(
        shared: Arc<SharedState>,
        tasks: Receiver<RefineTask>,
        camera: CameraIntrinsics,
        config: BaConfig,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut refiner = Refiner::new(camera, config);
            refiner.run(tasks, shared);
        })
    }

    /// Process one interleaved RGBA frame.
    pub fn process_rgba(
        &self,
        rgba: &[u8],
        width: u32,
        height: u32,
        timestamp: Duration,
    ) -> Result<FrameResult> {
        self.process(FramePixels::Rgba8(rgba), width, height, timestamp)
    }

    /// Process one single-channel grayscale frame.
    pub fn process_gray(
        &self,
        gray: &[u8],
        width: u32,
        height: u32,
        timestamp: Duration,
    ) -> Result<FrameResult> {
        self.process(FramePixels::Gray8(gray), width, height, timestamp)
    }

    fn process(
        &self,
        pixels: FramePixels<'_>,
        width: u32,
        height: u32,
        timestamp: Duration,
    ) -> Result<FrameResult> {
        // A frame that cannot start immediately would be stale by the time
        // it could, so it is dropped before any work happens.
        let Some(mut core) = self.core.try_lock() else {
            debug!("frame at {timestamp:?} dropped: pipeline busy");
            return Ok(FrameResult {
                status: FrameStatus::Dropped,
                pose: *self.last_pose.lock(),
                keyframe_id: None,
                metrics: FrameMetrics::zero(),
                timing: StageTimings::zero(),
            });
        };
        let core = &mut *core;

        let total_start = Instant::now();
        let mut metrics = FrameMetrics::zero();

        // Step 1: grayscale conversion, detection, and color sampling.
        let detect_start = Instant::now();
        let gray = Arc::new(pixels.to_gray(width, height)?);
        let features = core.detector.detect(&gray);
        let detect_ms = ms_since(detect_start);

        let colors: Vec<[f32; 3]> = features
            .keypoints
            .iter()
            .map(|kp| pixels.color_at(kp.x.round() as i64, kp.y.round() as i64, width, height))
            .collect();
        metrics.n_features = features.len();

        // Step 2: match against the previous frame and estimate motion.
        // The first frame has no reference and skips straight to mapping.
        let mut rel: Option<RelativePose> = None;
        let mut match_ms = 0.0;
        let mut estimate_ms = 0.0;
        if let Some(prev) = core.previous.as_ref() {
            let match_start = Instant::now();
            let raw = core.matcher.match_features(prev, &features);
            let matches = core.matcher.filter_outliers(&raw, prev, &features);
            match_ms = ms_since(match_start);
            metrics.n_matches = matches.len();

            let estimate_start = Instant::now();
            let estimate = core
                .estimator
                .estimate(prev, &features, &matches, &self.config.camera);
            estimate_ms = ms_since(estimate_start);

            match estimate {
                Ok(pose) => {
                    metrics.n_inliers = pose.inliers.len();
                    metrics.inlier_ratio = if matches.is_empty() {
                        0.0
                    } else {
                        pose.inliers.len() as f64 / matches.len() as f64
                    };
                    rel = Some(pose);
                }
                Err(why) => {
                    core.consecutive_failures += 1;
                    metrics.consecutive_failures = core.consecutive_failures;
                    let pose = core.mapper.current_pose();
                    warn!(
                        "tracking degraded at {timestamp:?}: {why} ({} consecutive)",
                        core.consecutive_failures
                    );
                    return Ok(FrameResult {
                        status: FrameStatus::Degraded(why),
                        pose,
                        keyframe_id: None,
                        metrics,
                        timing: StageTimings {
                            total_ms: ms_since(total_start),
                            detect_ms,
                            match_ms,
                            estimate_ms,
                            map_ms: 0.0,
                        },
                    });
                }
            }
        }

        // Step 3: fold the motion into the dead-reckoned world pose.
        let pose = match rel.as_ref() {
            Some(rel) => {
                let pose = core.mapper.advance(rel);
                metrics.delta_translation = core.mapper.config().translation_step;
                pose
            }
            // First frame: its camera pose defines the world origin.
            None => core.mapper.current_pose(),
        };
        core.trajectory.push(pose);
        core.consecutive_failures = 0;
        metrics.consecutive_failures = 0;

        // Step 4: keyframe decision and map commit under the write locks.
        let map_start = Instant::now();
        let mut keyframe_id = None;
        if core.mapper.should_insert_keyframe() {
            // Interrupt a running refinement before contending for the locks.
            self.shared.request_abort_refine();
            let insertion = {
                let mut map = self.shared.map.write();
                let mut cloud = self.shared.cloud.write();
                core.mapper.process(
                    &mut map,
                    &mut cloud,
                    FrameInput {
                        timestamp,
                        features: &features,
                        colors: &colors,
                        frame: &gray,
                    },
                )
            };
            if let Some(insertion) = insertion {
                keyframe_id = Some(insertion.keyframe_id);
                if self
                    .refine_sender
                    .try_send(RefineTask {
                        keyframe_id: insertion.keyframe_id,
                    })
                    .is_err()
                {
                    debug!(
                        "refine task for {} skipped: worker busy or stopped",
                        insertion.keyframe_id
                    );
                }
            }
        }
        let map_ms = ms_since(map_start);

        let status = match core.mapper.state() {
            MapperState::Bootstrap => FrameStatus::Bootstrapping,
            MapperState::Tracking => FrameStatus::Tracking,
        };

        core.previous = Some(features);
        *self.last_pose.lock() = pose;

        let timing = StageTimings {
            total_ms: ms_since(total_start),
            detect_ms,
            match_ms,
            estimate_ms,
            map_ms,
        };
        debug!(
            "frame {timestamp:?}: {status:?} features={} matches={} inliers={} total={:.1}ms",
            metrics.n_features, metrics.n_matches, metrics.n_inliers, timing.total_ms
        );

        Ok(FrameResult {
            status,
            pose,
            keyframe_id,
            metrics,
            timing,
        })
    }

    /// Snapshot of the current point cloud for rendering.
    pub fn snapshot(&self) -> CloudSnapshot {
        self.shared.cloud.read().snapshot()
    }

    /// World pose after the most recent successfully tracked frame.
    pub fn current_pose(&self) -> SE3 {
        *self.last_pose.lock()
    }

    /// Poses of all successfully tracked frames, oldest first.
    pub fn trajectory(&self) -> Vec<SE3> {
        self.core.lock().trajectory.clone()
    }

    pub fn num_keyframes(&self) -> usize {
        self.shared.map.read().num_keyframes()
    }

    pub fn num_map_points(&self) -> usize {
        self.shared.map.read().num_map_points()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Shared stores, for callers that render or inspect the map directly.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Discard the map, the cloud, and the trajectory, returning to the
    /// pre-bootstrap state. An in-flight refinement result is invalidated
    /// by the map epoch bump and will not be applied.
    ///
    /// Blocks until a concurrently processing frame finishes.
    pub fn reset(&self) {
        let mut core = self.core.lock();
        {
            let mut map = self.shared.map.write();
            let mut cloud = self.shared.cloud.write();
            map.clear();
            cloud.clear();
        }
        core.mapper.reset();
        core.previous = None;
        core.trajectory.clear();
        core.consecutive_failures = 0;
        *self.last_pose.lock() = SE3::identity();
        info!("pipeline reset: map, cloud, and trajectory cleared");
    }

    /// Stop the refinement worker and wait for it to exit.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SlamPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    use crate::error::TrackFailure;

    const W: u32 = 640;
    const H: u32 = 480;
    /// Half extent of a rendered square, in pixels.
    const HALF: i64 = 6;

    /// A 5x4 grid of scene points, placed by back-projecting image positions
    /// of the first camera at slowly varying depth.
    fn scene_points() -> Vec<Vector3<f64>> {
        let camera = CameraIntrinsics::default();
        let us = [100.0, 210.0, 320.0, 430.0, 540.0];
        let vs = [90.0, 190.0, 290.0, 390.0];
        let mut points = Vec::new();
        for (j, &v) in vs.iter().enumerate() {
            for (i, &u) in us.iter().enumerate() {
                let z = 2.8 + 0.02 * (j * us.len() + i) as f64;
                points.push(camera.back_project(u, v, z));
            }
        }
        points
    }

    /// Render the scene as bright squares seen from a camera translated
    /// `cam_x` along world x. Squares become 4 Harris corners each.
    fn render(points: &[Vector3<f64>], cam_x: f64) -> Vec<u8> {
        let camera = CameraIntrinsics::default();
        let mut pixels = vec![40u8; (W * H) as usize];
        for p in points {
            let local = Vector3::new(p.x - cam_x, p.y, p.z);
            let Some(px) = camera.project(&local) else {
                continue;
            };
            let (cu, cv) = (px.x.round() as i64, px.y.round() as i64);
            for dy in -HALF..HALF {
                for dx in -HALF..HALF {
                    let (x, y) = (cu + dx, cv + dy);
                    if x >= 0 && x < W as i64 && y >= 0 && y < H as i64 {
                        pixels[(y * W as i64 + x) as usize] = 230;
                    }
                }
            }
        }
        pixels
    }

    /// Stock config with the dead-reckoning step matched to the true
    /// inter-frame motion, so recovered depths land at true scale.
    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.mapper.translation_step = 0.1;
        config
    }

    #[test]
    fn test_two_frames_bootstrap_and_triangulate() {
        let points = scene_points();
        let pipeline = SlamPipeline::new(test_config()).unwrap();

        let first = pipeline
            .process_gray(&render(&points, 0.0), W, H, Duration::ZERO)
            .unwrap();
        assert_eq!(first.status, FrameStatus::Bootstrapping);
        assert!(first.keyframe_id.is_some());
        assert!(first.metrics.n_features >= 40);

        let second = pipeline
            .process_gray(&render(&points, 0.1), W, H, Duration::from_millis(33))
            .unwrap();
        assert_eq!(second.status, FrameStatus::Tracking);
        assert!(second.keyframe_id.is_some());
        assert!(second.metrics.n_inliers >= 8);

        // Recovered motion: step magnitude is exact, direction within 15
        // degrees of the true rightward translation.
        let t = second.pose.translation;
        assert!((t.norm() - 0.1).abs() < 1e-9);
        assert!(t.x / t.norm() > 0.966, "direction off: {t:?}");
        assert!(second.pose.rotation_angle() < 0.1);

        assert_eq!(pipeline.num_keyframes(), 2);
        assert!(pipeline.num_map_points() > 0);
        assert_eq!(pipeline.trajectory().len(), 2);

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.count, pipeline.num_map_points());

        // Most grid squares should have a landmark near their true position.
        let recovered: Vec<Vector3<f64>> = {
            let map = pipeline.shared_state().map.read();
            map.map_points().map(|mp| mp.position).collect()
        };
        let near = points
            .iter()
            .filter(|p| recovered.iter().any(|r| (r - **p).norm() < 0.3))
            .count();
        assert!(
            near >= 15,
            "only {near} of {} squares triangulated near truth",
            points.len()
        );
    }

    #[test]
    fn test_blank_frame_degrades_then_recovers() {
        let points = scene_points();
        let pipeline = SlamPipeline::new(test_config()).unwrap();

        pipeline
            .process_gray(&render(&points, 0.0), W, H, Duration::ZERO)
            .unwrap();

        let blank = vec![40u8; (W * H) as usize];
        let degraded = pipeline
            .process_gray(&blank, W, H, Duration::from_millis(33))
            .unwrap();
        assert_eq!(
            degraded.status,
            FrameStatus::Degraded(TrackFailure::InsufficientData)
        );
        assert_eq!(degraded.metrics.consecutive_failures, 1);
        assert!(degraded.pose.translation.norm() < 1e-12);
        assert_eq!(pipeline.trajectory().len(), 1);

        // The reference features were retained, so a good frame re-locks.
        let recovered = pipeline
            .process_gray(&render(&points, 0.1), W, H, Duration::from_millis(66))
            .unwrap();
        assert_eq!(recovered.status, FrameStatus::Tracking);
        assert_eq!(recovered.metrics.consecutive_failures, 0);
        assert_eq!(pipeline.trajectory().len(), 2);
    }

    #[test]
    fn test_reset_clears_all_state() {
        let points = scene_points();
        let pipeline = SlamPipeline::new(test_config()).unwrap();
        pipeline
            .process_gray(&render(&points, 0.0), W, H, Duration::ZERO)
            .unwrap();
        pipeline
            .process_gray(&render(&points, 0.1), W, H, Duration::from_millis(33))
            .unwrap();
        assert!(pipeline.num_map_points() > 0);

        pipeline.reset();
        assert_eq!(pipeline.num_keyframes(), 0);
        assert_eq!(pipeline.num_map_points(), 0);
        assert_eq!(pipeline.snapshot().count, 0);
        assert!(pipeline.trajectory().is_empty());
        assert!(pipeline.current_pose().translation.norm() < 1e-12);

        // The next frame starts a fresh bootstrap at the identity pose.
        let restart = pipeline
            .process_gray(&render(&points, 0.0), W, H, Duration::from_millis(66))
            .unwrap();
        assert_eq!(restart.status, FrameStatus::Bootstrapping);
        assert!(restart.keyframe_id.is_some());
        assert!(restart.pose.translation.norm() < 1e-12);
        assert_eq!(pipeline.num_keyframes(), 1);
    }

    #[test]
    fn test_busy_pipeline_drops_frames() {
        let pipeline = SlamPipeline::new(test_config()).unwrap();
        let blank = vec![40u8; (W * H) as usize];

        let held = pipeline.core.lock();
        let dropped = pipeline
            .process_gray(&blank, W, H, Duration::ZERO)
            .unwrap();
        assert_eq!(dropped.status, FrameStatus::Dropped);
        assert_eq!(dropped.metrics.n_features, 0);
        drop(held);

        let processed = pipeline
            .process_gray(&blank, W, H, Duration::from_millis(33))
            .unwrap();
        assert_ne!(processed.status, FrameStatus::Dropped);
    }

    #[test]
    fn test_buffer_size_mismatch_is_error() {
        let pipeline = SlamPipeline::new(test_config()).unwrap();
        assert!(pipeline
            .process_gray(&[0u8; 10], W, H, Duration::ZERO)
            .is_err());
        assert!(pipeline
            .process_rgba(&[0u8; 10], W, H, Duration::ZERO)
            .is_err());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut pipeline = SlamPipeline::new(test_config()).unwrap();
        pipeline.shutdown();
        pipeline.shutdown();
    }
}
