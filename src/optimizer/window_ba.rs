//! Sliding-window bundle adjustment.
//!
//! Refines the poses of the most recent keyframes and the positions of the
//! map points they share, minimizing reprojection error:
//!
//! ```text
//! E = mean_ij ||u_ij - project(T_i, p_j)||
//! ```
//!
//! The solver is deliberately lightweight: a fixed number of passes, each of
//! which (a) re-triangulates every point visible in at least two window
//! keyframes by averaging per-observation back-projections and blending the
//! result with the previous position, then (b) applies one damped
//! gradient-descent step to each non-anchor keyframe translation. The
//! earliest keyframe in the window never moves; it pins the window to the
//! world frame. No convergence test: the fixed pass count bounds worst-case
//! latency, which matters more here than squeezing out the last fraction of
//! a pixel.
//!
//! The three phases mirror how the refinement worker uses them:
//! `collect_window` snapshots the problem under a read lock, `solve_window`
//! runs without any lock and honors an abort callback between passes, and
//! `apply_window` writes back under the write lock, skipping silently if the
//! map was reset in between.

use std::collections::HashMap;

use nalgebra::{Matrix2x3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::geometry::{CameraIntrinsics, SE3};
use crate::map::{KeyframeId, Map, MapPointId};

/// Minimum camera-frame depth for an observation to contribute.
const MIN_OBSERVATION_DEPTH: f64 = 1e-6;

/// Residual charged to an observation whose point sits behind the camera.
const BEHIND_CAMERA_RESIDUAL: f64 = 100.0;

/// Configuration for sliding-window refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaConfig {
    /// Number of most-recent keyframes in the window.
    pub window: usize,
    /// Fixed number of refinement passes per run.
    pub passes: usize,
    /// Weight of the re-triangulated position in the damped point update;
    /// `1 - blend` of the previous position is kept.
    pub blend: f64,
    /// Gradient-descent rate for keyframe translations.
    pub learning_rate: f64,
    /// Upper bound on a single translation step (world units).
    pub max_step: f64,
}

impl Default for BaConfig {
    fn default() -> Self {
        Self {
            window: 3,
            passes: 5,
            blend: 0.3,
            learning_rate: 0.01,
            max_step: 0.02,
        }
    }
}

impl BaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window < 2 {
            return Err(ConfigError::invalid("window", "must be at least 2"));
        }
        if self.passes == 0 {
            return Err(ConfigError::invalid("passes", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.blend) || self.blend == 0.0 {
            return Err(ConfigError::invalid("blend", "must be in (0, 1]"));
        }
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::invalid("learning_rate", "must be positive"));
        }
        if self.max_step <= 0.0 {
            return Err(ConfigError::invalid("max_step", "must be positive"));
        }
        Ok(())
    }
}

/// One feature observation of a window point.
#[derive(Debug, Clone)]
pub struct WindowObservation {
    /// Index into `WindowProblem::keyframe_ids`.
    pub kf_idx: usize,
    /// Index into `WindowProblem::point_ids`.
    pub point_idx: usize,
    /// Observed pixel coordinates.
    pub pixel: Vector2<f64>,
}

/// Snapshot of the optimization problem, extracted under a read lock.
///
/// Everything the solver needs lives here, so the solve phase runs without
/// touching the map.
#[derive(Debug, Clone)]
pub struct WindowProblem {
    /// Map epoch at collection time. A reset bumps the epoch, which voids
    /// this problem.
    pub epoch: u64,
    /// Window keyframes, oldest first. Index 0 is the anchor.
    pub keyframe_ids: Vec<KeyframeId>,
    /// Poses (T_wc) parallel to `keyframe_ids`.
    pub poses: Vec<SE3>,
    /// Points observed by at least two window keyframes.
    pub point_ids: Vec<MapPointId>,
    /// Positions parallel to `point_ids`.
    pub positions: Vec<Vector3<f64>>,
    pub observations: Vec<WindowObservation>,
}

/// Outcome of one refinement run.
#[derive(Debug, Clone)]
pub struct BaReport {
    /// Passes actually executed (fewer than configured when aborted).
    pub passes_run: usize,
    /// Mean reprojection error (pixels) before the first pass.
    pub initial_error: f64,
    /// Mean reprojection error (pixels) after the last pass.
    pub final_error: f64,
    pub points_updated: usize,
    pub poses_updated: usize,
}

/// Solved values ready to be written back under the write lock.
#[derive(Debug, Clone)]
pub struct WindowSolution {
    /// Epoch carried over from the problem; checked by `apply_window`.
    pub epoch: u64,
    /// Refined non-anchor poses. The anchor is excluded by construction so
    /// apply can never move it.
    pub poses: Vec<(KeyframeId, SE3)>,
    /// Refined point positions.
    pub points: Vec<(MapPointId, Vector3<f64>)>,
    pub report: BaReport,
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 1: collect
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the sliding-window problem from the map.
///
/// Returns `None` when the window holds fewer than two keyframes or no point
/// is observed by at least two of them.
pub fn collect_window(map: &Map, config: &BaConfig) -> Option<WindowProblem> {
    let keyframe_ids: Vec<KeyframeId> = map.recent_keyframes(config.window).to_vec();
    if keyframe_ids.len() < 2 {
        return None;
    }

    let mut poses = Vec::with_capacity(keyframe_ids.len());
    for &kf_id in &keyframe_ids {
        poses.push(map.get_keyframe(kf_id)?.pose);
    }

    // Count window observations per point; only multi-view points are
    // refineable.
    let mut obs_count: HashMap<MapPointId, usize> = HashMap::new();
    for &kf_id in &keyframe_ids {
        if let Some(kf) = map.get_keyframe(kf_id) {
            for (_, mp_id) in kf.map_point_indices() {
                *obs_count.entry(mp_id).or_insert(0) += 1;
            }
        }
    }

    let mut point_ids: Vec<MapPointId> = Vec::new();
    let mut positions: Vec<Vector3<f64>> = Vec::new();
    let mut point_index: HashMap<MapPointId, usize> = HashMap::new();
    for (&mp_id, &count) in &obs_count {
        if count < 2 {
            continue;
        }
        if let Some(mp) = map.get_map_point(mp_id) {
            point_index.insert(mp_id, point_ids.len());
            point_ids.push(mp_id);
            positions.push(mp.position);
        }
    }
    if point_ids.is_empty() {
        return None;
    }

    let mut observations = Vec::new();
    for (kf_idx, &kf_id) in keyframe_ids.iter().enumerate() {
        if let Some(kf) = map.get_keyframe(kf_id) {
            for (feat_idx, mp_id) in kf.map_point_indices() {
                if let Some(&point_idx) = point_index.get(&mp_id) {
                    let kp = &kf.features.keypoints[feat_idx];
                    observations.push(WindowObservation {
                        kf_idx,
                        point_idx,
                        pixel: Vector2::new(kp.x as f64, kp.y as f64),
                    });
                }
            }
        }
    }
    if observations.is_empty() {
        return None;
    }

    Some(WindowProblem {
        epoch: map.epoch(),
        keyframe_ids,
        poses,
        point_ids,
        positions,
        observations,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 2: solve
// ─────────────────────────────────────────────────────────────────────────────

/// Run the fixed-pass refinement on a collected problem.
///
/// `should_stop` is polled between passes; an abort keeps whatever progress
/// the completed passes made.
pub fn solve_window(
    problem: &WindowProblem,
    camera: &CameraIntrinsics,
    config: &BaConfig,
    should_stop: &dyn Fn() -> bool,
) -> WindowSolution {
    let mut poses = problem.poses.clone();
    let mut positions = problem.positions.clone();
    let mut point_touched = vec![false; positions.len()];

    let initial_error = mean_reprojection_error(problem, &poses, &positions, camera);
    let mut passes_run = 0;

    for _ in 0..config.passes {
        if should_stop() {
            break;
        }
        passes_run += 1;

        retriangulate_points(
            problem,
            &poses,
            &mut positions,
            &mut point_touched,
            camera,
            config.blend,
        );
        step_translations(problem, &mut poses, &positions, camera, config);
    }

    let final_error = mean_reprojection_error(problem, &poses, &positions, camera);

    let report = BaReport {
        passes_run,
        initial_error,
        final_error,
        points_updated: point_touched.iter().filter(|&&t| t).count(),
        poses_updated: if passes_run > 0 { poses.len() - 1 } else { 0 },
    };

    WindowSolution {
        epoch: problem.epoch,
        poses: problem
            .keyframe_ids
            .iter()
            .zip(poses.iter())
            .skip(1) // anchor stays out of the solution
            .map(|(&id, &pose)| (id, pose))
            .collect(),
        points: problem
            .point_ids
            .iter()
            .zip(positions.iter())
            .map(|(&id, &p)| (id, p))
            .collect(),
        report,
    }
}

/// Pass (a): damped point re-triangulation.
///
/// Each observation back-projects its pixel at the point's current depth in
/// that camera, which moves the estimate onto the observed ray while keeping
/// its range. The per-observation results are averaged and blended with the
/// previous position.
fn retriangulate_points(
    problem: &WindowProblem,
    poses: &[SE3],
    positions: &mut [Vector3<f64>],
    point_touched: &mut [bool],
    camera: &CameraIntrinsics,
    blend: f64,
) {
    let mut sums = vec![Vector3::zeros(); positions.len()];
    let mut counts = vec![0usize; positions.len()];

    for obs in &problem.observations {
        let pose = &poses[obs.kf_idx];
        let cam_point = pose.inverse().transform_point(&positions[obs.point_idx]);
        if cam_point.z <= MIN_OBSERVATION_DEPTH {
            continue;
        }
        let on_ray = camera.back_project(obs.pixel.x, obs.pixel.y, cam_point.z);
        sums[obs.point_idx] += pose.transform_point(&on_ray);
        counts[obs.point_idx] += 1;
    }

    for (idx, position) in positions.iter_mut().enumerate() {
        if counts[idx] < 2 {
            continue;
        }
        let fresh = sums[idx] / counts[idx] as f64;
        *position = *position * (1.0 - blend) + fresh * blend;
        point_touched[idx] = true;
    }
}

/// Pass (b): one damped gradient step per non-anchor keyframe translation.
fn step_translations(
    problem: &WindowProblem,
    poses: &mut [SE3],
    positions: &[Vector3<f64>],
    camera: &CameraIntrinsics,
    config: &BaConfig,
) {
    for kf_idx in 1..poses.len() {
        let pose = &poses[kf_idx];
        let rotation = pose.rotation.to_rotation_matrix().into_inner();
        let mut gradient = Vector3::zeros();
        let mut count = 0usize;

        for obs in problem.observations.iter().filter(|o| o.kf_idx == kf_idx) {
            let cam_point = pose.inverse().transform_point(&positions[obs.point_idx]);
            if cam_point.z <= MIN_OBSERVATION_DEPTH {
                continue;
            }
            let invz = 1.0 / cam_point.z;
            let projected = Vector2::new(
                camera.fx * cam_point.x * invz + camera.cx,
                camera.fy * cam_point.y * invz + camera.cy,
            );
            let residual = obs.pixel - projected;

            // d(residual)/d(translation) = J_proj * R^T, so the error
            // gradient is R * J_proj^T * residual.
            let j_proj = Matrix2x3::new(
                camera.fx * invz,
                0.0,
                -camera.fx * cam_point.x * invz * invz,
                0.0,
                camera.fy * invz,
                -camera.fy * cam_point.y * invz * invz,
            );
            gradient += rotation * (j_proj.transpose() * residual);
            count += 1;
        }

        if count == 0 {
            continue;
        }
        gradient /= count as f64;

        let mut step = -(config.learning_rate * gradient);
        let norm = step.norm();
        if norm > config.max_step {
            step *= config.max_step / norm;
        }

        let pose = &mut poses[kf_idx];
        pose.translation += step;
        pose.renormalize();
    }
}

/// Mean per-observation reprojection error in pixels.
fn mean_reprojection_error(
    problem: &WindowProblem,
    poses: &[SE3],
    positions: &[Vector3<f64>],
    camera: &CameraIntrinsics,
) -> f64 {
    if problem.observations.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    for obs in &problem.observations {
        let cam_point = poses[obs.kf_idx]
            .inverse()
            .transform_point(&positions[obs.point_idx]);
        if cam_point.z <= MIN_OBSERVATION_DEPTH {
            total += BEHIND_CAMERA_RESIDUAL;
            continue;
        }
        let projected = Vector2::new(
            camera.fx * cam_point.x / cam_point.z + camera.cx,
            camera.fy * cam_point.y / cam_point.z + camera.cy,
        );
        total += (obs.pixel - projected).norm();
    }
    total / problem.observations.len() as f64
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 3: apply
// ─────────────────────────────────────────────────────────────────────────────

/// Write a solution back to the map under the caller's write lock.
///
/// Entities deleted since collection are skipped silently; a changed epoch
/// (map reset) voids the whole solution. Returns the number of entities
/// updated.
pub fn apply_window(map: &mut Map, solution: &WindowSolution) -> usize {
    if map.epoch() != solution.epoch {
        return 0;
    }

    let mut updated = 0;
    for (kf_id, pose) in &solution.poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            kf.pose = *pose;
            updated += 1;
        }
    }
    for (mp_id, position) in &solution.points {
        if map.set_map_point_position(*mp_id, *position) {
            updated += 1;
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, FeatureSet, Keypoint};
    use crate::image::FramePixels;
    use crate::map::{Keyframe, MapPoint};
    use std::sync::Arc;
    use std::time::Duration;

    fn no_stop() -> bool {
        false
    }

    fn scene() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(-0.8, -0.4, 2.6),
            Vector3::new(0.9, -0.3, 3.1),
            Vector3::new(-0.6, 0.5, 3.6),
            Vector3::new(0.7, 0.4, 2.9),
            Vector3::new(0.1, -0.6, 4.0),
            Vector3::new(-0.3, 0.6, 3.3),
            Vector3::new(0.4, 0.1, 2.4),
            Vector3::new(-0.1, -0.2, 3.8),
        ]
    }

    fn true_poses() -> Vec<SE3> {
        vec![
            SE3::identity(),
            SE3 {
                rotation: nalgebra::UnitQuaternion::identity(),
                translation: Vector3::new(0.1, 0.0, 0.0),
            },
            SE3 {
                rotation: nalgebra::UnitQuaternion::identity(),
                translation: Vector3::new(0.2, 0.02, 0.0),
            },
        ]
    }

    /// Map with three keyframes observing every scene point at its exact
    /// projection.
    fn build_map(camera: &CameraIntrinsics) -> Map {
        let mut map = Map::new();
        let points = scene();
        let poses = true_poses();
        let frame = Arc::new(FramePixels::Gray8(&[128u8; 16]).to_gray(4, 4).unwrap());

        for pose in &poses {
            let mut features = FeatureSet::default();
            for p in &points {
                let cam_point = pose.inverse().transform_point(p);
                features.push(
                    Keypoint::new(
                        (camera.fx * cam_point.x / cam_point.z + camera.cx) as f32,
                        (camera.fy * cam_point.y / cam_point.z + camera.cy) as f32,
                        1.0,
                        1.0,
                    ),
                    Descriptor::ZERO,
                );
            }
            let n = features.len();
            let id = map.next_keyframe_id();
            map.add_keyframe(Keyframe::new(
                id,
                Duration::ZERO,
                *pose,
                features,
                vec![[0.5; 3]; n],
                Arc::clone(&frame),
            ));
        }

        let kf_ids = map.keyframe_order().to_vec();
        for (feat_idx, p) in points.iter().enumerate() {
            let mp_id = map.next_map_point_id();
            map.add_map_point(MapPoint::new(mp_id, *p, [0.5; 3], 0.8, p.z, 0.1 * p.z));
            for &kf_id in &kf_ids {
                map.associate(kf_id, feat_idx, mp_id);
            }
        }
        map
    }

    #[test]
    fn test_collect_requires_two_keyframes_and_shared_points() {
        let camera = CameraIntrinsics::default();
        let config = BaConfig::default();

        let mut short = Map::new();
        let frame = Arc::new(FramePixels::Gray8(&[128u8; 16]).to_gray(4, 4).unwrap());
        let id = short.next_keyframe_id();
        short.add_keyframe(Keyframe::new(
            id,
            Duration::ZERO,
            SE3::identity(),
            FeatureSet::default(),
            Vec::new(),
            frame,
        ));
        assert!(collect_window(&short, &config).is_none());

        let map = build_map(&camera);
        let problem = collect_window(&map, &config).unwrap();
        assert_eq!(problem.keyframe_ids.len(), 3);
        assert_eq!(problem.point_ids.len(), scene().len());
        // Every point is seen by all three keyframes.
        assert_eq!(problem.observations.len(), 3 * scene().len());
    }

    #[test]
    fn test_point_refinement_pulls_points_toward_consensus() {
        let camera = CameraIntrinsics::default();
        // Near-zero learning rate isolates the point update: poses hold
        // still while the damped re-triangulation does the work.
        let config = BaConfig {
            learning_rate: 1e-9,
            ..BaConfig::default()
        };
        let mut map = build_map(&camera);

        // Knock every point sideways; the observed rays still agree on the
        // true positions. Ids follow creation order.
        let ids: Vec<MapPointId> = (0..scene().len() as u64).map(MapPointId::new).collect();
        for (i, mp_id) in ids.iter().enumerate() {
            let old = map.get_map_point(*mp_id).unwrap().position;
            let offset = Vector3::new(0.05, -0.03, 0.004 * (i as f64 % 3.0));
            map.set_map_point_position(*mp_id, old + offset);
        }

        let problem = collect_window(&map, &config).unwrap();
        let solution = solve_window(&problem, &camera, &config, &no_stop);

        assert_eq!(solution.report.passes_run, config.passes);
        assert!(solution.report.initial_error > 1.0);
        assert!(
            solution.report.final_error < 0.5 * solution.report.initial_error,
            "error {} -> {}",
            solution.report.initial_error,
            solution.report.final_error
        );
        assert_eq!(solution.report.points_updated, scene().len());

        let applied = apply_window(&mut map, &solution);
        assert_eq!(applied, solution.poses.len() + solution.points.len());

        // Positions ended up closer to the true scene.
        for (mp_id, truth) in ids.iter().zip(scene().iter()) {
            let refined = map.get_map_point(*mp_id).unwrap().position;
            assert!((refined - truth).norm() < 0.025);
        }
    }

    #[test]
    fn test_pose_refinement_moves_non_anchor_toward_truth() {
        let camera = CameraIntrinsics::default();
        // Small learning rate keeps the steps unclamped and monotone.
        let config = BaConfig {
            passes: 8,
            learning_rate: 1e-5,
            ..BaConfig::default()
        };
        let mut map = build_map(&camera);

        let kf_ids = map.keyframe_order().to_vec();
        let anchor_pose = map.get_keyframe(kf_ids[0]).unwrap().pose;
        let true_last = map.get_keyframe(kf_ids[2]).unwrap().pose;

        let offset = Vector3::new(0.012, -0.016, 0.006);
        map.get_keyframe_mut(kf_ids[2]).unwrap().pose.translation += offset;

        let problem = collect_window(&map, &config).unwrap();
        let solution = solve_window(&problem, &camera, &config, &no_stop);

        assert!(solution.report.final_error < solution.report.initial_error);

        // The anchor is absent from the solution and untouched in the map.
        assert!(solution.poses.iter().all(|(id, _)| *id != kf_ids[0]));
        apply_window(&mut map, &solution);
        assert_eq!(map.get_keyframe(kf_ids[0]).unwrap().pose, anchor_pose);

        let refined = map.get_keyframe(kf_ids[2]).unwrap().pose;
        let before = offset.norm();
        let after = (refined.translation - true_last.translation).norm();
        assert!(after < before, "perturbation {} not reduced: {}", before, after);

        // Rotation survives the steps orthonormal.
        let angle = refined.rotation.angle();
        assert!(angle.is_finite());
    }

    #[test]
    fn test_abort_before_first_pass_keeps_state() {
        let camera = CameraIntrinsics::default();
        let config = BaConfig::default();
        let map = build_map(&camera);

        let problem = collect_window(&map, &config).unwrap();
        let solution = solve_window(&problem, &camera, &config, &|| true);

        assert_eq!(solution.report.passes_run, 0);
        assert_eq!(solution.report.points_updated, 0);
        assert_eq!(solution.report.poses_updated, 0);
        assert_eq!(
            solution.report.initial_error, solution.report.final_error,
            "no pass ran, error must be unchanged"
        );
    }

    #[test]
    fn test_apply_skips_stale_epoch() {
        let camera = CameraIntrinsics::default();
        let config = BaConfig::default();
        let mut map = build_map(&camera);

        let problem = collect_window(&map, &config).unwrap();
        let solution = solve_window(&problem, &camera, &config, &no_stop);

        map.clear();
        assert_eq!(apply_window(&mut map, &solution), 0);
        assert_eq!(map.num_keyframes(), 0);
        assert_eq!(map.num_map_points(), 0);
    }
}
