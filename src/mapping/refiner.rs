//! Background refinement worker.
//!
//! Consumes one task per committed keyframe: runs the sliding-window bundle
//! adjustment (collect under the read lock, solve unlocked, apply under the
//! write lock), then the point-cloud maintenance filters. The confidence
//! filter and voxel merge run every task; the O(n²) statistical filter runs
//! periodically. Points dropped by any filter are removed from the map as
//! well, so the two stores never disagree about membership.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::geometry::CameraIntrinsics;
use crate::optimizer::{apply_window, collect_window, solve_window, BaConfig};
use crate::system::messages::RefineTask;
use crate::system::shared_state::SharedState;

/// Timeout for receiving tasks. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// The statistical outlier filter runs every this many tasks.
const STATISTICAL_FILTER_PERIOD: u64 = 4;

/// Worker state for the refinement thread.
pub struct Refiner {
    camera: CameraIntrinsics,
    config: BaConfig,
    tasks_processed: u64,
}

impl Refiner {
    pub fn new(camera: CameraIntrinsics, config: BaConfig) -> Self {
        Self {
            camera,
            config,
            tasks_processed: 0,
        }
    }

    /// Main worker loop: receive tasks until shutdown or channel close.
    pub fn run(&mut self, tasks: Receiver<RefineTask>, shared: Arc<SharedState>) {
        loop {
            if shared.is_shutdown_requested() {
                break;
            }
            match tasks.recv_timeout(RECV_TIMEOUT) {
                Ok(task) => self.process_task(task, &shared),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("refinement worker exiting after {} tasks", self.tasks_processed);
    }

    /// Handle one refinement request.
    pub fn process_task(&mut self, task: RefineTask, shared: &Arc<SharedState>) {
        self.tasks_processed += 1;

        // Starting fresh; any abort raised for a previous run is stale.
        shared.clear_abort_refine();

        self.refine_window(task, shared);
        self.filter_cloud(shared);
    }

    /// Sliding-window bundle adjustment in three phases.
    fn refine_window(&self, task: RefineTask, shared: &Arc<SharedState>) {
        // Phase 1: snapshot the problem under the read lock.
        let problem = {
            let map = shared.map.read();
            collect_window(&map, &self.config)
        };
        let Some(problem) = problem else {
            debug!("no refineable window around {}", task.keyframe_id);
            return;
        };

        // Phase 2: solve without holding any lock. Aborts between passes
        // when a newer keyframe is already on its way.
        let solution = solve_window(&problem, &self.camera, &self.config, &|| {
            shared.should_abort_refine() || shared.is_shutdown_requested()
        });

        // Phase 3: write back, then push refined positions into the cloud.
        // Lock order: map before cloud.
        let mut map = shared.map.write();
        let mut cloud = shared.cloud.write();
        let updated = apply_window(&mut map, &solution);
        if updated > 0 {
            for (mp_id, position) in &solution.points {
                cloud.update_position(*mp_id, *position);
            }
        }

        let report = &solution.report;
        info!(
            "window around {}: {} passes, error {:.3} -> {:.3} px, {} entities updated",
            task.keyframe_id, report.passes_run, report.initial_error, report.final_error, updated,
        );
    }

    /// Point-cloud maintenance. Membership removals propagate to the map;
    /// positions only ever flow map -> cloud.
    fn filter_cloud(&self, shared: &Arc<SharedState>) {
        let mut map = shared.map.write();
        let mut cloud = shared.cloud.write();

        let mut removed = cloud.filter_confidence();
        if self.tasks_processed % STATISTICAL_FILTER_PERIOD == 0 {
            removed.extend(cloud.filter_statistical());
        }
        removed.extend(cloud.merge_voxels());

        for &mp_id in &removed {
            map.remove_map_point(mp_id);
        }
        if !removed.is_empty() {
            debug!("cloud filters removed {} points", removed.len());
        }
    }
}
