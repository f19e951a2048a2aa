//! Local refinement of keyframe poses and map point positions.

pub mod window_ba;

pub use window_ba::{
    apply_window, collect_window, solve_window, BaConfig, BaReport, WindowProblem, WindowSolution,
};
