//! Descriptor matching between consecutive feature sets.
//!
//! Two stages:
//! 1. radius-restricted best/second-best Hamming search with an absolute
//!    distance gate and the mandatory ratio test (repetitive texture
//!    produces near-tied candidates; those are rejected, not guessed)
//! 2. robust consensus on a mean-translation motion model to strip
//!    geometric outliers before pose estimation

use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::features::keypoint::{hamming_distance, FeatureSet, Match};

/// Matcher tuning. Defaults assume moderate inter-frame motion at 640x480.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Candidate search radius in pixels around the previous keypoint.
    pub search_radius: f32,
    /// Absolute Hamming distance gate (out of 256 bits).
    pub max_distance: u32,
    /// Best/second-best ratio bound. Matches at or above it are ambiguous.
    pub ratio: f32,
    /// Consensus iterations for outlier rejection.
    pub ransac_iterations: usize,
    /// Matches sampled per consensus iteration.
    pub ransac_sample: usize,
    /// Pixel deviation from the motion model that still counts as an inlier.
    pub inlier_threshold: f32,
    /// Below this many matches, consensus is skipped and the input returned
    /// unchanged; two-view geometry needs at least 8 anyway.
    pub min_matches_for_consensus: usize,
    /// Seed for consensus sampling.
    pub seed: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            search_radius: 60.0,
            max_distance: 64,
            ratio: 0.8,
            ransac_iterations: 100,
            ransac_sample: 4,
            inlier_threshold: 3.0,
            min_matches_for_consensus: 8,
            seed: 13,
        }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ratio > 0.0 && self.ratio < 1.0) {
            return Err(ConfigError::invalid("ratio", "expected in (0, 1)"));
        }
        if !(self.search_radius > 0.0) {
            return Err(ConfigError::invalid("search_radius", "must be positive"));
        }
        if self.ransac_sample < 4 {
            return Err(ConfigError::invalid("ransac_sample", "at least 4 required"));
        }
        if self.min_matches_for_consensus < self.ransac_sample {
            return Err(ConfigError::invalid(
                "min_matches_for_consensus",
                "must be at least ransac_sample",
            ));
        }
        Ok(())
    }
}

/// Frame-to-frame feature tracker.
pub struct FeatureMatcher {
    config: MatcherConfig,
}

impl FeatureMatcher {
    pub fn new(config: MatcherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Best/second-best matching with the ambiguity ratio test.
    ///
    /// Postcondition: every returned match has best < ratio * second_best,
    /// or had no second candidate within the search radius.
    pub fn match_features(&self, prev: &FeatureSet, curr: &FeatureSet) -> Vec<Match> {
        if prev.is_empty() || curr.is_empty() {
            return Vec::new();
        }

        let radius = self.config.search_radius;
        let radius_sq = radius * radius;

        let mut matches = Vec::new();
        for (prev_idx, prev_kp) in prev.keypoints.iter().enumerate() {
            let prev_desc = &prev.descriptors[prev_idx];

            let mut best: Option<(usize, u32)> = None;
            let mut second_best: Option<u32> = None;

            for (curr_idx, curr_kp) in curr.keypoints.iter().enumerate() {
                if (curr_kp.x - prev_kp.x).abs() > radius
                    || (curr_kp.y - prev_kp.y).abs() > radius
                    || prev_kp.distance_sq(curr_kp) > radius_sq
                {
                    continue;
                }

                let dist = hamming_distance(prev_desc, &curr.descriptors[curr_idx]);
                match best {
                    Some((_, best_dist)) if dist < best_dist => {
                        second_best = Some(best_dist);
                        best = Some((curr_idx, dist));
                    }
                    Some(_) => {
                        if second_best.map_or(true, |s| dist < s) {
                            second_best = Some(dist);
                        }
                    }
                    None => best = Some((curr_idx, dist)),
                }
            }

            let Some((curr_idx, best_dist)) = best else {
                continue;
            };
            if best_dist >= self.config.max_distance {
                continue;
            }
            let unambiguous = match second_best {
                Some(second) => (best_dist as f32) < self.config.ratio * second as f32,
                None => true,
            };
            if unambiguous {
                matches.push(Match {
                    prev_idx,
                    curr_idx,
                    distance: best_dist,
                });
            }
        }

        matches
    }

    /// Consensus filtering on a mean-translation motion model.
    ///
    /// Iterations run in parallel; the one with the most inliers wins (ties
    /// go to the earlier iteration for determinism). With fewer than
    /// `min_matches_for_consensus` input matches the list passes through
    /// unchanged so downstream stages can report the shortage themselves.
    pub fn filter_outliers(
        &self,
        matches: &[Match],
        prev: &FeatureSet,
        curr: &FeatureSet,
    ) -> Vec<Match> {
        if matches.len() < self.config.min_matches_for_consensus {
            return matches.to_vec();
        }

        let displacements: Vec<(f32, f32)> = matches
            .iter()
            .map(|m| {
                let a = &prev.keypoints[m.prev_idx];
                let b = &curr.keypoints[m.curr_idx];
                (b.x - a.x, b.y - a.y)
            })
            .collect();

        let n = displacements.len();
        let sample_size = self.config.ransac_sample.min(n);
        let thr_sq = self.config.inlier_threshold * self.config.inlier_threshold;
        let seed = self.config.seed;

        let best = (0..self.config.ransac_iterations)
            .into_par_iter()
            .map(|iter| {
                let mut rng = SmallRng::seed_from_u64(
                    seed ^ (iter as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                );
                let sample = rand::seq::index::sample(&mut rng, n, sample_size);

                let mut mx = 0.0f32;
                let mut my = 0.0f32;
                for idx in sample.iter() {
                    mx += displacements[idx].0;
                    my += displacements[idx].1;
                }
                mx /= sample_size as f32;
                my /= sample_size as f32;

                let count = displacements
                    .iter()
                    .filter(|(dx, dy)| {
                        let ex = dx - mx;
                        let ey = dy - my;
                        ex * ex + ey * ey < thr_sq
                    })
                    .count();

                (count, iter, (mx, my))
            })
            .reduce(
                || (0, usize::MAX, (0.0, 0.0)),
                |a, b| {
                    if b.0 > a.0 || (b.0 == a.0 && b.1 < a.1) {
                        b
                    } else {
                        a
                    }
                },
            );

        let (mx, my) = best.2;
        matches
            .iter()
            .zip(displacements.iter())
            .filter(|(_, (dx, dy))| {
                let ex = dx - mx;
                let ey = dy - my;
                ex * ex + ey * ey < thr_sq
            })
            .map(|(m, _)| *m)
            .collect()
    }
}
