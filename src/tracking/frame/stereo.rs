//! Per-keypoint depth from a rectified stereo pair or an RGB-D depth map.
//!
//! Both paths fill the same two arrays: `depth` (meters, `-1` when invalid)
//! and `u_right`, the x coordinate the keypoint would have in a virtual right
//! camera (`-1` when invalid). Image lookups (SAD windows, depth-map reads)
//! use raw keypoint positions; `u_right` is stored relative to the undistorted
//! x so that it can be compared against projections.

use image::{GrayImage, ImageBuffer, Luma};
use tracing::debug;

use super::camera::CalibrationContext;
use super::features::{descriptor_distance, Descriptor, KeyPoint, ScaleLevels};
use crate::tracking::matching::{TH_HIGH, TH_LOW};

/// Depth map in raw sensor units.
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// SAD window half size.
const SAD_HALF_WINDOW: i64 = 5;
/// Horizontal SAD search range around the descriptor match.
const SAD_SEARCH_RANGE: i64 = 5;

/// Resolved stereo observations, parallel to the left keypoints.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoDepth {
    pub u_right: Vec<f64>,
    pub depth: Vec<f64>,
}

impl StereoDepth {
    pub fn invalid(n: usize) -> Self {
        Self {
            u_right: vec![-1.0; n],
            depth: vec![-1.0; n],
        }
    }

    pub fn num_valid(&self) -> usize {
        self.depth.iter().filter(|&&d| d > 0.0).count()
    }
}

/// One side of a stereo pair, as produced by the extractor.
pub struct StereoView<'a> {
    pub keypoints: &'a [KeyPoint],
    pub descriptors: &'a [Descriptor],
    pub pyramid: &'a [GrayImage],
}

/// Match left keypoints against the right image along rectified rows.
///
/// `left_un` holds the undistorted left keypoints, used only for `u_right`.
pub fn compute_stereo_matches(
    left: &StereoView<'_>,
    right: &StereoView<'_>,
    left_un: &[KeyPoint],
    scale: &ScaleLevels,
    calib: &CalibrationContext,
) -> StereoDepth {
    let n = left.keypoints.len();
    let mut out = StereoDepth::invalid(n);
    let Some(base) = left.pyramid.first() else {
        return out;
    };
    let n_rows = base.height() as i64;
    if n_rows == 0 || calib.mb <= 0.0 {
        return out;
    }

    let th_orb_dist = (TH_HIGH + TH_LOW) / 2;

    // Right keypoints indexed by every row their search band touches.
    let mut row_indices: Vec<Vec<usize>> = vec![Vec::with_capacity(200); n_rows as usize];
    for (ir, kp) in right.keypoints.iter().enumerate() {
        let y = kp.y as f64;
        let r = 2.0 * scale.factor(kp.octave);
        let min_r = ((y - r).floor() as i64).max(0);
        let max_r = ((y + r).ceil() as i64).min(n_rows - 1);
        for row in min_r..=max_r {
            row_indices[row as usize].push(ir);
        }
    }

    let min_z = calib.mb;
    let min_d = 0.0;
    let max_d = calib.bf / min_z;

    let mut dist_idx: Vec<(u64, usize)> = Vec::with_capacity(n);

    for (il, kp_l) in left.keypoints.iter().enumerate() {
        let level_l = kp_l.octave;
        let v_l = kp_l.y as f64;
        let u_l = kp_l.x as f64;

        let row = v_l as i64;
        if row < 0 || row >= n_rows {
            continue;
        }
        let candidates = &row_indices[row as usize];
        if candidates.is_empty() {
            continue;
        }

        let min_u = u_l - max_d;
        let max_u = u_l - min_d;
        if max_u < 0.0 {
            continue;
        }

        let mut best_dist = TH_HIGH;
        let mut best_idx_r = None;
        let d_l = &left.descriptors[il];
        for &ir in candidates {
            let kp_r = &right.keypoints[ir];
            if kp_r.octave < level_l - 1 || kp_r.octave > level_l + 1 {
                continue;
            }
            let u_r = kp_r.x as f64;
            if u_r >= min_u && u_r <= max_u {
                let dist = descriptor_distance(d_l, &right.descriptors[ir]);
                if dist < best_dist {
                    best_dist = dist;
                    best_idx_r = Some(ir);
                }
            }
        }

        let Some(best_idx_r) = best_idx_r else {
            continue;
        };
        if best_dist >= th_orb_dist {
            continue;
        }

        let Some(refined) = refine_by_sad(left, right, kp_l, right.keypoints[best_idx_r].x as f64, scale)
        else {
            continue;
        };

        let mut disparity = u_l - refined.u_right;
        if disparity >= min_d && disparity < max_d {
            if disparity <= 0.0 {
                disparity = 0.01;
            }
            out.depth[il] = calib.bf / disparity;
            out.u_right[il] = left_un[il].x as f64 - disparity;
            dist_idx.push((refined.cost, il));
        }
    }

    // Median outlier trim on the SAD cost.
    let accepted = dist_idx.len();
    if !dist_idx.is_empty() {
        dist_idx.sort_unstable();
        let median = dist_idx[dist_idx.len() / 2].0 as f64;
        let th_dist = 1.5 * 1.4 * median;
        for &(cost, il) in dist_idx.iter().rev() {
            if cost as f64 <= th_dist {
                break;
            }
            out.u_right[il] = -1.0;
            out.depth[il] = -1.0;
        }
    }

    debug!(
        "[Stereo] {} left / {} right keypoints, {} refined, {} kept",
        n,
        right.keypoints.len(),
        accepted,
        out.num_valid()
    );
    out
}

struct SadMatch {
    u_right: f64,
    cost: u64,
}

/// Slide a center-normalized window along the row and fit a parabola to the
/// best three costs. `None` when a window leaves the image, the minimum sits
/// on the search border, or the sub-pixel correction exceeds one pixel.
fn refine_by_sad(
    left: &StereoView<'_>,
    right: &StereoView<'_>,
    kp_l: &KeyPoint,
    u_r0: f64,
    scale: &ScaleLevels,
) -> Option<SadMatch> {
    let level = kp_l.octave.max(0) as usize;
    let img_l = left.pyramid.get(level)?;
    let img_r = right.pyramid.get(level)?;

    let inv_scale = 1.0 / scale.factor(kp_l.octave);
    let su_l = (kp_l.x as f64 * inv_scale).round() as i64;
    let sv_l = (kp_l.y as f64 * inv_scale).round() as i64;
    let su_r0 = (u_r0 * inv_scale).round() as i64;

    let w = SAD_HALF_WINDOW;
    let l = SAD_SEARCH_RANGE;

    if !window_fits(img_l, su_l, sv_l, w) {
        return None;
    }
    let ini_u = su_r0 - l - w;
    let end_u = su_r0 + l + w;
    if ini_u < 0 || end_u >= img_r.width() as i64 || !window_fits(img_r, su_r0, sv_l, w) {
        return None;
    }

    let center_l = img_l.get_pixel(su_l as u32, sv_l as u32)[0] as i32;
    let mut costs = vec![0u64; (2 * l + 1) as usize];
    let mut best_cost = u64::MAX;
    let mut best_inc = 0i64;
    for inc in -l..=l {
        let uc = su_r0 + inc;
        let center_r = img_r.get_pixel(uc as u32, sv_l as u32)[0] as i32;
        let mut cost = 0u64;
        for dy in -w..=w {
            let y = (sv_l + dy) as u32;
            for dx in -w..=w {
                let a = img_l.get_pixel((su_l + dx) as u32, y)[0] as i32 - center_l;
                let b = img_r.get_pixel((uc + dx) as u32, y)[0] as i32 - center_r;
                cost += (a - b).unsigned_abs() as u64;
            }
        }
        if cost < best_cost {
            best_cost = cost;
            best_inc = inc;
        }
        costs[(l + inc) as usize] = cost;
    }

    if best_inc == -l || best_inc == l {
        return None;
    }

    let d1 = costs[(l + best_inc - 1) as usize] as f64;
    let d2 = costs[(l + best_inc) as usize] as f64;
    let d3 = costs[(l + best_inc + 1) as usize] as f64;
    let denom = 2.0 * (d1 + d3 - 2.0 * d2);
    let delta = if denom.abs() < f64::EPSILON {
        0.0
    } else {
        (d1 - d3) / denom
    };
    if !(-1.0..=1.0).contains(&delta) {
        return None;
    }

    Some(SadMatch {
        u_right: scale.factor(kp_l.octave) * (su_r0 as f64 + best_inc as f64 + delta),
        cost: best_cost,
    })
}

fn window_fits(img: &GrayImage, u: i64, v: i64, w: i64) -> bool {
    u - w >= 0 && v - w >= 0 && u + w < img.width() as i64 && v + w < img.height() as i64
}

/// Read depth for each raw keypoint from a registered depth map.
pub fn compute_depth_from_rgbd(
    keypoints: &[KeyPoint],
    keypoints_un: &[KeyPoint],
    depth_map: &DepthImage,
    calib: &CalibrationContext,
) -> StereoDepth {
    let mut out = StereoDepth::invalid(keypoints.len());
    for (i, (kp, kp_un)) in keypoints.iter().zip(keypoints_un).enumerate() {
        let u = kp.x as i64;
        let v = kp.y as i64;
        if u < 0 || v < 0 || u >= depth_map.width() as i64 || v >= depth_map.height() as i64 {
            continue;
        }
        let d = depth_map.get_pixel(u as u32, v as u32)[0] as f64 * calib.depth_scale;
        if d > 0.0 && d.is_finite() {
            out.depth[i] = d;
            out.u_right[i] = kp_un.x as f64 - calib.bf / d;
        }
    }
    out
}
