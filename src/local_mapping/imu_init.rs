//! Inertial initialization of the active map.
//!
//! Once enough keyframes carrying a navigation state and the preintegration
//! from their predecessor have been inserted, the gyroscope bias is fit over
//! the consecutive keyframe pairs and the map is marked inertially
//! initialized. Depth sensors give metric scale, so no scale is estimated.

use nalgebra::Matrix3;
use tracing::{debug, info};

use crate::atlas::map::{KeyFrame, Map};
use crate::imu::{estimate_gyro_bias, BiasWindowEntry, ImuBias};

/// Minimum keyframes needed for IMU initialization.
pub const MIN_KEYFRAMES_FOR_INIT: usize = 10;

/// Minimum time span covered by those keyframes (seconds).
pub const MIN_TIME_SPAN: f64 = 1.0;

/// Try to initialize the inertial state of `map`.
///
/// Returns the estimated bias when the map became initialized by this call.
pub fn try_initialize_imu(map: &mut Map) -> Option<ImuBias> {
    if map.is_imu_initialized() {
        return None;
    }

    let keyframes = inertial_keyframes(map);
    if keyframes.len() < MIN_KEYFRAMES_FOR_INIT {
        return None;
    }
    let span = keyframes.last()?.timestamp - keyframes.first()?.timestamp;
    if span < MIN_TIME_SPAN {
        debug!(
            "[IMU Init] {} keyframes over {:.2}s, waiting",
            keyframes.len(),
            span
        );
        return None;
    }

    let window: Vec<BiasWindowEntry> = keyframes
        .windows(2)
        .filter_map(|pair| {
            Some(BiasWindowEntry {
                r_wb_i: body_rotation(pair[0])?,
                r_wb_j: body_rotation(pair[1])?,
                preint: pair[1].imu_preintegrated.clone()?,
            })
        })
        .collect();
    if window.len() + 1 < MIN_KEYFRAMES_FOR_INIT {
        return None;
    }

    let initial = keyframes.first()?.nav_state?.bias;
    let bias = estimate_gyro_bias(&window, &initial)?;
    let n_keyframes = keyframes.len();
    let ids: Vec<_> = keyframes.iter().map(|kf| kf.id).collect();

    for id in ids {
        if let Some(nav) = map.get_keyframe_mut(id).and_then(|kf| kf.nav_state.as_mut()) {
            nav.bias = bias;
        }
    }
    map.set_imu_initialized(bias);
    info!(
        "[IMU Init] initialized from {} keyframes over {:.2}s, gyro bias [{:.5}, {:.5}, {:.5}]",
        n_keyframes, span, bias.gyro.x, bias.gyro.y, bias.gyro.z
    );
    Some(bias)
}

/// Keyframes with a navigation state, oldest first, following the temporal
/// chain back from the newest until it breaks.
fn inertial_keyframes(map: &Map) -> Vec<&KeyFrame> {
    let mut chain = Vec::new();
    let mut next = map.last_keyframe_id();
    while let Some(kf) = next.and_then(|id| map.get_keyframe(id)) {
        if kf.nav_state.is_none() {
            break;
        }
        if !kf.is_bad {
            chain.push(kf);
        }
        next = kf.prev_kf;
    }
    chain.reverse();
    chain
}

fn body_rotation(kf: &KeyFrame) -> Option<Matrix3<f64>> {
    Some(kf.nav_state?.rotation.to_rotation_matrix().into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::keyframe::tests::create_keyframe_with_features;
    use crate::geometry::{FrameConverter, SE3};
    use crate::imu::{ImuNoise, ImuSample, NavState, Preintegrator, GRAVITY};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    /// Static keyframes every `dt` seconds whose gyro reads `gyro_bias`.
    fn hovering_map(n: usize, dt: f64, gyro_bias: Vector3<f64>) -> Map {
        let frames = FrameConverter::new(SE3::identity());
        let mut map = Map::new();
        for i in 0..n {
            let mut kf = create_keyframe_with_features(i as u64, 0);
            kf.timestamp = i as f64 * dt;
            kf.nav_state = Some(NavState::from_camera_pose(
                &SE3::identity(),
                Vector3::zeros(),
                ImuBias::zero(),
                &frames,
            ));
            if i > 0 {
                let t0 = (i - 1) as f64 * dt;
                let samples: Vec<ImuSample> = (1..=10)
                    .map(|k| ImuSample::new(t0 + k as f64 * dt / 10.0, -GRAVITY, gyro_bias))
                    .collect();
                let mut preint = Preintegrator::new(ImuBias::zero(), ImuNoise::default());
                preint.integrate_between(&samples, t0, kf.timestamp);
                kf.imu_preintegrated = Some(preint.state);
            }
            map.add_keyframe(kf);
        }
        map
    }

    #[test]
    fn test_initializes_with_gyro_bias() {
        let true_bias = Vector3::new(0.004, -0.002, 0.003);
        let mut map = hovering_map(12, 0.1, true_bias);

        let bias = try_initialize_imu(&mut map).unwrap();
        assert!(map.is_imu_initialized());
        assert_relative_eq!(bias.gyro, true_bias, epsilon = 1e-6);
        assert_eq!(map.imu_bias(), Some(&bias));
        let last = map.last_keyframe_id().unwrap();
        assert_eq!(map.get_keyframe(last).unwrap().nav_state.unwrap().bias, bias);

        // Only once per map.
        assert!(try_initialize_imu(&mut map).is_none());
    }

    #[test]
    fn test_waits_for_keyframes_and_time_span() {
        let mut few = hovering_map(MIN_KEYFRAMES_FOR_INIT - 1, 0.2, Vector3::zeros());
        assert!(try_initialize_imu(&mut few).is_none());
        assert!(!few.is_imu_initialized());

        // Enough keyframes, but only 0.55 s apart end to end.
        let mut short = hovering_map(12, 0.05, Vector3::zeros());
        assert!(try_initialize_imu(&mut short).is_none());
        assert!(!short.is_imu_initialized());
    }

    #[test]
    fn test_visual_only_keyframes_are_ignored() {
        let mut map = Map::new();
        for i in 0..15 {
            let mut kf = create_keyframe_with_features(i, 0);
            kf.timestamp = i as f64 * 0.2;
            map.add_keyframe(kf);
        }
        assert!(try_initialize_imu(&mut map).is_none());
    }
}
