//! Inertial fusion: samples, preintegration, navigation state propagation and
//! gyroscope bias re-estimation.

pub mod bias_estimation;
pub mod nav_state;
pub mod preintegration;
pub mod sample;
pub mod types;

pub use bias_estimation::{estimate_gyro_bias, BiasWindowEntry};
pub use nav_state::NavState;
pub use preintegration::{PreintegratedState, Preintegrator};
pub use sample::{ImuBias, ImuNoise, ImuSample, GRAVITY};
