//! Geometry utilities: SE3/SO3 transforms, body/camera frames, two-view
//! reconstruction and PnP solving.

pub mod frames;
pub mod pnp;
pub mod se3;
pub mod so3;
pub mod two_view;

pub use frames::FrameConverter;
pub use pnp::{solve_pnp_ransac, PnPParams, PnPResult};
pub use se3::SE3;
