pub mod atlas;
pub mod config;
pub mod geometry;
pub mod imu;
pub mod local_mapping;
pub mod optimizer;
pub mod system;
pub mod tracking;
pub mod vocabulary;
