pub mod calibration;
pub mod camera;
pub mod config;
pub mod correspondence;
pub mod error;
pub mod ply;
pub mod pose;
mod sampling;
pub mod session;
pub mod simulate;
pub mod stereo;
pub mod triangulation;

pub use error::{Result, StereoError};
