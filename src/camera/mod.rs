pub mod calibrated;
pub mod rig;

pub use calibrated::{CalibratedCamera, CameraModel};
pub use rig::{build_rig, pinhole_intrinsic, projection_from_intrinsic, CameraMatrix, StereoRig};
