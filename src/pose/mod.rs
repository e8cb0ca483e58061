pub mod angles;
pub mod keypoint;

pub use angles::{elbow_angles, joint_angle, ElbowAngles};
pub use keypoint::{Frame, Joint, JointId, Landmark, Session};
