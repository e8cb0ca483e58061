use nalgebra::Point2;

use super::keypoint::{Frame, Landmark};

/// 3点 a-b-c の b における角度（度）
///
/// どちらかのベクトル長が0ならNone
pub fn joint_angle(a: Point2<f64>, b: Point2<f64>, c: Point2<f64>) -> Option<f64> {
    let ba = a - b;
    let bc = c - b;
    let denom = ba.norm() * bc.norm();
    if denom < 1e-12 {
        return None;
    }
    let cosine = (ba.dot(&bc) / denom).clamp(-1.0, 1.0);
    Some(cosine.acos().to_degrees())
}

/// 左右の肘角度（度）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElbowAngles {
    pub left: f64,
    pub right: f64,
}

/// 肩-肘-手首から左右の肘角度を計算
pub fn elbow_angles(frame: &Frame) -> Option<ElbowAngles> {
    let angle = |shoulder: Landmark, elbow: Landmark, wrist: Landmark| {
        let s = frame.get(shoulder)?.point();
        let e = frame.get(elbow)?.point();
        let w = frame.get(wrist)?.point();
        joint_angle(s, e, w)
    };

    Some(ElbowAngles {
        left: angle(Landmark::LeftShoulder, Landmark::LeftElbow, Landmark::LeftWrist)?,
        right: angle(Landmark::RightShoulder, Landmark::RightElbow, Landmark::RightWrist)?,
    })
}
