use log::{debug, warn};
use nalgebra::Point2;

use crate::error::{Result, StereoError};
use crate::pose::{Frame, JointId};

/// 両視点で検出された関節の対応点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub joint: JointId,
    /// 視点Aのピクセル座標
    pub a: Point2<f64>,
    /// 視点Bのピクセル座標
    pub b: Point2<f64>,
}

/// 1フレーム分の対応点（視点Aの関節ID昇順）
pub type FrameCorrespondences = Vec<Correspondence>;

/// 1フレーム同士の対応付け。Bに存在しない関節は黙って捨てる
pub fn align_frames(frame_a: &Frame, frame_b: &Frame) -> FrameCorrespondences {
    frame_a
        .iter()
        .filter_map(|(&joint, ja)| {
            let jb = frame_b.get(joint)?;
            Some(Correspondence {
                joint,
                a: ja.point(),
                b: jb.point(),
            })
        })
        .collect()
}

fn align_prefix(session_a: &[Frame], session_b: &[Frame]) -> Vec<FrameCorrespondences> {
    session_a
        .iter()
        .zip(session_b)
        .enumerate()
        .map(|(i, (fa, fb))| {
            let pairs = align_frames(fa, fb);
            debug!("frame {}: {}/{} joints matched", i, pairs.len(), fa.len());
            pairs
        })
        .collect()
}

/// 2視点のセッションをフレーム位置で対応付ける
///
/// フレーム数が異なる場合は `SessionLengthMismatch`
pub fn align(session_a: &[Frame], session_b: &[Frame]) -> Result<Vec<FrameCorrespondences>> {
    if session_a.len() != session_b.len() {
        return Err(StereoError::SessionLengthMismatch {
            a: session_a.len(),
            b: session_b.len(),
        });
    }
    Ok(align_prefix(session_a, session_b))
}

/// 短い方のセッションに合わせて切り詰めて対応付ける
pub fn align_truncated(session_a: &[Frame], session_b: &[Frame]) -> Vec<FrameCorrespondences> {
    if session_a.len() != session_b.len() {
        warn!(
            "session lengths differ (A: {}, B: {}), truncating to {} frames",
            session_a.len(),
            session_b.len(),
            session_a.len().min(session_b.len())
        );
    }
    align_prefix(session_a, session_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Joint;

    fn frame_with(ids: &[usize]) -> Frame {
        ids.iter()
            .map(|&i| (JointId(i), Joint::new(i as i32 * 10, 5, 0.0, 1.0)))
            .collect()
    }

    #[test]
    fn test_missing_joints_are_dropped() {
        let a = frame_with(&[0, 1, 2]);
        let b = frame_with(&[0, 2]);
        let pairs = align_frames(&a, &b);
        let ids: Vec<JointId> = pairs.iter().map(|c| c.joint).collect();
        assert_eq!(ids, vec![JointId(0), JointId(2)]);
        assert_eq!(pairs[1].a, Point2::new(20.0, 5.0));
    }

    #[test]
    fn test_align_keeps_frame_order() {
        let a = vec![frame_with(&[0]), frame_with(&[]), frame_with(&[1])];
        let b = vec![frame_with(&[0]), frame_with(&[0]), frame_with(&[1])];
        let result = align(&a, &b).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].len(), 1);
        assert!(result[1].is_empty());
        assert_eq!(result[2][0].joint, JointId(1));
    }

    #[test]
    fn test_align_length_mismatch() {
        let a = vec![frame_with(&[0]), frame_with(&[0])];
        let b = vec![frame_with(&[0])];
        assert!(matches!(
            align(&a, &b),
            Err(StereoError::SessionLengthMismatch { a: 2, b: 1 })
        ));
    }

    #[test]
    fn test_align_truncated() {
        let a = vec![frame_with(&[0]), frame_with(&[0]), frame_with(&[0])];
        let b = vec![frame_with(&[0])];
        assert_eq!(align_truncated(&a, &b).len(), 1);
    }
}
