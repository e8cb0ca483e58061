//! 単一視点のセッションから擬似的な第2視点を作る

use crate::pose::{Frame, Joint, Session};

/// x' = width - x
pub fn flip_frame_horizontally(frame: &Frame, width: i32) -> Frame {
    frame
        .iter()
        .map(|(&id, j)| (id, Joint::new(width - j.x, j.y, j.z, j.vis)))
        .collect()
}

/// y' = height - y
pub fn flip_frame_vertically(frame: &Frame, height: i32) -> Frame {
    frame
        .iter()
        .map(|(&id, j)| (id, Joint::new(j.x, height - j.y, j.z, j.vis)))
        .collect()
}

/// 全フレームを左右反転した第2視点
pub fn simulate_second_view(session: &[Frame], width: i32) -> Session {
    session
        .iter()
        .map(|frame| flip_frame_horizontally(frame, width))
        .collect()
}
