use std::collections::BTreeMap;

use log::{debug, warn};
use nalgebra::{Matrix4, Point2, RowVector4, Vector4};
use serde::{Deserialize, Serialize};

use crate::camera::{CameraMatrix, StereoRig};
use crate::correspondence::FrameCorrespondences;
use crate::error::{Result, StereoError};
use crate::pose::JointId;

/// 同次座標・特異値の相対しきい値
const DEGENERACY_TOLERANCE: f64 = 1e-9;

/// 三角測量された3D点（ワールド座標 = 左カメラ座標系）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
}

impl Point3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn homogeneous(&self) -> Vector4<f64> {
        Vector4::new(self.x, self.y, self.z, 1.0)
    }
}

/// 1フレーム分の三角測量結果。関節ID昇順
pub type TriangulatedFrame = BTreeMap<JointId, Point3D>;

/// 三角測量できなかった関節
#[derive(Debug)]
pub struct TriangulationFailure {
    pub frame: usize,
    pub joint: JointId,
    pub error: StereoError,
}

/// セッション全体の復元結果
#[derive(Debug, Default)]
pub struct SessionReconstruction {
    pub frames: Vec<TriangulatedFrame>,
    pub failures: Vec<TriangulationFailure>,
    /// 各点の左右平均リプロジェクションエラー（診断用）
    reprojection_errors: Vec<f64>,
}

impl SessionReconstruction {
    /// 全点の平均リプロジェクションエラー（ピクセル）。点がなければNone
    pub fn mean_reprojection_error(&self) -> Option<f64> {
        if self.reprojection_errors.is_empty() {
            return None;
        }
        Some(self.reprojection_errors.iter().sum::<f64>() / self.reprojection_errors.len() as f64)
    }

    pub fn point_count(&self) -> usize {
        self.frames.iter().map(|f| f.len()).sum()
    }
}

fn dlt_rows(p: Point2<f64>, m: &CameraMatrix) -> [RowVector4<f64>; 2] {
    // u * P[2] - P[0], v * P[2] - P[1]
    [
        m.row(2) * p.x - m.row(0),
        m.row(2) * p.y - m.row(1),
    ]
}

/// 2視点の対応点から DLT で3D点を復元
///
/// A (4x4) を SVD し、最小特異値に対応する右特異ベクトルを同次座標解とする。
/// w≈0（無限遠）や零空間が1次元でない場合は `DegenerateTriangulation`。
pub fn triangulate(
    p1: Point2<f64>,
    p2: Point2<f64>,
    m1: &CameraMatrix,
    m2: &CameraMatrix,
) -> Result<Point3D> {
    let finite_inputs = p1.iter().chain(p2.iter()).chain(m1.iter()).chain(m2.iter()).all(|v| v.is_finite());
    if !finite_inputs {
        return Err(StereoError::DegenerateTriangulation {
            reason: "non-finite input".to_string(),
        });
    }

    let [r0, r1] = dlt_rows(p1, m1);
    let [r2, r3] = dlt_rows(p2, m2);
    let a = Matrix4::from_rows(&[r0, r1, r2, r3]);

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or_else(|| StereoError::DegenerateTriangulation {
        reason: "SVD did not converge".to_string(),
    })?;

    // nalgebra の特異値は順序が保証されないので明示的に並べる
    let mut order = [0usize, 1, 2, 3];
    order.sort_by(|&i, &j| svd.singular_values[i].total_cmp(&svd.singular_values[j]));
    let smallest = order[0];
    let second = svd.singular_values[order[1]];
    let largest = svd.singular_values[order[3]];

    if largest <= 0.0 || second <= DEGENERACY_TOLERANCE * largest {
        return Err(StereoError::DegenerateTriangulation {
            reason: format!(
                "rank-deficient system (singular values {:?})",
                svd.singular_values.as_slice()
            ),
        });
    }

    let x = v_t.row(smallest).transpose();
    let w = x[3];
    if w.abs() <= DEGENERACY_TOLERANCE * x.norm() {
        return Err(StereoError::DegenerateTriangulation {
            reason: format!("homogeneous w = {:e} (point at infinity)", w),
        });
    }

    let point = Point3D::new(x[0] / w, x[1] / w, x[2] / w);
    if !(point.x.is_finite() && point.y.is_finite() && point.z.is_finite()) {
        return Err(StereoError::DegenerateTriangulation {
            reason: "non-finite solution".to_string(),
        });
    }

    // カメラ中心など主平面上の解は射影が定義できない
    let h = point.homogeneous();
    for (name, m) in [("left", m1), ("right", m2)] {
        let depth = (m * h)[2];
        if depth.abs() <= DEGENERACY_TOLERANCE * m.row(2).norm() * h.norm() {
            return Err(StereoError::DegenerateTriangulation {
                reason: format!("solution lies on the {} camera's principal plane", name),
            });
        }
    }
    Ok(point)
}

/// 3D点を射影し、観測点とのピクセル距離を返す
///
/// 点がカメラ平面上（投影 w≈0）なら無限大
pub fn reprojection_error(point: &Point3D, matrix: &CameraMatrix, observed: Point2<f64>) -> f64 {
    let projected = matrix * point.homogeneous();
    if projected[2].abs() < 1e-12 {
        return f64::INFINITY;
    }
    let u = projected[0] / projected[2];
    let v = projected[1] / projected[2];
    ((u - observed.x).powi(2) + (v - observed.y).powi(2)).sqrt()
}

/// 対応点列を全フレーム三角測量
///
/// 縮退した関節は `failures` に記録して続行する。対応点のないフレームは空のマップ。
pub fn triangulate_session(correspondences: &[FrameCorrespondences], rig: &StereoRig) -> SessionReconstruction {
    let mut result = SessionReconstruction::default();

    for (frame_idx, frame) in correspondences.iter().enumerate() {
        let mut points = TriangulatedFrame::new();

        for c in frame {
            match triangulate(c.a, c.b, &rig.left, &rig.right) {
                Ok(point) => {
                    let err_left = reprojection_error(&point, &rig.left, c.a);
                    let err_right = reprojection_error(&point, &rig.right, c.b);
                    let err = (err_left + err_right) / 2.0;
                    if err.is_finite() {
                        result.reprojection_errors.push(err);
                    }
                    points.insert(c.joint, point);
                }
                Err(error) => {
                    warn!("frame {} {}: {}", frame_idx, c.joint, error);
                    result.failures.push(TriangulationFailure {
                        frame: frame_idx,
                        joint: c.joint,
                        error,
                    });
                }
            }
        }

        debug!("frame {}: {} points triangulated", frame_idx, points.len());
        result.frames.push(points);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::build_rig;
    use crate::correspondence::Correspondence;

    fn project(m: &CameraMatrix, p: &Point3D) -> Point2<f64> {
        let h = m * p.homogeneous();
        Point2::new(h[0] / h[2], h[1] / h[2])
    }

    #[test]
    fn test_triangulate_recovers_point() {
        let rig = build_rig(10.0, 640.0, (320.0, 240.0)).unwrap();
        let target = Point3D::new(12.5, -7.0, 150.0);

        let p1 = project(&rig.left, &target);
        let p2 = project(&rig.right, &target);
        let point = triangulate(p1, p2, &rig.left, &rig.right).unwrap();

        assert!((point.x - 12.5).abs() < 1e-6, "x: expected 12.5, got {}", point.x);
        assert!((point.y + 7.0).abs() < 1e-6, "y: expected -7.0, got {}", point.y);
        assert!((point.z - 150.0).abs() < 1e-6, "z: expected 150.0, got {}", point.z);
    }

    #[test]
    fn test_triangulate_end_to_end_values() {
        let rig = build_rig(10.0, 640.0, (320.0, 240.0)).unwrap();
        let point = triangulate(
            Point2::new(100.0, 200.0),
            Point2::new(80.0, 200.0),
            &rig.left,
            &rig.right,
        )
        .unwrap();

        // 視差 20px → Z = 10 * 640 / 20
        assert!((point.z - 320.0).abs() < 1e-6, "z: {}", point.z);
        assert!((point.x + 110.0).abs() < 1e-6, "x: {}", point.x);
        assert!((point.y + 20.0).abs() < 1e-6, "y: {}", point.y);
    }

    #[test]
    fn test_identical_cameras_are_degenerate() {
        let rig = build_rig(0.0, 640.0, (320.0, 240.0)).unwrap();
        let p = Point2::new(100.0, 200.0);
        let result = triangulate(p, p, &rig.left, &rig.right);
        assert!(
            matches!(result, Err(StereoError::DegenerateTriangulation { .. })),
            "got {:?}",
            result
        );
    }

    #[test]
    fn test_camera_centre_solution_is_degenerate() {
        // 基線0で異なる観測 → 唯一の解は共通のカメラ中心
        let rig = build_rig(0.0, 640.0, (320.0, 240.0)).unwrap();
        let result = triangulate(
            Point2::new(100.0, 200.0),
            Point2::new(80.0, 200.0),
            &rig.left,
            &rig.right,
        );
        assert!(
            matches!(result, Err(StereoError::DegenerateTriangulation { .. })),
            "got {:?}",
            result
        );
    }

    #[test]
    fn test_point_at_infinity_is_degenerate() {
        // 視差0 → 無限遠
        let rig = build_rig(10.0, 640.0, (320.0, 240.0)).unwrap();
        let p = Point2::new(400.0, 240.0);
        let result = triangulate(p, p, &rig.left, &rig.right);
        assert!(matches!(result, Err(StereoError::DegenerateTriangulation { .. })));
    }

    #[test]
    fn test_non_finite_input_is_degenerate() {
        let rig = build_rig(10.0, 640.0, (320.0, 240.0)).unwrap();
        let result = triangulate(
            Point2::new(f64::NAN, 0.0),
            Point2::new(0.0, 0.0),
            &rig.left,
            &rig.right,
        );
        assert!(matches!(result, Err(StereoError::DegenerateTriangulation { .. })));
    }

    #[test]
    fn test_reprojection_error_zero_for_exact_point() {
        let rig = build_rig(10.0, 640.0, (320.0, 240.0)).unwrap();
        let target = Point3D::new(1.0, 2.0, 50.0);
        let observed = project(&rig.left, &target);
        assert!(reprojection_error(&target, &rig.left, observed) < 1e-9);

        let shifted = Point2::new(observed.x + 3.0, observed.y + 4.0);
        assert!((reprojection_error(&target, &rig.left, shifted) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_triangulate_session_records_failures() {
        let rig = build_rig(10.0, 640.0, (320.0, 240.0)).unwrap();
        let correspondences = vec![
            vec![
                Correspondence {
                    joint: JointId(0),
                    a: Point2::new(100.0, 200.0),
                    b: Point2::new(80.0, 200.0),
                },
                // 視差0 → 縮退
                Correspondence {
                    joint: JointId(3),
                    a: Point2::new(300.0, 100.0),
                    b: Point2::new(300.0, 100.0),
                },
            ],
            vec![],
        ];

        let result = triangulate_session(&correspondences, &rig);
        assert_eq!(result.frames.len(), 2);
        assert_eq!(result.frames[0].len(), 1);
        assert!(result.frames[0].contains_key(&JointId(0)));
        assert!(result.frames[1].is_empty());

        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].frame, 0);
        assert_eq!(result.failures[0].joint, JointId(3));

        let mean = result.mean_reprojection_error().unwrap();
        assert!(mean < 1e-6, "mean reprojection error: {}", mean);
        assert_eq!(result.point_count(), 1);
    }

    #[test]
    fn test_point3d_json_keys() {
        let json = serde_json::to_value(Point3D::new(1.0, 2.0, 3.0)).unwrap();
        assert_eq!(json, serde_json::json!({"X": 1.0, "Y": 2.0, "Z": 3.0}));
    }
}
