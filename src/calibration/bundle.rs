//! Levenberg-Marquardt による内部・歪み・外部パラメータの同時最適化

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::{debug, warn};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn, Matrix3, Point2, Point3, Vector3};

use super::zhang::ViewPose;
use crate::error::{Result, StereoError};

/// fx, fy, cx, cy, k1, k2, p1, p2, k3
const INTRINSIC_PARAMS: usize = 9;
/// rvec(3) + tvec(3)
const POSE_PARAMS: usize = 6;

/// 最適化結果
#[derive(Debug, Clone)]
pub struct RefinedModel {
    pub intrinsic: Matrix3<f64>,
    pub dist_coeffs: [f64; 5],
    pub poses: Vec<ViewPose>,
    /// RMS リプロジェクションエラー（ピクセル）
    pub rms: f64,
}

/// ボード座標の点を歪み込みで画像に投影
pub fn project_point(
    intrinsic: &Matrix3<f64>,
    dist: &[f64; 5],
    pose: &ViewPose,
    point: &Point3<f64>,
) -> Point2<f64> {
    project_with(
        [intrinsic[(0, 0)], intrinsic[(1, 1)], intrinsic[(0, 2)], intrinsic[(1, 2)]],
        dist,
        pose.transform(point),
    )
}

fn project_with(k: [f64; 4], dist: &[f64; 5], pc: Vector3<f64>) -> Point2<f64> {
    let [fx, fy, cx, cy] = k;
    let [k1, k2, p1, p2, k3] = *dist;
    let x = pc[0] / pc[2];
    let y = pc[1] / pc[2];
    let r2 = x * x + y * y;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
    let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
    Point2::new(fx * xd + cx, fy * yd + cy)
}

/// 観測データと現在のパラメータ
struct CalibrationProblem<'a> {
    object_points: &'a [Vec<Point3<f64>>],
    image_points: &'a [Vec<Point2<f64>>],
    params: DVector<f64>,
}

impl CalibrationProblem<'_> {
    fn residuals_at(&self, params: &DVector<f64>) -> DVector<f64> {
        let k = [params[0], params[1], params[2], params[3]];
        let dist = [params[4], params[5], params[6], params[7], params[8]];

        let n: usize = self.image_points.iter().map(|v| v.len()).sum();
        let mut out = DVector::zeros(2 * n);
        let mut row = 0;
        for (view, (obj, img)) in self.object_points.iter().zip(self.image_points).enumerate() {
            let pose = pose_from_params(params, view);
            for (p, observed) in obj.iter().zip(img) {
                let projected = project_with(k, &dist, pose.transform(p));
                out[row] = projected.x - observed.x;
                out[row + 1] = projected.y - observed.y;
                row += 2;
            }
        }
        out
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for CalibrationProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = self.residuals_at(&self.params);
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    /// 中心差分による数値ヤコビアン
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let base = self.residuals_at(&self.params);
        let mut jac = DMatrix::zeros(base.len(), self.params.len());
        let mut probe = self.params.clone();

        for j in 0..self.params.len() {
            let original = probe[j];
            let step = 1e-6 * original.abs().max(1.0);

            probe[j] = original + step;
            let plus = self.residuals_at(&probe);
            probe[j] = original - step;
            let minus = self.residuals_at(&probe);
            probe[j] = original;

            let column = (plus - minus) / (2.0 * step);
            jac.set_column(j, &column);
        }

        jac.iter().all(|v| v.is_finite()).then_some(jac)
    }
}

fn pose_from_params(params: &DVector<f64>, view: usize) -> ViewPose {
    let o = INTRINSIC_PARAMS + view * POSE_PARAMS;
    ViewPose::from_rvec(
        Vector3::new(params[o], params[o + 1], params[o + 2]),
        Vector3::new(params[o + 3], params[o + 4], params[o + 5]),
    )
}

fn pack(intrinsic: &Matrix3<f64>, dist: &[f64; 5], poses: &[ViewPose]) -> DVector<f64> {
    let mut params = DVector::zeros(INTRINSIC_PARAMS + POSE_PARAMS * poses.len());
    params[0] = intrinsic[(0, 0)];
    params[1] = intrinsic[(1, 1)];
    params[2] = intrinsic[(0, 2)];
    params[3] = intrinsic[(1, 2)];
    for (i, d) in dist.iter().enumerate() {
        params[4 + i] = *d;
    }
    for (view, pose) in poses.iter().enumerate() {
        let o = INTRINSIC_PARAMS + view * POSE_PARAMS;
        let rvec = pose.rvec();
        for i in 0..3 {
            params[o + i] = rvec[i];
            params[o + 3 + i] = pose.translation[i];
        }
    }
    params
}

fn rms_of(residuals: &DVector<f64>) -> f64 {
    let points = (residuals.len() / 2).max(1);
    (residuals.norm_squared() / points as f64).sqrt()
}

/// 初期値から全パラメータを最適化
pub fn refine(
    object_points: &[Vec<Point3<f64>>],
    image_points: &[Vec<Point2<f64>>],
    intrinsic: &Matrix3<f64>,
    poses: &[ViewPose],
) -> Result<RefinedModel> {
    let problem = CalibrationProblem {
        object_points,
        image_points,
        params: pack(intrinsic, &[0.0; 5], poses),
    };
    let initial_rms = rms_of(&problem.residuals_at(&problem.params));

    let lm = LevenbergMarquardt::new()
        .with_ftol(1e-12)
        .with_xtol(1e-12)
        .with_gtol(1e-12)
        .with_patience(200);
    let (problem, report) = lm.minimize(problem);

    let params = problem.params();
    if params.iter().any(|v| !v.is_finite()) {
        return Err(StereoError::CalibrationFailed(format!(
            "solver returned non-finite parameters ({:?})",
            report.termination
        )));
    }
    if !report.termination.was_successful() {
        warn!("LM terminated early: {:?}", report.termination);
    }

    let rms = rms_of(&problem.residuals_at(&params));
    debug!(
        "LM: {} evaluations, RMS {:.4} -> {:.4} px",
        report.number_of_evaluations, initial_rms, rms
    );

    let intrinsic = Matrix3::new(
        params[0], 0.0, params[2],
        0.0, params[1], params[3],
        0.0, 0.0, 1.0,
    );
    let dist_coeffs = [params[4], params[5], params[6], params[7], params[8]];
    let poses = (0..poses.len()).map(|v| pose_from_params(&params, v)).collect();

    Ok(RefinedModel {
        intrinsic,
        dist_coeffs,
        poses,
        rms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::zhang::tests::{board_points, synthetic_intrinsic, synthetic_poses};

    #[test]
    fn test_refine_recovers_distortion() {
        let k = synthetic_intrinsic();
        let dist = [-0.2, 0.05, 0.001, -0.0005, 0.0];
        let poses = synthetic_poses();
        let obj = board_points();

        let object_points = vec![obj.clone(); poses.len()];
        let image_points: Vec<Vec<Point2<f64>>> = poses
            .iter()
            .map(|pose| obj.iter().map(|p| project_point(&k, &dist, pose, p)).collect())
            .collect();

        // 少しずらした初期値から
        let mut k0 = k;
        k0[(0, 0)] *= 1.02;
        k0[(1, 1)] *= 0.98;
        let model = refine(&object_points, &image_points, &k0, &poses).unwrap();

        assert!(model.rms < 1e-2, "rms: {}", model.rms);
        assert!((model.intrinsic[(0, 0)] - 800.0).abs() < 4.0, "fx: {}", model.intrinsic[(0, 0)]);
        assert!((model.intrinsic[(1, 1)] - 780.0).abs() < 4.0, "fy: {}", model.intrinsic[(1, 1)]);
        assert!((model.dist_coeffs[0] + 0.2).abs() < 0.05, "k1: {}", model.dist_coeffs[0]);
    }
}
