//! Zhang 法による閉形式の初期推定
//!
//! 1. 各ビューのホモグラフィ（Hartley 正規化 DLT）
//! 2. 絶対円錐像 B から内部パラメータ（スキュー0）
//! 3. K⁻¹H から外部パラメータ（SVD で直交化）

use nalgebra::{DMatrix, Matrix3, Point2, Point3, Rotation3, Vector3};

use crate::error::{Result, StereoError};

/// 1ビューの外部パラメータ（ボード座標系→カメラ座標系）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewPose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl ViewPose {
    /// Rodrigues 回転ベクトル
    pub fn rvec(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    pub fn from_rvec(rvec: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: Rotation3::new(rvec),
            translation,
        }
    }

    pub fn transform(&self, p: &Point3<f64>) -> Vector3<f64> {
        self.rotation * p.coords + self.translation
    }
}

fn failed(reason: &str) -> StereoError {
    StereoError::CalibrationFailed(reason.to_string())
}

/// 最小特異値に対応する右特異ベクトル
fn null_vector(a: DMatrix<f64>) -> Result<Vec<f64>> {
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or_else(|| failed("SVD did not converge"))?;
    let (idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or_else(|| failed("empty system"))?;
    Ok(v_t.row(idx).iter().copied().collect())
}

fn normalize_points_hartley(points: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let scale = if mean_dist > 1e-18 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * scale, (p.y - mean_y) * scale))
        .collect();
    let t = Matrix3::new(
        scale, 0.0, -mean_x * scale,
        0.0, scale, -mean_y * scale,
        0.0, 0.0, 1.0,
    );
    (normalized, t)
}

/// 平面上の点 src → 画像点 dst のホモグラフィ
pub fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return Err(failed("homography needs at least 4 paired points"));
    }

    let (src_n, ts) = normalize_points_hartley(src);
    let (dst_n, td) = normalize_points_hartley(dst);

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let (x, y) = (src_n[i].x, src_n[i].y);
        let (u, v) = (dst_n[i].x, dst_n[i].y);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let h = null_vector(a)?;
    let hn = Matrix3::from_row_slice(&h);
    let td_inv = td.try_inverse().ok_or_else(|| failed("degenerate image points"))?;
    let mut h = td_inv * hn * ts;
    if h[(2, 2)].abs() < 1e-12 {
        return Err(failed("degenerate homography"));
    }
    h /= h[(2, 2)];
    Ok(h)
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    [
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    ]
}

/// ホモグラフィ群から内部パラメータ K（スキュー0）
pub fn intrinsics_from_homographies(homographies: &[Matrix3<f64>]) -> Result<Matrix3<f64>> {
    if homographies.len() < 3 {
        return Err(failed("need at least 3 homographies"));
    }

    // 最終行はスキュー0の拘束 B12 = 0
    let rows = 2 * homographies.len() + 1;
    let mut v = DMatrix::<f64>::zeros(rows, 6);
    for (i, h) in homographies.iter().enumerate() {
        let v12 = v_ij(h, 0, 1);
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        for j in 0..6 {
            v[(2 * i, j)] = v12[j];
            v[(2 * i + 1, j)] = v11[j] - v22[j];
        }
    }
    v[(rows - 1, 1)] = 1.0;

    let mut b = null_vector(v)?;
    // 零空間の符号は任意。B11 > 0 に揃える
    if b[0] < 0.0 {
        b.iter_mut().for_each(|x| *x = -*x);
    }
    let [b11, b12, b22, b13, b23, b33] = [b[0], b[1], b[2], b[3], b[4], b[5]];

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-18 || b11.abs() < 1e-18 {
        return Err(failed("degenerate conic system"));
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda <= 0.0 || !lambda.is_finite() {
        return Err(failed("invalid conic scale"));
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let u0 = -b13 * alpha * alpha / lambda;

    let k = Matrix3::new(alpha, 0.0, u0, 0.0, beta, v0, 0.0, 0.0, 1.0);
    if k.iter().any(|x| !x.is_finite()) {
        return Err(failed("non-finite intrinsics"));
    }
    Ok(k)
}

/// K⁻¹H から外部パラメータ
pub fn pose_from_homography(k_inv: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<ViewPose> {
    let r1_raw = k_inv * h.column(0);
    let r2_raw = k_inv * h.column(1);
    let t_raw = k_inv * h.column(2);

    let mut scale = 1.0 / r1_raw.norm().max(1e-18);
    // ボードはカメラ前方（t_z > 0）
    if t_raw[2] * scale < 0.0 {
        scale = -scale;
    }

    let r1 = r1_raw * scale;
    let r2 = r2_raw * scale;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = r.svd(true, true);
    let u = svd.u.ok_or_else(|| failed("SVD U missing"))?;
    let v_t = svd.v_t.ok_or_else(|| failed("SVD V^T missing"))?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        r = -r;
    }

    Ok(ViewPose {
        rotation: Rotation3::from_matrix_unchecked(r),
        translation: t_raw * scale,
    })
}

/// 全ビューから K と各ビューの姿勢を推定
pub fn initial_estimate(
    object_points: &[Vec<Point3<f64>>],
    image_points: &[Vec<Point2<f64>>],
) -> Result<(Matrix3<f64>, Vec<ViewPose>)> {
    let homographies = object_points
        .iter()
        .zip(image_points)
        .map(|(obj, img)| {
            let planar: Vec<Point2<f64>> = obj.iter().map(|p| Point2::new(p.x, p.y)).collect();
            estimate_homography(&planar, img)
        })
        .collect::<Result<Vec<_>>>()?;

    let k = intrinsics_from_homographies(&homographies)?;
    let k_inv = k.try_inverse().ok_or_else(|| failed("singular intrinsic matrix"))?;
    let poses = homographies
        .iter()
        .map(|h| pose_from_homography(&k_inv, h))
        .collect::<Result<Vec<_>>>()?;

    Ok((k, poses))
}
