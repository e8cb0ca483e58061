use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_with, Interpolation};
use nalgebra::{Matrix3, Vector3};

use super::rig::{projection_from_intrinsic, CameraMatrix};
use crate::error::{Result, StereoError};

/// 歪み補正の Newton-Raphson 反復回数
const UNDISTORT_ITERATIONS: usize = 30;

/// キャリブレーション済みカメラ（内部パラメータ + Brown-Conrady 歪み）
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedCamera {
    pub intrinsic: Matrix3<f64>,
    /// 歪み係数 [k1, k2, p1, p2, k3]
    pub dist_coeffs: [f64; 5],
    /// 画像サイズ (height, width)
    pub image_shape: (u32, u32),
}

impl CalibratedCamera {
    /// 歪み係数が5個未満なら0で埋め、超過分は無視する
    pub fn new(intrinsic: Matrix3<f64>, dist_coeffs: &[f64], image_shape: (u32, u32)) -> Self {
        let mut dc = [0.0; 5];
        for (dst, src) in dc.iter_mut().zip(dist_coeffs) {
            *dst = *src;
        }
        Self {
            intrinsic,
            dist_coeffs: dc,
            image_shape,
        }
    }

    pub fn fx(&self) -> f64 {
        self.intrinsic[(0, 0)]
    }

    pub fn fy(&self) -> f64 {
        self.intrinsic[(1, 1)]
    }

    pub fn cx(&self) -> f64 {
        self.intrinsic[(0, 2)]
    }

    pub fn cy(&self) -> f64 {
        self.intrinsic[(1, 2)]
    }

    /// 原点・無回転カメラとしての射影行列 K[I|0]
    pub fn projection(&self) -> CameraMatrix {
        projection_from_intrinsic(&self.intrinsic, Vector3::zeros())
    }

    fn has_distortion(&self) -> bool {
        self.dist_coeffs.iter().any(|&c| c != 0.0)
    }

    /// 正規化座標に順方向の歪みを適用
    pub fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist_coeffs;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        (
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// 歪んだピクセル座標を歪み補正して理想ピクセル座標に変換
    /// Newton-Raphson法による歪み補正（大きな歪み係数でも収束）
    pub fn undistort_point(&self, u_dist: f64, v_dist: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u_dist, v_dist);
        }

        let (fx, fy, cx, cy) = (self.fx(), self.fy(), self.cx(), self.cy());
        let [k1, k2, p1, p2, k3] = self.dist_coeffs;

        // ピクセル→正規化カメラ座標（歪みあり = ターゲット）
        let xd = (u_dist - cx) / fx;
        let yd = (v_dist - cy) / fy;

        let mut x = xd;
        let mut y = yd;
        let mut best = (x, y);
        let mut best_residual = f64::MAX;

        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            let dr_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let (dx_val, dy_val) = self.distort_normalized(x, y);
            let fx_val = dx_val - xd;
            let fy_val = dy_val - yd;

            let residual = fx_val * fx_val + fy_val * fy_val;
            if residual < best_residual {
                best_residual = residual;
                best = (x, y);
            }
            if residual < 1e-24 {
                break;
            }

            // ヤコビアン（j01 == j10）
            let j00 = radial + 2.0 * x * x * dr_dr2 + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * dr_dr2 + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * dr_dr2 + 6.0 * p1 * y + 2.0 * p2 * x;

            let det = j00 * j11 - j01 * j01;
            if det.abs() < 1e-15 {
                break;
            }

            x -= (j11 * fx_val - j01 * fy_val) / det;
            y -= (-j01 * fx_val + j00 * fy_val) / det;
        }

        (best.0 * fx + cx, best.1 * fy + cy)
    }

    /// 画像全体の歪み補正
    ///
    /// 出力画素ごとに歪みモデルで元画像の位置を求め、双線形補間で埋める。
    /// 新しいカメラ行列は元の K。元画像外に落ちる画素は黒。
    pub fn undistort(&self, image: &RgbImage) -> RgbImage {
        if !self.has_distortion() {
            return image.clone();
        }
        let (fx, fy, cx, cy) = (self.fx(), self.fy(), self.cx(), self.cy());

        warp_with(
            image,
            |u, v| {
                let x = (u as f64 - cx) / fx;
                let y = (v as f64 - cy) / fy;
                let (xd, yd) = self.distort_normalized(x, y);
                ((xd * fx + cx) as f32, (yd * fy + cy) as f32)
            },
            Interpolation::Bilinear,
            Rgb([0, 0, 0]),
        )
    }
}

/// キャリブレーションの有無を持つカメラ
#[derive(Debug, Clone, Default)]
pub struct CameraModel {
    calibration: Option<CalibratedCamera>,
}

impl CameraModel {
    pub fn uncalibrated() -> Self {
        Self::default()
    }

    pub fn calibrated(camera: CalibratedCamera) -> Self {
        Self {
            calibration: Some(camera),
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration(&self) -> Option<&CalibratedCamera> {
        self.calibration.as_ref()
    }

    pub fn set_calibration(&mut self, camera: CalibratedCamera) {
        self.calibration = Some(camera);
    }

    /// 歪み補正済みの新しい画像を返す。入力は変更しない
    pub fn undistort(&self, image: &RgbImage) -> Result<RgbImage> {
        let camera = self.calibration.as_ref().ok_or(StereoError::NotCalibrated)?;
        Ok(camera.undistort(image))
    }
}
