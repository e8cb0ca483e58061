use nalgebra::{Matrix3, Matrix3x4, Vector3};

use crate::config::RigConfig;
use crate::error::{Result, StereoError};

/// 射影行列 P = K[R|t] (3x4)
pub type CameraMatrix = Matrix3x4<f64>;

/// 回転なしの平行ステレオリグ
///
/// 左カメラが原点、右カメラはX軸方向に `baseline` だけずれている。
#[derive(Debug, Clone, PartialEq)]
pub struct StereoRig {
    pub left: CameraMatrix,
    pub right: CameraMatrix,
    pub baseline: f64,
    /// 内部パラメータ行列 K（両カメラ共通）
    pub intrinsic: Matrix3<f64>,
}

/// 焦点距離と主点から理想ピンホールの K を作る
pub fn pinhole_intrinsic(focal_length: f64, principal_point: (f64, f64)) -> Matrix3<f64> {
    let (cx, cy) = principal_point;
    Matrix3::new(
        focal_length, 0.0, cx,
        0.0, focal_length, cy,
        0.0, 0.0, 1.0,
    )
}

/// P = K * [I | t]
pub fn projection_from_intrinsic(intrinsic: &Matrix3<f64>, translation: Vector3<f64>) -> CameraMatrix {
    let mut rt = Matrix3x4::zeros();
    for i in 0..3 {
        rt[(i, i)] = 1.0;
        rt[(i, 3)] = translation[i];
    }
    intrinsic * rt
}

/// 焦点距離・主点・基線長からステレオリグを構築
///
/// - left  = [[f,0,cx,0],[0,f,cy,0],[0,0,1,0]]
/// - right = 同じ内部パラメータで P[0,3] = -f * baseline
pub fn build_rig(baseline: f64, focal_length: f64, principal_point: (f64, f64)) -> Result<StereoRig> {
    if !(focal_length > 0.0) || !focal_length.is_finite() {
        return Err(StereoError::InvalidParameter(format!(
            "focal length must be positive, got {}",
            focal_length
        )));
    }
    Ok(StereoRig::from_intrinsic(pinhole_intrinsic(focal_length, principal_point), baseline))
}

impl StereoRig {
    /// 任意の K（キャリブレーション結果など）から構築
    pub fn from_intrinsic(intrinsic: Matrix3<f64>, baseline: f64) -> Self {
        let left = projection_from_intrinsic(&intrinsic, Vector3::zeros());
        let right = projection_from_intrinsic(&intrinsic, Vector3::new(-baseline, 0.0, 0.0));
        Self {
            left,
            right,
            baseline,
            intrinsic,
        }
    }

    /// 設定の [rig] セクションから構築
    pub fn from_config(config: &RigConfig) -> Result<Self> {
        build_rig(config.baseline, config.focal_length(), config.principal_point())
    }

    pub fn focal_length(&self) -> f64 {
        self.intrinsic[(0, 0)]
    }

    pub fn principal_point(&self) -> (f64, f64) {
        (self.intrinsic[(0, 2)], self.intrinsic[(1, 2)])
    }
}
