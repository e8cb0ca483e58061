//! 密なステレオ視差・深度
//!
//! SAD ブロックマッチング（WTA + パラボラ補間）で視差を求め、
//! `depth = baseline * f / disparity` で深度に変換する。

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use log::debug;
use ndarray::Array2;

use crate::config::StereoConfig;
use crate::error::{Result, StereoError};
use crate::triangulation::Point3D;

/// 視差0・負値の代わりに使う下限
pub const DISPARITY_EPSILON: f32 = 0.1;

/// ブロックマッチングのパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatchParams {
    pub min_disparity: i32,
    /// 探索幅（16の正の倍数）
    pub num_disparities: i32,
    /// ブロックサイズ（5以上の奇数）
    pub block_size: i32,
}

impl Default for BlockMatchParams {
    fn default() -> Self {
        Self {
            min_disparity: 0,
            num_disparities: 64,
            block_size: 5,
        }
    }
}

impl From<&StereoConfig> for BlockMatchParams {
    fn from(config: &StereoConfig) -> Self {
        Self {
            min_disparity: config.min_disparity,
            num_disparities: config.num_disparities,
            block_size: config.block_size,
        }
    }
}

impl BlockMatchParams {
    pub fn validate(&self) -> Result<()> {
        if self.num_disparities <= 0 || self.num_disparities % 16 != 0 {
            return Err(StereoError::InvalidParameter(format!(
                "num_disparities must be a positive multiple of 16, got {}",
                self.num_disparities
            )));
        }
        // 無効値 (min - 1) と探索上限 (min + num) が i32 に収まること
        let in_range = self
            .min_disparity
            .checked_sub(1)
            .and(self.min_disparity.checked_add(self.num_disparities))
            .is_some();
        if !in_range {
            return Err(StereoError::InvalidParameter(format!(
                "min_disparity out of range, got {}",
                self.min_disparity
            )));
        }
        if self.block_size < 5 || self.block_size % 2 == 0 {
            return Err(StereoError::InvalidParameter(format!(
                "block_size must be odd and >= 5, got {}",
                self.block_size
            )));
        }
        Ok(())
    }

    /// 無効画素に入る値
    pub fn invalid_disparity(&self) -> f32 {
        (i64::from(self.min_disparity) - 1) as f32
    }
}

/// 生の視差マップと 0..255 に正規化した表示用マップ
#[derive(Debug, Clone)]
pub struct DisparityMaps {
    pub raw: Array2<f32>,
    pub normalized: GrayImage,
}

fn luma_array(image: &DynamicImage) -> Array2<f32> {
    let gray = image.to_luma8();
    let (w, h) = gray.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| gray.get_pixel(x as u32, y as u32)[0] as f32)
}

/// 積分画像 (h+1)x(w+1)
fn integral(values: &Array2<f32>) -> Array2<f64> {
    let (h, w) = values.dim();
    let mut sum = Array2::<f64>::zeros((h + 1, w + 1));
    for y in 0..h {
        let mut row = 0.0;
        for x in 0..w {
            row += values[[y, x]] as f64;
            sum[[y + 1, x + 1]] = sum[[y, x + 1]] + row;
        }
    }
    sum
}

fn box_sum(sum: &Array2<f64>, y0: usize, x0: usize, y1: usize, x1: usize) -> f64 {
    // [y0, y1) x [x0, x1)
    sum[[y1, x1]] - sum[[y0, x1]] - sum[[y1, x0]] + sum[[y0, x0]]
}

/// 左右画像から視差マップを計算
///
/// 左画像の画素 x を右画像の x - d と比較する。
/// ブロックや探索範囲が画像外にはみ出す画素は `min_disparity - 1`。
pub fn compute_disparity(
    left: &DynamicImage,
    right: &DynamicImage,
    params: &BlockMatchParams,
) -> Result<DisparityMaps> {
    params.validate()?;
    if left.width() != right.width() || left.height() != right.height() {
        return Err(StereoError::InvalidParameter(format!(
            "image sizes differ: {}x{} vs {}x{}",
            left.width(),
            left.height(),
            right.width(),
            right.height()
        )));
    }

    let l = luma_array(left);
    let r = luma_array(right);
    let (h, w) = l.dim();
    let invalid = params.invalid_disparity();
    let mut raw = Array2::<f32>::from_elem((h, w), invalid);

    let half = (params.block_size / 2) as i64;
    let d_min = params.min_disparity as i64;
    let d_max = d_min + params.num_disparities as i64 - 1;

    // 全探索範囲でブロックが収まる画素範囲
    let x_lo = half.max(half + d_max);
    let x_hi = (w as i64 - 1 - half).min(w as i64 - 1 - half + d_min);
    let y_lo = half;
    let y_hi = h as i64 - 1 - half;

    if x_lo > x_hi || y_lo > y_hi {
        debug!("no pixel fits the search window ({}x{})", w, h);
        return Ok(DisparityMaps {
            normalized: normalize_minmax(&raw),
            raw,
        });
    }

    let mut best_cost = Array2::<f64>::from_elem((h, w), f64::INFINITY);
    let mut best_d = Array2::<i64>::from_elem((h, w), d_min);
    let mut prev_cost = Array2::<f64>::from_elem((h, w), f64::NAN);
    let mut cost_minus = Array2::<f64>::from_elem((h, w), f64::NAN);
    let mut cost_plus = Array2::<f64>::from_elem((h, w), f64::NAN);

    let mut diff = Array2::<f32>::zeros((h, w));
    for d in d_min..=d_max {
        for y in 0..h {
            for x in 0..w {
                let xr = x as i64 - d;
                diff[[y, x]] = if xr >= 0 && xr < w as i64 {
                    (l[[y, x]] - r[[y, xr as usize]]).abs()
                } else {
                    0.0
                };
            }
        }
        let sum = integral(&diff);

        for y in y_lo..=y_hi {
            for x in x_lo..=x_hi {
                let (yu, xu) = (y as usize, x as usize);
                let cost = box_sum(
                    &sum,
                    (y - half) as usize,
                    (x - half) as usize,
                    (y + half + 1) as usize,
                    (x + half + 1) as usize,
                );

                if d > d_min && best_d[[yu, xu]] == d - 1 {
                    cost_plus[[yu, xu]] = cost;
                }
                if cost < best_cost[[yu, xu]] {
                    best_cost[[yu, xu]] = cost;
                    best_d[[yu, xu]] = d;
                    cost_minus[[yu, xu]] = prev_cost[[yu, xu]];
                    cost_plus[[yu, xu]] = f64::NAN;
                }
                prev_cost[[yu, xu]] = cost;
            }
        }
    }

    for y in y_lo..=y_hi {
        for x in x_lo..=x_hi {
            let (yu, xu) = (y as usize, x as usize);
            let c = best_cost[[yu, xu]];
            let cm = cost_minus[[yu, xu]];
            let cp = cost_plus[[yu, xu]];
            let mut disparity = best_d[[yu, xu]] as f64;

            // パラボラ補間
            if cm.is_finite() && cp.is_finite() {
                let denom = cm - 2.0 * c + cp;
                if denom > 1e-9 {
                    disparity += ((cm - cp) / (2.0 * denom)).clamp(-0.5, 0.5);
                }
            }
            raw[[yu, xu]] = disparity as f32;
        }
    }

    debug!(
        "disparity computed: {}x{}, d in [{}, {}]",
        w, h, d_min, d_max
    );

    Ok(DisparityMaps {
        normalized: normalize_minmax(&raw),
        raw,
    })
}

/// min-max で 0..255 に伸長。一定値なら全0
pub fn normalize_minmax(values: &Array2<f32>) -> GrayImage {
    let (h, w) = values.dim();
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let min = finite.clone().fold(f32::INFINITY, f32::min);
    let max = finite.fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let v = values[[y as usize, x as usize]];
        if !(range > 0.0) || !v.is_finite() {
            return Luma([0]);
        }
        Luma([((v - min) / range * 255.0).round().clamp(0.0, 255.0) as u8])
    })
}

/// 視差→深度。視差は `DISPARITY_EPSILON` で下限を取るので常に有限
pub fn depth_from_disparity(disparity: &Array2<f32>, baseline: f64, focal_length: f64) -> Array2<f32> {
    let scale = baseline * focal_length;
    disparity.mapv(|d| (scale / d.max(DISPARITY_EPSILON) as f64) as f32)
}

/// 深度マップを点群に逆投影
///
/// 深度が非有限または `max_depth` 以上の画素は捨てる。色画像がなければ白。
pub fn depth_to_point_cloud(
    depth: &Array2<f32>,
    color: Option<&RgbImage>,
    intrinsics: (f64, f64, f64),
    max_depth: f64,
) -> Vec<(Point3D, [u8; 3])> {
    let (f, cx, cy) = intrinsics;
    let mut points = Vec::new();

    for ((y, x), &z) in depth.indexed_iter() {
        let z = z as f64;
        if !z.is_finite() || z >= max_depth {
            continue;
        }
        let point = Point3D::new((x as f64 - cx) * z / f, (y as f64 - cy) * z / f, z);
        let rgb = color
            .and_then(|img| img.get_pixel_checked(x as u32, y as u32))
            .map(|p| p.0)
            .unwrap_or([255, 255, 255]);
        points.push((point, rgb));
    }

    points
}
