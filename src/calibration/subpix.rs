use image::GrayImage;
use nalgebra::Point2;

use crate::sampling::sample_gray;

/// サブピクセル探索窓の半径（11x11 窓）
pub const SUBPIX_HALF_WINDOW: i32 = 5;
/// 最大反復回数
pub const SUBPIX_MAX_ITERATIONS: usize = 30;
/// 1反復の移動量がこれ未満なら収束
pub const SUBPIX_EPSILON: f64 = 0.001;

/// コーナー位置をサブピクセル精度に補正
///
/// 窓内の各点 p について、勾配 g(p) と (p - q) が直交するような q を
/// 最小二乗で求め直す。窓の外へ動いたコーナーは元の位置に戻す。
pub fn refine_corners_subpix(gray: &GrayImage, corners: &[Point2<f64>]) -> Vec<Point2<f64>> {
    let half = SUBPIX_HALF_WINDOW;
    let coeff = 1.0 / (half * half) as f64;
    let weights: Vec<f64> = (-half..=half).map(|i| (-(i * i) as f64 * coeff).exp()).collect();

    corners
        .iter()
        .map(|&start| {
            let mut current = start;

            for _ in 0..SUBPIX_MAX_ITERATIONS {
                let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
                let (mut bb1, mut bb2) = (0.0, 0.0);

                for (iy, dy) in (-half..=half).enumerate() {
                    for (ix, dx) in (-half..=half).enumerate() {
                        let px = current.x + dx as f64;
                        let py = current.y + dy as f64;
                        let gx = (sample_gray(gray, px + 1.0, py) - sample_gray(gray, px - 1.0, py)) / 2.0;
                        let gy = (sample_gray(gray, px, py + 1.0) - sample_gray(gray, px, py - 1.0)) / 2.0;
                        let m = weights[iy] * weights[ix];

                        let gxx = gx * gx * m;
                        let gxy = gx * gy * m;
                        let gyy = gy * gy * m;
                        a += gxx;
                        b += gxy;
                        c += gyy;
                        bb1 += gxx * px + gxy * py;
                        bb2 += gxy * px + gyy * py;
                    }
                }

                let det = a * c - b * b;
                if det.abs() <= f64::EPSILON * (a * c).abs().max(1.0) {
                    break;
                }

                let next = Point2::new((c * bb1 - b * bb2) / det, (a * bb2 - b * bb1) / det);
                let shift = (next - current).norm_squared();
                current = next;
                if shift < SUBPIX_EPSILON * SUBPIX_EPSILON {
                    break;
                }
            }

            let limit = half as f64;
            if !current.x.is_finite()
                || !current.y.is_finite()
                || (current.x - start.x).abs() > limit
                || (current.y - start.y).abs() > limit
            {
                start
            } else {
                current
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::filter::gaussian_blur_f32;

    /// (cx, cy) を交点とする市松模様を 8x8 スーパーサンプリングで描画
    fn render_corner(width: u32, height: u32, cx: f64, cy: f64) -> GrayImage {
        const SS: u32 = 8;
        GrayImage::from_fn(width, height, |x, y| {
            let mut acc = 0.0;
            for sy in 0..SS {
                for sx in 0..SS {
                    let px = x as f64 - 0.5 + (sx as f64 + 0.5) / SS as f64;
                    let py = y as f64 - 0.5 + (sy as f64 + 0.5) / SS as f64;
                    let white = (px > cx) == (py > cy);
                    acc += if white { 220.0 } else { 30.0 };
                }
            }
            Luma([(acc / (SS * SS) as f64).round() as u8])
        })
    }

    #[test]
    fn test_refine_recovers_corner() {
        let (cx, cy) = (20.3, 19.6);
        let image = gaussian_blur_f32(&render_corner(41, 41, cx, cy), 1.0);

        let guess = Point2::new(21.5, 18.3);
        let refined = refine_corners_subpix(&image, &[guess]);

        let err = ((refined[0].x - cx).powi(2) + (refined[0].y - cy).powi(2)).sqrt();
        assert!(err < 0.25, "refined {:?}, expected ({}, {}), error {}", refined[0], cx, cy, err);
    }

    #[test]
    fn test_flat_image_keeps_corner() {
        let image = GrayImage::from_pixel(30, 30, Luma([128]));
        let corner = Point2::new(12.25, 14.75);
        assert_eq!(refine_corners_subpix(&image, &[corner]), vec![corner]);
    }
}
