//! サブピクセル位置での輝度サンプリング（勾配計算用）

use image::GrayImage;

/// 双線形補間の4近傍と重み
///
/// 範囲外は端の画素で補う（clamp-to-edge）
fn bilinear_taps(width: u32, height: u32, x: f64, y: f64) -> [(u32, u32, f64); 4] {
    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let x0 = x0 as u32;
    let y0 = y0 as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    [
        (x0, y0, (1.0 - fx) * (1.0 - fy)),
        (x1, y0, fx * (1.0 - fy)),
        (x0, y1, (1.0 - fx) * fy),
        (x1, y1, fx * fy),
    ]
}

/// グレースケール画像を (x, y) で双線形サンプリング
pub(crate) fn sample_gray(image: &GrayImage, x: f64, y: f64) -> f64 {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    bilinear_taps(w, h, x, y)
        .iter()
        .map(|&(px, py, weight)| image.get_pixel(px, py)[0] as f64 * weight)
        .sum()
}
