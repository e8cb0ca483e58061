use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use stereo_pose::calibration::{BoardSpec, CalibrationStore, OpenCvChessboardDetector};
use stereo_pose::config::Config;

const CONFIG_PATH: &str = "config.toml";

fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("ディレクトリを読めません: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    // Usage: calibrate <image_dir> [annotated_dir]
    if args.len() < 2 {
        bail!("使い方: calibrate <image_dir> [annotated_dir]");
    }
    let image_dir = PathBuf::from(&args[1]);
    let annotated_dir = args.get(2).map(PathBuf::from);

    let config = Config::load_or_default(CONFIG_PATH);
    let cal_config = &config.calibration;
    let mut store = CalibrationStore::new(BoardSpec::from_config(cal_config), OpenCvChessboardDetector)
        .with_min_images(cal_config.min_images);
    let board = store.board();

    println!("=== チェスボード キャリブレーションツール ===");
    println!();
    println!("ボード設定:");
    println!("  内部コーナー: {}x{}", board.cols, board.rows);
    println!("  マス辺長: {}", board.square_size);
    println!("  最小画像数: {}", store.min_images());
    println!("  出力先: {}", cal_config.output_path);
    println!();

    // [1/3] 画像収集
    println!("[1/3] 画像収集中: {}", image_dir.display());
    let paths = collect_images(&image_dir)?;
    if paths.is_empty() {
        bail!("画像が見つかりません: {}", image_dir.display());
    }
    println!("  {} 枚", paths.len());

    if let Some(dir) = &annotated_dir {
        fs::create_dir_all(dir)?;
    }

    // [2/3] コーナー検出
    println!("[2/3] コーナー検出中...");
    let mut image_shape = None;

    for path in &paths {
        let image = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                println!("  {} - 読み込み失敗: {}", path.display(), e);
                continue;
            }
        };

        let shape = (image.height(), image.width());
        if *image_shape.get_or_insert(shape) != shape {
            println!("  {} - サイズ不一致 ({}x{}), スキップ", path.display(), shape.1, shape.0);
            continue;
        }

        let (accepted, annotated) = store.add_calibration_image(&image)?;
        println!(
            "  {} - {}",
            path.display(),
            if accepted { "検出" } else { "未検出" }
        );

        if let (true, Some(dir)) = (accepted, &annotated_dir) {
            if let Some(name) = path.file_name() {
                annotated
                    .save(dir.join(name))
                    .with_context(|| format!("注釈画像を保存できません: {}", path.display()))?;
            }
        }
    }
    println!("  採用: {}/{}", store.accepted_images(), paths.len());

    // [3/3] キャリブレーション
    println!("[3/3] キャリブレーション中...");
    let Some(shape) = image_shape else {
        bail!("読み込めた画像がありません");
    };
    let calibration = store.calibrate(shape)?;
    let k = &calibration.camera_matrix;
    println!("  fx: {:.2}  fy: {:.2}", k[(0, 0)], k[(1, 1)]);
    println!("  cx: {:.2}  cy: {:.2}", k[(0, 2)], k[(1, 2)]);
    println!("  歪み係数: {:?}", calibration.dist_coeffs);
    if let Some(rms) = calibration.rms_error {
        println!("  再投影誤差 (RMS): {:.4} px", rms);
    }

    store.save(&cal_config.output_path)?;
    println!();
    println!("保存しました: {}", cal_config.output_path);

    Ok(())
}
