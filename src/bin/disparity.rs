use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use stereo_pose::camera::StereoRig;
use stereo_pose::config::Config;
use stereo_pose::ply::write_point_cloud;
use stereo_pose::stereo::{compute_disparity, depth_from_disparity, depth_to_point_cloud, BlockMatchParams};

const CONFIG_PATH: &str = "config.toml";
/// 点群に含める最大深度（基線長と同じ単位）
const MAX_CLOUD_DEPTH: f64 = 10_000.0;

struct Args {
    left: PathBuf,
    right: PathBuf,
    output: PathBuf,
    ply: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    // Usage: disparity <left> <right> <disparity.png> [--ply cloud.ply]
    if args.len() != 4 && !(args.len() == 6 && args[4] == "--ply") {
        bail!("使い方: disparity <left> <right> <disparity.png> [--ply cloud.ply]");
    }
    Ok(Args {
        left: PathBuf::from(&args[1]),
        right: PathBuf::from(&args[2]),
        output: PathBuf::from(&args[3]),
        ply: args.get(5).map(PathBuf::from),
    })
}

fn main() -> Result<()> {
    env_logger::init();

    let args = parse_args()?;
    let config = Config::load_or_default(CONFIG_PATH);
    let params = BlockMatchParams::from(&config.stereo);

    println!("=== 視差マップ計算 ===");
    println!(
        "  min_disparity: {}  num_disparities: {}  block_size: {}",
        params.min_disparity, params.num_disparities, params.block_size
    );

    // [1/3] 画像読み込み
    println!("[1/3] 画像読み込み中...");
    let left = image::open(&args.left)
        .with_context(|| format!("左画像を読めません: {}", args.left.display()))?;
    let right = image::open(&args.right)
        .with_context(|| format!("右画像を読めません: {}", args.right.display()))?;
    println!("  {}x{}", left.width(), left.height());

    // [2/3] ブロックマッチング
    println!("[2/3] ブロックマッチング中...");
    let maps = compute_disparity(&left, &right, &params)?;
    maps.normalized
        .save(&args.output)
        .with_context(|| format!("保存に失敗: {}", args.output.display()))?;
    println!("  視差マップ → {}", args.output.display());

    // [3/3] 点群（任意）
    if let Some(ply_path) = &args.ply {
        println!("[3/3] 点群出力中...");
        let rig = StereoRig::from_config(&config.rig).context("リグ設定が不正です")?;
        let depth = depth_from_disparity(&maps.raw, rig.baseline, rig.focal_length());
        let (cx, cy) = rig.principal_point();
        let color = left.to_rgb8();
        let points = depth_to_point_cloud(&depth, Some(&color), (rig.focal_length(), cx, cy), MAX_CLOUD_DEPTH);
        write_point_cloud(ply_path, &points)?;
        println!("  {} 点 → {}", points.len(), ply_path.display());
    } else {
        println!("[3/3] 点群出力はスキップ (--ply 未指定)");
    }

    Ok(())
}
