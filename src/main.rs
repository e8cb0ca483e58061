use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use stereo_pose::camera::StereoRig;
use stereo_pose::config::Config;
use stereo_pose::correspondence::align;
use stereo_pose::session::{load_session, save_triangulated_session, triangulated_path_for, SessionStore};
use stereo_pose::triangulation::triangulate_session;

const CONFIG_PATH: &str = "config.toml";

/// 拡張子のない引数はセッション名として出力ディレクトリから探す
fn resolve(store: &SessionStore, arg: &str) -> PathBuf {
    if Path::new(arg).extension().is_some() {
        PathBuf::from(arg)
    } else {
        store.session_path(arg)
    }
}

fn parse_args(store: &SessionStore) -> Result<(PathBuf, PathBuf, Option<PathBuf>)> {
    let args: Vec<String> = std::env::args().collect();
    // Usage: stereo-pose <view_a> <view_b> [out.json]
    // e.g.  stereo-pose recording_a recording_b
    if args.len() < 3 || args.len() > 4 {
        bail!("使い方: stereo-pose <view_a.json|名前> <view_b.json|名前> [out.json]");
    }
    Ok((
        resolve(store, &args[1]),
        resolve(store, &args[2]),
        args.get(3).map(PathBuf::from),
    ))
}

fn main() -> Result<()> {
    env_logger::init();

    let config = Config::load_or_default(CONFIG_PATH);
    let store = SessionStore::new(&config.output.directory);
    let (path_a, path_b, output) = parse_args(&store)?;

    println!("=== ステレオ 3D ポーズ復元 ===");
    println!();

    // [1/4] セッション読み込み
    println!("[1/4] セッション読み込み中...");
    let session_a = load_session(&path_a)
        .with_context(|| format!("視点Aを読めません: {}", path_a.display()))?;
    let session_b = load_session(&path_b)
        .with_context(|| format!("視点Bを読めません: {}", path_b.display()))?;
    println!("  視点A: {} フレーム", session_a.len());
    println!("  視点B: {} フレーム", session_b.len());

    // [2/4] リグ構築・対応付け
    println!("[2/4] 対応付け中...");
    let rig = StereoRig::from_config(&config.rig).context("リグ設定が不正です")?;
    let (cx, cy) = rig.principal_point();
    println!(
        "  基線長: {}  焦点距離: {}  主点: ({}, {})",
        rig.baseline,
        rig.focal_length(),
        cx,
        cy
    );
    let correspondences = align(&session_a, &session_b)?;
    let pairs: usize = correspondences.iter().map(|f| f.len()).sum();
    println!("  対応点: {}", pairs);

    // [3/4] 三角測量
    println!("[3/4] 三角測量中...");
    let reconstruction = triangulate_session(&correspondences, &rig);

    // [4/4] 保存
    let out_path = output.unwrap_or_else(|| triangulated_path_for(&path_a));
    println!("[4/4] 保存中: {}", out_path.display());
    save_triangulated_session(&reconstruction.frames, &out_path)?;

    println!();
    println!("=== 完了 ===");
    println!("  フレーム数: {}", reconstruction.frames.len());
    println!("  3D点: {}", reconstruction.point_count());
    println!("  失敗: {}", reconstruction.failures.len());
    match reconstruction.mean_reprojection_error() {
        Some(err) => println!("  平均再投影誤差: {:.4} px", err),
        None => println!("  平均再投影誤差: -"),
    }

    Ok(())
}
