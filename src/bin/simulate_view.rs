use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use stereo_pose::config::Config;
use stereo_pose::session::{flipped_path_for, load_session, save_session};
use stereo_pose::simulate::simulate_second_view;

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    // Usage: simulate_view <session.json> [width]
    if args.len() < 2 {
        bail!("使い方: simulate_view <session.json> [width]");
    }
    let input = PathBuf::from(&args[1]);
    let config = Config::load_or_default(CONFIG_PATH);
    let width: i32 = match args.get(2) {
        Some(w) => w.parse().with_context(|| format!("幅が不正です: {}", w))?,
        None => config.rig.image_width as i32,
    };

    println!("=== 第2視点シミュレーション ===");
    let session = load_session(&input)
        .with_context(|| format!("セッションを読めません: {}", input.display()))?;
    println!("  入力: {} ({} フレーム)", input.display(), session.len());

    let flipped = simulate_second_view(&session, width);
    let output = flipped_path_for(&input);
    save_session(&flipped, &output)?;
    println!("  左右反転 (幅 {}) → {}", width, output.display());

    Ok(())
}
