use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub rig: RigConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub stereo: StereoConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// ステレオリグ（2台の平行カメラ）
#[derive(Debug, Deserialize, Clone)]
pub struct RigConfig {
    /// カメラ間距離（cm）
    #[serde(default = "default_baseline")]
    pub baseline: f64,
    /// 焦点距離（ピクセル）。未指定なら画像幅
    #[serde(default)]
    pub focal_length: Option<f64>,
    /// 主点 [cx, cy]。未指定なら画像中心
    #[serde(default)]
    pub principal_point: Option<[f64; 2]>,
    #[serde(default = "default_image_width")]
    pub image_width: u32,
    #[serde(default = "default_image_height")]
    pub image_height: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// チェスボード内部コーナー数（横）
    #[serde(default = "default_board_cols")]
    pub board_cols: u32,
    /// チェスボード内部コーナー数（縦）
    #[serde(default = "default_board_rows")]
    pub board_rows: u32,
    /// マス辺長（cm）
    #[serde(default = "default_square_size")]
    pub square_size: f64,
    /// キャリブレーションに必要な最小画像数（5未満は5に切り上げ）
    #[serde(default = "default_min_images")]
    pub min_images: usize,
    /// 保存先パス
    #[serde(default = "default_calibration_output")]
    pub output_path: String,
}

/// ブロックマッチングのパラメータ
#[derive(Debug, Deserialize, Clone)]
pub struct StereoConfig {
    #[serde(default)]
    pub min_disparity: i32,
    /// 16の倍数
    #[serde(default = "default_num_disparities")]
    pub num_disparities: i32,
    /// 奇数、5以上
    #[serde(default = "default_block_size")]
    pub block_size: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// キーポイント・3Dポーズの保存先ディレクトリ
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
}

fn default_baseline() -> f64 { 10.0 }
fn default_image_width() -> u32 { 640 }
fn default_image_height() -> u32 { 480 }
fn default_board_cols() -> u32 { 9 }
fn default_board_rows() -> u32 { 6 }
fn default_square_size() -> f64 { 2.5 }
fn default_min_images() -> usize { 5 }
fn default_calibration_output() -> String { "camera_calibration.json".to_string() }
fn default_num_disparities() -> i32 { 64 }
fn default_block_size() -> i32 { 5 }
fn default_output_directory() -> PathBuf { PathBuf::from("assets/keypoints") }

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            baseline: default_baseline(),
            focal_length: None,
            principal_point: None,
            image_width: default_image_width(),
            image_height: default_image_height(),
        }
    }
}

impl RigConfig {
    pub fn focal_length(&self) -> f64 {
        self.focal_length.unwrap_or(self.image_width as f64)
    }

    pub fn principal_point(&self) -> (f64, f64) {
        match self.principal_point {
            Some([cx, cy]) => (cx, cy),
            None => (self.image_width as f64 / 2.0, self.image_height as f64 / 2.0),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            board_cols: default_board_cols(),
            board_rows: default_board_rows(),
            square_size: default_square_size(),
            min_images: default_min_images(),
            output_path: default_calibration_output(),
        }
    }
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            min_disparity: 0,
            num_disparities: default_num_disparities(),
            block_size: default_block_size(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// 読めなければデフォルト設定
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("config {} not loaded, using defaults: {:#}", path.as_ref().display(), e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("/nonexistent/config.toml");
        assert_eq!(config.rig.baseline, 10.0);
        assert_eq!(config.calibration.board_cols, 9);
        assert_eq!(config.calibration.board_rows, 6);
        assert_eq!(config.stereo.num_disparities, 64);
        assert_eq!(config.output.directory, PathBuf::from("assets/keypoints"));
    }

    #[test]
    fn test_partial_toml_overrides_only_given_keys() {
        let config: Config = toml::from_str(
            r#"
            [rig]
            baseline = 5.0
            focal_length = 800.0

            [stereo]
            block_size = 9
            "#,
        )
        .unwrap();
        assert_eq!(config.rig.baseline, 5.0);
        assert_eq!(config.rig.focal_length(), 800.0);
        assert_eq!(config.rig.principal_point(), (320.0, 240.0));
        assert_eq!(config.stereo.block_size, 9);
        assert_eq!(config.stereo.num_disparities, 64);
        assert_eq!(config.calibration.square_size, 2.5);
    }

    #[test]
    fn test_focal_length_defaults_to_image_width() {
        let rig = RigConfig {
            image_width: 1280,
            ..RigConfig::default()
        };
        assert_eq!(rig.focal_length(), 1280.0);
        assert_eq!(rig.principal_point(), (640.0, 240.0));
    }
}
