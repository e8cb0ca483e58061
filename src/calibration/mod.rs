//! チェスボード画像を蓄積して単眼カメラをキャリブレーションする

pub mod bundle;
#[cfg(feature = "opencv")]
pub mod opencv;
pub mod subpix;
pub mod zhang;

use std::fs;
use std::path::Path;

use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut};
use log::{debug, info, warn};
use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::camera::CalibratedCamera;
use crate::config::CalibrationConfig;
use crate::error::{Result, StereoError};

#[cfg(feature = "opencv")]
pub use self::opencv::OpenCvChessboardDetector;
pub use subpix::refine_corners_subpix;
pub use zhang::ViewPose;

/// キャリブレーションに必要な最小画像数
pub const MIN_CALIBRATION_IMAGES: usize = 5;

/// チェスボードの形状
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardSpec {
    /// 内部コーナー数（横）
    pub cols: usize,
    /// 内部コーナー数（縦）
    pub rows: usize,
    /// マス辺長（実単位）
    pub square_size: f64,
}

impl Default for BoardSpec {
    fn default() -> Self {
        Self {
            cols: 9,
            rows: 6,
            square_size: 2.5,
        }
    }
}

impl BoardSpec {
    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self {
            cols: config.board_cols as usize,
            rows: config.board_rows as usize,
            square_size: config.square_size,
        }
    }

    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Z=0 平面上のコーナー座標（行優先）
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        (0..self.rows)
            .flat_map(|row| {
                (0..self.cols).map(move |col| {
                    Point3::new(col as f64 * self.square_size, row as f64 * self.square_size, 0.0)
                })
            })
            .collect()
    }
}

/// チェスボードの内部コーナー検出
pub trait ChessboardDetector {
    /// 行優先のコーナー列。ボードが見つからなければ None
    fn find_corners(&self, gray: &GrayImage, board: &BoardSpec) -> Result<Option<Vec<Point2<f64>>>>;
}

/// 採用された画像ごとの (物体点, 画像点)
#[derive(Debug, Clone, Default)]
pub struct CalibrationDataset {
    pub object_points: Vec<Vec<Point3<f64>>>,
    pub image_points: Vec<Vec<Point2<f64>>>,
}

impl CalibrationDataset {
    pub fn push(&mut self, object: Vec<Point3<f64>>, image: Vec<Point2<f64>>) {
        self.object_points.push(object);
        self.image_points.push(image);
    }

    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }
}

/// キャリブレーション結果
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub camera_matrix: Matrix3<f64>,
    /// [k1, k2, p1, p2, k3]
    pub dist_coeffs: [f64; 5],
    /// (height, width)
    pub image_shape: (u32, u32),
    /// 各採用画像の姿勢。ファイルから読んだ場合は空
    pub poses: Vec<ViewPose>,
    /// RMS リプロジェクションエラー。ファイルから読んだ場合は None
    pub rms_error: Option<f64>,
}

impl Calibration {
    pub fn camera(&self) -> CalibratedCamera {
        CalibratedCamera::new(self.camera_matrix, &self.dist_coeffs, self.image_shape)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = CalibrationFile {
            camera_matrix: (0..3)
                .map(|r| (0..3).map(|c| self.camera_matrix[(r, c)]).collect())
                .collect(),
            dist_coeffs: DistCoeffs::Flat(self.dist_coeffs.to_vec()),
            image_shape: vec![self.image_shape.0, self.image_shape.1],
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&file).map_err(std::io::Error::from)?;
        fs::write(path, json)?;
        info!("calibration saved to {}", path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let malformed = |reason: String| StereoError::MalformedCalibrationFile {
            path: path.to_path_buf(),
            reason,
        };

        let text = fs::read_to_string(path).map_err(|e| StereoError::from_read(e, path))?;
        let file: CalibrationFile = serde_json::from_str(&text).map_err(|e| malformed(e.to_string()))?;

        if file.camera_matrix.len() != 3 || file.camera_matrix.iter().any(|row| row.len() != 3) {
            return Err(malformed("camera_matrix must be 3x3".to_string()));
        }
        let camera_matrix = Matrix3::from_fn(|r, c| file.camera_matrix[r][c]);

        let dist = file.dist_coeffs.flatten();
        if dist.is_empty() || dist.len() > 5 {
            return Err(malformed(format!(
                "dist_coeffs must have 1 to 5 entries, got {}",
                dist.len()
            )));
        }
        let mut dist_coeffs = [0.0; 5];
        dist_coeffs[..dist.len()].copy_from_slice(&dist);

        let image_shape = match file.image_shape.as_slice() {
            [h, w] => (*h, *w),
            other => {
                return Err(malformed(format!(
                    "image_shape must have 2 entries, got {}",
                    other.len()
                )))
            }
        };

        Ok(Self {
            camera_matrix,
            dist_coeffs,
            image_shape,
            poses: Vec::new(),
            rms_error: None,
        })
    }
}

/// JSON上の表現
#[derive(Debug, Serialize, Deserialize)]
struct CalibrationFile {
    camera_matrix: Vec<Vec<f64>>,
    dist_coeffs: DistCoeffs,
    image_shape: Vec<u32>,
}

/// `[k1, ...]` と `[[k1, ...]]` のどちらも読める
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum DistCoeffs {
    Flat(Vec<f64>),
    Nested(Vec<Vec<f64>>),
}

impl DistCoeffs {
    fn flatten(self) -> Vec<f64> {
        match self {
            DistCoeffs::Flat(v) => v,
            DistCoeffs::Nested(v) => v.into_iter().flatten().collect(),
        }
    }
}

/// ストアの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Empty,
    Accumulating,
    Calibrated,
}

/// キャリブレーション画像の蓄積と解の保持
pub struct CalibrationStore<D> {
    board: BoardSpec,
    detector: D,
    dataset: CalibrationDataset,
    calibration: Option<Calibration>,
    min_images: usize,
}

impl<D: ChessboardDetector> CalibrationStore<D> {
    pub fn new(board: BoardSpec, detector: D) -> Self {
        Self {
            board,
            detector,
            dataset: CalibrationDataset::default(),
            calibration: None,
            min_images: MIN_CALIBRATION_IMAGES,
        }
    }

    /// 必要画像数を変更（5未満は5）
    pub fn with_min_images(mut self, min_images: usize) -> Self {
        self.min_images = min_images.max(MIN_CALIBRATION_IMAGES);
        self
    }

    pub fn board(&self) -> &BoardSpec {
        &self.board
    }

    /// キャリブレーションに必要な画像数（下限適用後）
    pub fn min_images(&self) -> usize {
        self.min_images
    }

    pub fn dataset(&self) -> &CalibrationDataset {
        &self.dataset
    }

    pub fn accepted_images(&self) -> usize {
        self.dataset.len()
    }

    pub fn state(&self) -> CalibrationState {
        if self.calibration.is_some() {
            CalibrationState::Calibrated
        } else if !self.dataset.is_empty() {
            CalibrationState::Accumulating
        } else {
            CalibrationState::Empty
        }
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn camera(&self) -> Option<CalibratedCamera> {
        self.calibration.as_ref().map(Calibration::camera)
    }

    /// 画像を1枚追加
    ///
    /// コーナーが見つかればサブピクセル補正して蓄積し、描画済みのコピーと true を返す。
    /// 見つからなければ何も変えずに (false, 元画像のコピー)。
    pub fn add_calibration_image(&mut self, image: &DynamicImage) -> Result<(bool, RgbImage)> {
        let mut canvas = image.to_rgb8();
        let gray = image.to_luma8();

        let corners = match self.detector.find_corners(&gray, &self.board) {
            Ok(Some(corners)) if corners.len() == self.board.corner_count() => corners,
            Ok(Some(corners)) => {
                warn!(
                    "corner count mismatch: expected {}, got {}",
                    self.board.corner_count(),
                    corners.len()
                );
                return Ok((false, canvas));
            }
            Ok(None) => {
                debug!("chessboard not found");
                return Ok((false, canvas));
            }
            Err(e) => {
                warn!("chessboard detection failed: {}", e);
                return Ok((false, canvas));
            }
        };

        let refined = refine_corners_subpix(&gray, &corners);
        draw_corners(&mut canvas, &refined, self.board.cols);

        self.dataset.push(self.board.object_points(), refined);
        info!(
            "calibration image accepted ({}/{})",
            self.dataset.len(),
            self.min_images
        );
        Ok((true, canvas))
    }

    /// 蓄積した画像でキャリブレーション
    ///
    /// 失敗しても以前の状態は変わらない
    pub fn calibrate(&mut self, image_shape: (u32, u32)) -> Result<&Calibration> {
        if self.dataset.len() < self.min_images {
            return Err(StereoError::InsufficientData {
                accepted: self.dataset.len(),
                required: self.min_images,
            });
        }

        let (k0, poses0) = zhang::initial_estimate(&self.dataset.object_points, &self.dataset.image_points)?;
        debug!("initial intrinsics: {}", k0);

        let model = bundle::refine(
            &self.dataset.object_points,
            &self.dataset.image_points,
            &k0,
            &poses0,
        )?;
        info!(
            "calibration solved: fx={:.2} fy={:.2} cx={:.2} cy={:.2}, RMS {:.4} px",
            model.intrinsic[(0, 0)],
            model.intrinsic[(1, 1)],
            model.intrinsic[(0, 2)],
            model.intrinsic[(1, 2)],
            model.rms
        );

        Ok(&*self.calibration.insert(Calibration {
            camera_matrix: model.intrinsic,
            dist_coeffs: model.dist_coeffs,
            image_shape,
            poses: model.poses,
            rms_error: Some(model.rms),
        }))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.calibration
            .as_ref()
            .ok_or(StereoError::NotCalibrated)?
            .save(path)
    }

    /// 保存済みのキャリブレーションを読み込む。蓄積データは保持する
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<&Calibration> {
        let calibration = Calibration::load(path)?;
        Ok(&*self.calibration.insert(calibration))
    }
}

/// 行ごとに色を変えてコーナーと連結線を描く
fn draw_corners(canvas: &mut RgbImage, corners: &[Point2<f64>], cols: usize) {
    const ROW_COLORS: [[u8; 3]; 6] = [
        [255, 0, 0],
        [255, 128, 0],
        [200, 200, 0],
        [0, 200, 0],
        [0, 128, 255],
        [160, 0, 255],
    ];

    for (i, p) in corners.iter().enumerate() {
        let color = Rgb(ROW_COLORS[(i / cols.max(1)) % ROW_COLORS.len()]);
        draw_hollow_circle_mut(canvas, (p.x.round() as i32, p.y.round() as i32), 4, color);
        if let Some(next) = corners.get(i + 1) {
            draw_line_segment_mut(
                canvas,
                (p.x as f32, p.y as f32),
                (next.x as f32, next.y as f32),
                color,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::zhang::tests::{synthetic_intrinsic, synthetic_poses};
    use super::*;
    use std::cell::Cell;

    /// 既知の K と姿勢でボードを投影する検出器
    struct ProjectingDetector {
        poses: Vec<ViewPose>,
        next: Cell<usize>,
    }

    impl ProjectingDetector {
        fn new() -> Self {
            Self {
                poses: synthetic_poses(),
                next: Cell::new(0),
            }
        }
    }

    impl ChessboardDetector for ProjectingDetector {
        fn find_corners(&self, _gray: &GrayImage, board: &BoardSpec) -> Result<Option<Vec<Point2<f64>>>> {
            let i = self.next.get();
            self.next.set(i + 1);
            let Some(pose) = self.poses.get(i % self.poses.len()) else {
                return Ok(None);
            };
            let k = synthetic_intrinsic();
            Ok(Some(zhang::tests::project_ideal(&k, pose, &board.object_points())))
        }
    }

    struct NeverFinds;

    impl ChessboardDetector for NeverFinds {
        fn find_corners(&self, _gray: &GrayImage, _board: &BoardSpec) -> Result<Option<Vec<Point2<f64>>>> {
            Ok(None)
        }
    }

    struct Failing;

    impl ChessboardDetector for Failing {
        fn find_corners(&self, _gray: &GrayImage, _board: &BoardSpec) -> Result<Option<Vec<Point2<f64>>>> {
            Err(StereoError::Detector("boom".to_string()))
        }
    }

    fn blank() -> DynamicImage {
        DynamicImage::new_rgb8(640, 480)
    }

    #[test]
    fn test_board_object_points() {
        let board = BoardSpec::default();
        let pts = board.object_points();
        assert_eq!(pts.len(), 54);
        assert_eq!(pts[1], Point3::new(2.5, 0.0, 0.0));
        assert_eq!(pts[9], Point3::new(0.0, 2.5, 0.0));
    }

    #[test]
    fn test_rejected_image_leaves_state() {
        let mut store = CalibrationStore::new(BoardSpec::default(), NeverFinds);
        let image = blank();
        let (accepted, annotated) = store.add_calibration_image(&image).unwrap();
        assert!(!accepted);
        assert_eq!(annotated, image.to_rgb8());
        assert_eq!(store.state(), CalibrationState::Empty);

        let mut store = CalibrationStore::new(BoardSpec::default(), Failing);
        let (accepted, _) = store.add_calibration_image(&image).unwrap();
        assert!(!accepted);
        assert_eq!(store.accepted_images(), 0);
    }

    #[test]
    fn test_accepted_image_is_annotated() {
        let mut store = CalibrationStore::new(BoardSpec::default(), ProjectingDetector::new());
        let image = blank();
        let (accepted, annotated) = store.add_calibration_image(&image).unwrap();
        assert!(accepted);
        assert_ne!(annotated, image.to_rgb8());
        assert_eq!(store.state(), CalibrationState::Accumulating);
        assert_eq!(store.dataset().object_points[0].len(), 54);
    }

    #[test]
    fn test_calibrate_requires_five_images() {
        let mut store = CalibrationStore::new(BoardSpec::default(), ProjectingDetector::new());
        for _ in 0..4 {
            assert!(store.add_calibration_image(&blank()).unwrap().0);
        }
        assert!(matches!(
            store.calibrate((480, 640)),
            Err(StereoError::InsufficientData {
                accepted: 4,
                required: 5
            })
        ));
        assert_eq!(store.state(), CalibrationState::Accumulating);

        assert!(store.add_calibration_image(&blank()).unwrap().0);
        let calibration = store.calibrate((480, 640)).unwrap();

        let k = synthetic_intrinsic();
        for (i, j) in [(0, 0), (1, 1), (0, 2), (1, 2)] {
            let rel = (calibration.camera_matrix[(i, j)] - k[(i, j)]).abs() / k[(i, j)];
            assert!(
                rel < 0.01,
                "K[{},{}]: expected {}, got {}",
                i,
                j,
                k[(i, j)],
                calibration.camera_matrix[(i, j)]
            );
        }
        assert_eq!(calibration.poses.len(), 5);
        assert_eq!(store.state(), CalibrationState::Calibrated);
    }

    #[test]
    fn test_min_images_floor() {
        let store = CalibrationStore::new(BoardSpec::default(), NeverFinds).with_min_images(2);
        assert_eq!(store.min_images(), MIN_CALIBRATION_IMAGES);
        let store = CalibrationStore::new(BoardSpec::default(), NeverFinds).with_min_images(12);
        assert_eq!(store.min_images(), 12);
    }

    #[test]
    fn test_save_requires_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(BoardSpec::default(), NeverFinds);
        assert!(matches!(
            store.save(dir.path().join("cal.json")),
            Err(StereoError::NotCalibrated)
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/camera_calibration.json");
        let calibration = Calibration {
            camera_matrix: synthetic_intrinsic(),
            dist_coeffs: [-0.1, 0.02, 0.001, -0.002, 0.0003],
            image_shape: (480, 640),
            poses: Vec::new(),
            rms_error: Some(0.2),
        };
        calibration.save(&path).unwrap();

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["image_shape"], serde_json::json!([480, 640]));
        assert_eq!(json["camera_matrix"][0][0], serde_json::json!(800.0));

        let mut store = CalibrationStore::new(BoardSpec::default(), NeverFinds);
        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.camera_matrix, calibration.camera_matrix);
        assert_eq!(loaded.dist_coeffs, calibration.dist_coeffs);
        assert_eq!(loaded.image_shape, (480, 640));
        assert_eq!(store.state(), CalibrationState::Calibrated);
        assert_eq!(store.camera().unwrap().fx(), 800.0);
    }

    #[test]
    fn test_load_accepts_nested_dist_coeffs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cal.json");
        fs::write(
            &path,
            r#"{"camera_matrix": [[500, 0, 320], [0, 500, 240], [0, 0, 1]],
                "dist_coeffs": [[0.1, 0.2, 0.0, 0.0, 0.3]],
                "image_shape": [480, 640]}"#,
        )
        .unwrap();
        let calibration = Calibration::load(&path).unwrap();
        assert_eq!(calibration.dist_coeffs, [0.1, 0.2, 0.0, 0.0, 0.3]);
    }

    #[test]
    fn test_malformed_load_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        Calibration {
            camera_matrix: synthetic_intrinsic(),
            dist_coeffs: [0.0; 5],
            image_shape: (480, 640),
            poses: Vec::new(),
            rms_error: None,
        }
        .save(&good)
        .unwrap();

        let mut store = CalibrationStore::new(BoardSpec::default(), NeverFinds);
        store.load(&good).unwrap();

        let cases = [
            ("missing_matrix.json", r#"{"dist_coeffs": [0, 0, 0, 0, 0], "image_shape": [480, 640]}"#),
            ("not_3x3.json", r#"{"camera_matrix": [[1, 0], [0, 1]], "dist_coeffs": [0], "image_shape": [480, 640]}"#),
            ("bad_shape.json", r#"{"camera_matrix": [[1,0,0],[0,1,0],[0,0,1]], "dist_coeffs": [0], "image_shape": [480]}"#),
            ("non_numeric.json", r#"{"camera_matrix": [["a",0,0],[0,1,0],[0,0,1]], "dist_coeffs": [0], "image_shape": [480, 640]}"#),
        ];
        for (name, content) in cases {
            let path = dir.path().join(name);
            fs::write(&path, content).unwrap();
            assert!(
                matches!(store.load(&path), Err(StereoError::MalformedCalibrationFile { .. })),
                "{} should be rejected",
                name
            );
        }

        assert!(matches!(
            store.load(dir.path().join("missing.json")),
            Err(StereoError::NotFound { .. })
        ));
        assert_eq!(store.calibration().unwrap().camera_matrix, synthetic_intrinsic());
    }
}
