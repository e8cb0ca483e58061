use std::path::PathBuf;

/// 復元パイプラインのエラー
#[derive(Debug, thiserror::Error)]
pub enum StereoError {
    /// 入力ファイルが存在しない
    #[error("file not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// セッションファイルの構造が不正
    #[error("corrupt session file {}: {reason}", path.display())]
    CorruptSession { path: PathBuf, reason: String },

    /// キャリブレーションファイルの構造が不正
    #[error("malformed calibration file {}: {reason}", path.display())]
    MalformedCalibrationFile { path: PathBuf, reason: String },

    /// キャリブレーション画像が足りない
    #[error("insufficient calibration data: {accepted} accepted images, need at least {required}")]
    InsufficientData { accepted: usize, required: usize },

    /// キャリブレーション前に呼ばれた
    #[error("camera is not calibrated")]
    NotCalibrated,

    /// 同次座標 w≈0 または解が一意に定まらない
    #[error("degenerate triangulation: {reason}")]
    DegenerateTriangulation { reason: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// 2視点のフレーム数が一致しない
    #[error("session length mismatch: view A has {a} frames, view B has {b}")]
    SessionLengthMismatch { a: usize, b: usize },

    /// チェスボード検出器の内部エラー
    #[error("chessboard detector error: {0}")]
    Detector(String),

    /// ソルバーが有限なモデルを返せなかった
    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StereoError>;

impl StereoError {
    /// ファイル読み込みのI/Oエラーを分類（存在しない場合はNotFound）
    pub(crate) fn from_read(err: std::io::Error, path: &std::path::Path) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StereoError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            StereoError::Io(err)
        }
    }
}
