//! セッションファイル（JSON）の読み書き

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StereoError};
use crate::pose::Session;
use crate::triangulation::TriangulatedFrame;

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}.json", stem, suffix))
}

/// `<stem>.json` → `<stem>_3d.json`
pub fn triangulated_path_for(session_path: impl AsRef<Path>) -> PathBuf {
    with_suffix(session_path.as_ref(), "_3d")
}

/// `<stem>.json` → `<stem>_flipped.json`
pub fn flipped_path_for(session_path: impl AsRef<Path>) -> PathBuf {
    with_suffix(session_path.as_ref(), "_flipped")
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| StereoError::from_read(e, path))?;
    serde_json::from_str(&text).map_err(|e| StereoError::CorruptSession {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    fs::write(path, text)?;
    Ok(())
}

pub fn load_session(path: impl AsRef<Path>) -> Result<Session> {
    let path = path.as_ref();
    let session: Session = read_json(path)?;
    debug!("loaded {} frames from {}", session.len(), path.display());
    Ok(session)
}

pub fn save_session(session: &Session, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    write_json(session, path)?;
    info!("saved {} frames to {}", session.len(), path.display());
    Ok(())
}

pub fn save_triangulated_session(frames: &[TriangulatedFrame], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    write_json(frames, path)?;
    info!("saved {} triangulated frames to {}", frames.len(), path.display());
    Ok(())
}

pub fn load_triangulated_session(path: impl AsRef<Path>) -> Result<Vec<TriangulatedFrame>> {
    read_json(path.as_ref())
}

/// 出力ディレクトリを基準にしたセッションの保存先
#[derive(Debug, Clone)]
pub struct SessionStore {
    output_dir: PathBuf,
}

impl SessionStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }

    /// `<output_dir>/<name>.json`
    pub fn session_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}.json", name))
    }

    pub fn load(&self, name: &str) -> Result<Session> {
        load_session(self.session_path(name))
    }

    pub fn save(&self, name: &str, session: &Session) -> Result<PathBuf> {
        let path = self.session_path(name);
        save_session(session, &path)?;
        Ok(path)
    }

    /// `<output_dir>/<name>_3d.json` に保存
    pub fn save_triangulated(&self, name: &str, frames: &[TriangulatedFrame]) -> Result<PathBuf> {
        let path = triangulated_path_for(self.session_path(name));
        save_triangulated_session(frames, &path)?;
        Ok(path)
    }

    pub fn load_triangulated(&self, name: &str) -> Result<Vec<TriangulatedFrame>> {
        load_triangulated_session(triangulated_path_for(self.session_path(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{Frame, JointId};
    use crate::triangulation::Point3D;

    fn sample_session() -> Session {
        vec![
            Frame::from_detections(&[(100, 200, -0.125, 0.9), (300, 50, 0.3333333333333333, 0.5)]),
            Frame::new(),
            Frame::from_detections(&[(1, 2, 0.0, 1.0)]),
        ]
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(
            triangulated_path_for("out/run1.json"),
            PathBuf::from("out/run1_3d.json")
        );
        assert_eq!(
            flipped_path_for("out/run1.json"),
            PathBuf::from("out/run1_flipped.json")
        );
        let store = SessionStore::new("assets/keypoints");
        assert_eq!(
            store.session_path("view_a"),
            PathBuf::from("assets/keypoints/view_a.json")
        );
    }

    #[test]
    fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/session.json");
        let session = sample_session();

        save_session(&session, &path).unwrap();
        let loaded = load_session(&path).unwrap();
        assert_eq!(loaded, session);

        let path2 = dir.path().join("session2.json");
        save_session(&loaded, &path2).unwrap();
        assert_eq!(load_session(&path2).unwrap(), session);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_session(dir.path().join("missing.json"));
        assert!(matches!(result, Err(StereoError::NotFound { .. })));
    }

    #[test]
    fn test_corrupt_session() {
        let dir = tempfile::tempdir().unwrap();

        let cases = [
            ("not_json.json", "{ this is not json"),
            ("bad_key.json", r#"[{"knee": {"x": 1, "y": 2, "z": 0.0, "vis": 1.0}}]"#),
            ("bad_type.json", r#"[{"joint_0": {"x": "a", "y": 2, "z": 0.0, "vis": 1.0}}]"#),
            ("missing_field.json", r#"[{"joint_0": {"x": 1, "y": 2}}]"#),
            ("signed_index.json", r#"[{"joint_+3": {"x": 1, "y": 2, "z": 0.0, "vis": 1.0}}]"#),
            (
                "aliased_index.json",
                r#"[{"joint_3": {"x": 1, "y": 2, "z": 0.0, "vis": 1.0}, "joint_03": {"x": 9, "y": 9, "z": 0.0, "vis": 1.0}}]"#,
            ),
            (
                "duplicate_key.json",
                r#"[{"joint_3": {"x": 1, "y": 2, "z": 0.0, "vis": 1.0}, "joint_3": {"x": 9, "y": 9, "z": 0.0, "vis": 1.0}}]"#,
            ),
            ("not_array.json", r#"{"joint_0": {"x": 1, "y": 2, "z": 0.0, "vis": 1.0}}"#),
        ];
        for (name, content) in cases {
            let path = dir.path().join(name);
            fs::write(&path, content).unwrap();
            assert!(
                matches!(load_session(&path), Err(StereoError::CorruptSession { .. })),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_triangulated_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("keypoints"));
        store.ensure_dir().unwrap();

        let mut frame = TriangulatedFrame::new();
        frame.insert(JointId(0), Point3D::new(-110.0, -20.0, 320.0));
        let frames = vec![frame, TriangulatedFrame::new()];

        let path = store.save_triangulated("run", &frames).unwrap();
        assert!(path.ends_with("run_3d.json"));

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json[0]["joint_0"]["Z"], serde_json::json!(320.0));

        assert_eq!(store.load_triangulated("run").unwrap(), frames);
    }
}
