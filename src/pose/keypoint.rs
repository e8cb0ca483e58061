use nalgebra::Point2;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// MediaPipe BlazePose の 33 ランドマーク
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Landmark {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

impl Landmark {
    pub const COUNT: usize = 33;

    const ALL: [Landmark; Landmark::COUNT] = [
        Self::Nose,
        Self::LeftEyeInner,
        Self::LeftEye,
        Self::LeftEyeOuter,
        Self::RightEyeInner,
        Self::RightEye,
        Self::RightEyeOuter,
        Self::LeftEar,
        Self::RightEar,
        Self::MouthLeft,
        Self::MouthRight,
        Self::LeftShoulder,
        Self::RightShoulder,
        Self::LeftElbow,
        Self::RightElbow,
        Self::LeftWrist,
        Self::RightWrist,
        Self::LeftPinky,
        Self::RightPinky,
        Self::LeftIndex,
        Self::RightIndex,
        Self::LeftThumb,
        Self::RightThumb,
        Self::LeftHip,
        Self::RightHip,
        Self::LeftKnee,
        Self::RightKnee,
        Self::LeftAnkle,
        Self::RightAnkle,
        Self::LeftHeel,
        Self::RightHeel,
        Self::LeftFootIndex,
        Self::RightFootIndex,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn id(self) -> JointId {
        JointId(self as usize)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nose => "nose",
            Self::LeftEyeInner => "left_eye_inner",
            Self::LeftEye => "left_eye",
            Self::LeftEyeOuter => "left_eye_outer",
            Self::RightEyeInner => "right_eye_inner",
            Self::RightEye => "right_eye",
            Self::RightEyeOuter => "right_eye_outer",
            Self::LeftEar => "left_ear",
            Self::RightEar => "right_ear",
            Self::MouthLeft => "mouth_left",
            Self::MouthRight => "mouth_right",
            Self::LeftShoulder => "left_shoulder",
            Self::RightShoulder => "right_shoulder",
            Self::LeftElbow => "left_elbow",
            Self::RightElbow => "right_elbow",
            Self::LeftWrist => "left_wrist",
            Self::RightWrist => "right_wrist",
            Self::LeftPinky => "left_pinky",
            Self::RightPinky => "right_pinky",
            Self::LeftIndex => "left_index",
            Self::RightIndex => "right_index",
            Self::LeftThumb => "left_thumb",
            Self::RightThumb => "right_thumb",
            Self::LeftHip => "left_hip",
            Self::RightHip => "right_hip",
            Self::LeftKnee => "left_knee",
            Self::RightKnee => "right_knee",
            Self::LeftAnkle => "left_ankle",
            Self::RightAnkle => "right_ankle",
            Self::LeftHeel => "left_heel",
            Self::RightHeel => "right_heel",
            Self::LeftFootIndex => "left_foot_index",
            Self::RightFootIndex => "right_foot_index",
        }
    }
}

/// 関節ID。JSON上は `"joint_<i>"` 形式のキー
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JointId(pub usize);

impl JointId {
    pub fn landmark(self) -> Option<Landmark> {
        Landmark::from_index(self.0)
    }
}

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "joint_{}", self.0)
    }
}

impl FromStr for JointId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let index = s
            .strip_prefix("joint_")
            .ok_or_else(|| format!("expected key of the form joint_<i>, got {:?}", s))?;
        // 正規の10進表記のみ（"+3" や "03" は別キーとして衝突する）
        let canonical = !index.is_empty()
            && index.bytes().all(|b| b.is_ascii_digit())
            && (index == "0" || !index.starts_with('0'));
        if !canonical {
            return Err(format!("invalid joint index in key {:?}", s));
        }
        index
            .parse::<usize>()
            .map(JointId)
            .map_err(|_| format!("invalid joint index in key {:?}", s))
    }
}

impl From<Landmark> for JointId {
    fn from(landmark: Landmark) -> Self {
        landmark.id()
    }
}

impl Serialize for JointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        key.parse().map_err(de::Error::custom)
    }
}

/// 1フレーム内の単一関節（検出器出力）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Joint {
    /// ピクセルX座標
    pub x: i32,
    /// ピクセルY座標
    pub y: i32,
    /// 検出器相対の奥行きヒント（メートルではない）
    pub z: f64,
    /// 可視度 (0.0〜1.0)
    pub vis: f64,
}

impl Joint {
    pub fn new(x: i32, y: i32, z: f64, vis: f64) -> Self {
        Self { x, y, z, vis }
    }

    /// 可視度が閾値以上か
    pub fn is_visible(&self, threshold: f64) -> bool {
        self.vis >= threshold
    }

    pub fn point(&self) -> Point2<f64> {
        Point2::new(self.x as f64, self.y as f64)
    }
}

/// 1フレーム分の関節。IDで引き、反復はID昇順
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Frame {
    joints: BTreeMap<JointId, Joint>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// 検出器の出力列 (x, y, z, vis) から構築。i番目が joint_i になる
    pub fn from_detections(detections: &[(i32, i32, f64, f64)]) -> Self {
        detections
            .iter()
            .enumerate()
            .map(|(i, &(x, y, z, vis))| (JointId(i), Joint::new(x, y, z, vis)))
            .collect()
    }

    pub fn insert(&mut self, id: impl Into<JointId>, joint: Joint) -> Option<Joint> {
        self.joints.insert(id.into(), joint)
    }

    pub fn get(&self, id: impl Into<JointId>) -> Option<&Joint> {
        self.joints.get(&id.into())
    }

    pub fn contains(&self, id: JointId) -> bool {
        self.joints.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, JointId, Joint> {
        self.joints.iter()
    }
}

impl FromIterator<(JointId, Joint)> for Frame {
    fn from_iter<I: IntoIterator<Item = (JointId, Joint)>>(iter: I) -> Self {
        Self {
            joints: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Frame {
    type Item = (&'a JointId, &'a Joint);
    type IntoIter = btree_map::Iter<'a, JointId, Joint>;

    fn into_iter(self) -> Self::IntoIter {
        self.joints.iter()
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrameVisitor;

        impl<'de> de::Visitor<'de> for FrameVisitor {
            type Value = Frame;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of joint_<i> to joint")
            }

            fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Frame, A::Error> {
                let mut joints = BTreeMap::new();
                while let Some((id, joint)) = map.next_entry::<JointId, Joint>()? {
                    if joints.insert(id, joint).is_some() {
                        return Err(de::Error::custom(format!("duplicate key {}", id)));
                    }
                }
                Ok(Frame { joints })
            }
        }

        deserializer.deserialize_map(FrameVisitor)
    }
}

/// フレーム順の系列。i番目のフレームは他視点のi番目と対応する
pub type Session = Vec<Frame>;
