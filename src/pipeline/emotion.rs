use serde::Serialize;
use std::fmt;

/// Output classes of the emotion CNN. The declaration order is the order
/// of the model's output layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Emotion {
    Surprised,
    Fearful,
    Disgusted,
    Happy,
    Sad,
    Angry,
    Neutral,
    /// Inference failed for this face.
    #[serde(rename = "Error")]
    Error,
}

impl Emotion {
    pub const CLASSES: [Emotion; 7] = [
        Emotion::Surprised,
        Emotion::Fearful,
        Emotion::Disgusted,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Neutral,
    ];

    pub fn from_index(idx: usize) -> Option<Emotion> {
        Self::CLASSES.get(idx).copied()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Emotion::Surprised => "SURPRISED",
            Emotion::Fearful => "FEARFUL",
            Emotion::Disgusted => "DISGUSTED",
            Emotion::Happy => "HAPPY",
            Emotion::Sad => "SAD",
            Emotion::Angry => "ANGRY",
            Emotion::Neutral => "NEUTRAL",
            Emotion::Error => "Error",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
