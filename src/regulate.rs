//! Audio-level regulation seam
//!
//! The actual regulator (gain analysis and rescaling) lives outside this
//! crate; the engine only needs the `LevelRegulator` capability. Each
//! outgoing chunk is regulated to the decibel target of its class: alert
//! tones, SAME tones, and normal content may carry different targets within
//! one stream. A regulation failure aborts the current item and is reported,
//! never silently dropped.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RegulationError;

/// What kind of audio a chunk carries, selecting its decibel target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkClass {
    AlertTone,
    SameTone,
    Content,
}

/// Per-class decibel targets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecibelTargets {
    pub alert_db: f64,
    pub same_db: f64,
    pub content_db: f64,
}

impl DecibelTargets {
    /// One target for every class
    pub fn uniform(db: f64) -> Self {
        Self {
            alert_db: db,
            same_db: db,
            content_db: db,
        }
    }

    pub fn target_for(&self, class: ChunkClass) -> f64 {
        match class {
            ChunkClass::AlertTone => self.alert_db,
            ChunkClass::SameTone => self.same_db,
            ChunkClass::Content => self.content_db,
        }
    }
}

impl Default for DecibelTargets {
    fn default() -> Self {
        DecibelTargets::uniform(-13.0)
    }
}

/// Collaborator capability: rescale a chunk of audio bytes to a target level
pub trait LevelRegulator: Send + Sync {
    fn regulate(&self, audio: &[u8], target_db: f64) -> Result<Bytes, RegulationError>;
}

pub type SharedRegulator = Arc<dyn LevelRegulator>;

/// Pass-through regulator for sources that are already mastered
pub struct UnityRegulator;

impl LevelRegulator for UnityRegulator {
    fn regulate(&self, audio: &[u8], _target_db: f64) -> Result<Bytes, RegulationError> {
        Ok(Bytes::copy_from_slice(audio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_per_class() {
        let targets = DecibelTargets {
            alert_db: -3.0,
            same_db: -9.0,
            content_db: -13.0,
        };
        assert_eq!(targets.target_for(ChunkClass::AlertTone), -3.0);
        assert_eq!(targets.target_for(ChunkClass::SameTone), -9.0);
        assert_eq!(targets.target_for(ChunkClass::Content), -13.0);

        let flat = DecibelTargets::uniform(-6.0);
        assert_eq!(flat.target_for(ChunkClass::AlertTone), -6.0);
        assert_eq!(flat.target_for(ChunkClass::Content), -6.0);
    }

    #[test]
    fn test_unity_regulator_passes_through() {
        let out = UnityRegulator.regulate(&[1, 2, 3], -13.0).unwrap();
        assert_eq!(&out[..], &[1, 2, 3]);
    }
}
