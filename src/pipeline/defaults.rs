use crate::config::FeatureConfig;
use crate::error::TrainingError;
use crate::pipeline::traits::FeatureExtractor;
use crate::types::{Features, Utterance};

/// Reads precomputed frames from `utterance.features_path`: a JSON array of
/// equal-length frame vectors.
pub struct JsonFeatureReader;

impl FeatureExtractor for JsonFeatureReader {
    fn extract(
        &self,
        utterance: &Utterance,
        _config: &FeatureConfig,
    ) -> Result<Features, TrainingError> {
        let path = utterance.features_path.as_ref().ok_or_else(|| {
            TrainingError::engine(
                "read features",
                format!("utterance {} has no features_path", utterance.id),
            )
        })?;
        let data =
            std::fs::read_to_string(path).map_err(|e| TrainingError::io("read feature file", e))?;
        let frames: Vec<Vec<f32>> =
            serde_json::from_str(&data).map_err(|e| TrainingError::json("parse feature file", e))?;

        let dim = frames.first().map_or(0, Vec::len);
        if let Some(bad) = frames.iter().position(|f| f.len() != dim) {
            return Err(TrainingError::engine(
                "read features",
                format!(
                    "{}: frame {bad} has {} values, expected {dim}",
                    utterance.id,
                    frames[bad].len()
                ),
            ));
        }
        Ok(Features { frames })
    }
}
