//! Text weight files: decimal floats separated by whitespace, row-major.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WeightError {
    #[error("failed to read weights '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("weight {index}: '{token}' is not a number")]
    Parse { index: usize, token: String },

    #[error("weights '{}': expected {expected} values, found {actual}", path.display())]
    Count { path: PathBuf, expected: usize, actual: usize },
}

/// Parse every whitespace-separated token as an `f32`. `index` in errors is
/// 1-based.
pub fn parse_weights(text: &str) -> Result<Vec<f32>, WeightError> {
    text.split_whitespace()
        .enumerate()
        .map(|(i, token)| {
            token.parse::<f32>().map_err(|_| WeightError::Parse {
                index: i + 1,
                token: token.to_string(),
            })
        })
        .collect()
}

/// Load a weight file and check it holds exactly `expected_len` values.
pub fn load_weights(path: impl AsRef<Path>, expected_len: usize) -> Result<Vec<f32>, WeightError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|source| WeightError::Io { path: path.to_path_buf(), source })?;
    let weights = parse_weights(&text)?;
    if weights.len() != expected_len {
        return Err(WeightError::Count {
            path: path.to_path_buf(),
            expected: expected_len,
            actual: weights.len(),
        });
    }
    tracing::debug!("loaded {} weights from {}", weights.len(), path.display());
    Ok(weights)
}
