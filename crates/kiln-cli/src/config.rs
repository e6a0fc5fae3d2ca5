//! Driver configuration, loaded from a JSON file and overridden by flags.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use kiln_kernels::DeviceType;

/// Weight file names, relative to [`OcrConfig::weights_dir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightFiles {
    pub conv1: String,
    pub conv2: String,
    pub linear1: String,
    pub linear2: String,
}

impl Default for WeightFiles {
    fn default() -> Self {
        Self {
            conv1: "conv1.txt".into(),
            conv2: "conv2.txt".into(),
            linear1: "linear1.txt".into(),
            linear2: "linear2.txt".into(),
        }
    }
}

/// Configuration for the `classify` and `bench` commands.
///
/// Every field has a default, so a config file only needs the keys it
/// changes:
///
/// ```json
/// { "local_size": 128, "device_type": "cpu", "weights_dir": "weights" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Kernel source file. `None` uses the built-in `kernels/ocr.cl`.
    pub kernel_source: Option<PathBuf>,

    /// Work-group size for every launch.
    pub local_size: usize,

    pub device_type: DeviceType,

    /// Directory holding the four weight files.
    pub weights_dir: PathBuf,

    pub weight_files: WeightFiles,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            kernel_source: None,
            local_size: 64,
            device_type: DeviceType::Gpu,
            weights_dir: PathBuf::from("."),
            weight_files: WeightFiles::default(),
        }
    }
}

impl OcrConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: OcrConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if given, else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Full paths of the conv1, conv2, linear1 and linear2 weight files.
    pub fn weight_paths(&self) -> [PathBuf; 4] {
        let f = &self.weight_files;
        [&f.conv1, &f.conv2, &f.linear1, &f.linear2].map(|name| self.weights_dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: OcrConfig =
            serde_json::from_str(r#"{ "local_size": 128, "device_type": "cpu" }"#).unwrap();
        assert_eq!(config.local_size, 128);
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.kernel_source, None);
        assert_eq!(config.weight_files, WeightFiles::default());
    }

    #[test]
    fn test_weight_paths() {
        let config = OcrConfig {
            weights_dir: PathBuf::from("w"),
            weight_files: WeightFiles { linear2: "out.txt".into(), ..WeightFiles::default() },
            ..OcrConfig::default()
        };
        let paths = config.weight_paths();
        assert_eq!(paths[0], Path::new("w").join("conv1.txt"));
        assert_eq!(paths[3], Path::new("w").join("out.txt"));
    }

    #[test]
    fn test_unknown_device_type_rejected() {
        assert!(serde_json::from_str::<OcrConfig>(r#"{ "device_type": "fpga" }"#).is_err());
    }
}
