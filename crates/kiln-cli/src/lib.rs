//! # kiln-cli
//!
//! Library half of the `kiln` binary: driver configuration and the digit
//! recognition network, generic over the compute backend.

pub mod config;
pub mod ocr;

use anyhow::Context;

use kiln_kernels::{ComputeBackend, DeviceSession, KernelDispatcher};

pub use config::{OcrConfig, WeightFiles};
pub use ocr::{argmax, OcrNetwork, OcrWeights, Prediction};

/// The six network kernels, compiled into the binary.
pub const OCR_KERNELS: &str = include_str!("../kernels/ocr.cl");

/// Open a session from the configured kernel file, or the built-in kernels.
pub fn open_dispatcher<B: ComputeBackend>(
    config: &OcrConfig,
    backend_config: &B::Config,
) -> anyhow::Result<KernelDispatcher<B>> {
    let session = match &config.kernel_source {
        Some(path) => {
            let session_config = kiln_kernels::SessionConfig::new(path, config.local_size);
            DeviceSession::open(&session_config, backend_config)
                .with_context(|| format!("opening device session with {}", path.display()))?
        }
        None => DeviceSession::from_source(OCR_KERNELS, config.local_size, backend_config)
            .context("opening device session with built-in kernels")?,
    };
    Ok(KernelDispatcher::new(session))
}
