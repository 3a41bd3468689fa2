//! Synthetic detector captures for demos and tests.
//!
//! Output is a `(channels + 1, samples)` complex array: row 0 holds
//! timestamps in its real part, each further row one channel's I/Q samples.
//! Rows are written as they are generated, so memory use does not grow with
//! the capture size.

use crate::error::{Result, UploadError};
use crate::npy::{Dtype, NpyWriter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthSpec {
    pub channels: usize,
    pub samples: usize,
    /// Seconds between samples
    pub interval: f64,
    /// Timestamp of the first sample, seconds since the epoch
    pub start: f64,
    pub seed: Option<u64>,
    /// Standard deviation scale of the additive noise
    pub noise: f64,
}

impl Default for SynthSpec {
    fn default() -> Self {
        Self {
            channels: 4,
            samples: 1000,
            interval: 0.05,
            start: 0.0,
            seed: None,
            noise: 0.05,
        }
    }
}

/// Write a synthetic capture to `path`
pub fn generate_npy(path: &Path, spec: &SynthSpec) -> Result<()> {
    if spec.channels == 0 || spec.samples == 0 {
        return Err(UploadError::InvalidParameter(
            "synthetic capture needs at least one channel and one sample".to_string(),
        ));
    }
    if !(spec.interval > 0.0) || !spec.start.is_finite() {
        return Err(UploadError::InvalidParameter(format!(
            "invalid sample interval {} or start {}",
            spec.interval, spec.start
        )));
    }

    let mut rng = match spec.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut writer = NpyWriter::create(path, Dtype::COMPLEX128, spec.channels + 1, spec.samples)?;
    for n in 0..spec.samples {
        writer.write(spec.start + n as f64 * spec.interval, 0.0)?;
    }

    for _ in 0..spec.channels {
        // Each resonator gets its own amplitude, starting phase and drift
        let amplitude: f64 = rng.gen_range(0.5..2.0);
        let mut phase: f64 = rng.gen_range(-PI..PI);
        let drift: f64 = rng.gen_range(-0.05..0.05);
        for _ in 0..spec.samples {
            let i = amplitude * phase.cos() + spec.noise * rng.gen_range(-1.0..1.0);
            let q = amplitude * phase.sin() + spec.noise * rng.gen_range(-1.0..1.0);
            writer.write(i, q)?;
            phase += drift;
        }
    }

    writer.finish()?;
    log::info!(
        "Wrote synthetic capture {} ({} channels x {} samples)",
        path.display(),
        spec.channels,
        spec.samples
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npy::NpyHeader;
    use crate::reader::{open_reader, ReaderOptions};
    use crate::resources::ResourceTracker;
    use crate::types::FileFormat;
    use tempfile::tempdir;

    fn spec(seed: u64) -> SynthSpec {
        SynthSpec {
            channels: 3,
            samples: 20,
            interval: 0.5,
            start: 100.0,
            seed: Some(seed),
            ..Default::default()
        }
    }

    #[test]
    fn test_header_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("synth.npy");
        generate_npy(&path, &spec(1)).unwrap();
        let header = NpyHeader::read_path(&path).unwrap();
        assert_eq!(header.shape, vec![4, 20]);
        assert_eq!(header.dtype, Dtype::COMPLEX128);
        assert!(!header.fortran_order);
    }

    #[test]
    fn test_readable_with_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("synth.npy");
        generate_npy(&path, &spec(2)).unwrap();

        let tracker = ResourceTracker::new();
        let mut reader =
            open_reader(&path, FileFormat::Npy, &ReaderOptions::default(), &tracker).unwrap();
        let records: Vec<_> = reader.records().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 60);
        assert_eq!(records[0].timestamp, 100.0);
        assert_eq!(records[59].timestamp, 109.5);
        assert!(records.iter().all(|r| r.amplitude > 0.0));
    }

    #[test]
    fn test_seed_is_deterministic() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.npy");
        let b = dir.path().join("b.npy");
        let c = dir.path().join("c.npy");
        generate_npy(&a, &spec(7)).unwrap();
        generate_npy(&b, &spec(7)).unwrap();
        generate_npy(&c, &spec(8)).unwrap();
        let bytes_a = std::fs::read(&a).unwrap();
        assert_eq!(bytes_a, std::fs::read(&b).unwrap());
        assert_ne!(bytes_a, std::fs::read(&c).unwrap());
    }

    #[test]
    fn test_rejects_empty_capture() {
        let dir = tempdir().unwrap();
        let empty = SynthSpec {
            channels: 0,
            ..spec(1)
        };
        assert!(matches!(
            generate_npy(&dir.path().join("x.npy"), &empty),
            Err(UploadError::InvalidParameter(_))
        ));
    }
}
