pub mod inspect;
pub mod mapping;
pub mod synth;
pub mod upload;
pub mod validate;

use crate::cli::{MalformedArg, ReadArgs, StreamArg, TimestampArg, TransportArg};
use canvas_rs::config::TransportKind;
use canvas_rs::{MalformedPolicy, StreamKind, UploaderConfig};

/// Environment configuration with the shared reader flags applied
pub fn load_config(read: &ReadArgs) -> Result<UploaderConfig, String> {
    let mut config =
        UploaderConfig::from_env().map_err(|e| format!("Configuration error: {}", e))?;
    apply_read_args(&mut config, read);
    Ok(config)
}

pub fn apply_read_args(config: &mut UploaderConfig, read: &ReadArgs) {
    if let Some(batch_size) = read.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(policy) = read.on_malformed {
        config.on_malformed = match policy {
            MalformedArg::Skip => MalformedPolicy::Skip,
            MalformedArg::Abort => MalformedPolicy::Abort,
        };
    }
    if let Some(mode) = read.timestamps {
        config.synthetic_timestamps = mode == TimestampArg::Synthetic;
    }
    if let Some(interval) = read.interval {
        config.data_point_interval = interval;
    }
    if read.center {
        config.center = true;
    }
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Direct => TransportKind::Direct,
            TransportArg::Database => TransportKind::Database,
            TransportArg::Memory => TransportKind::Memory,
        }
    }
}

impl From<StreamArg> for StreamKind {
    fn from(arg: StreamArg) -> Self {
        match arg {
            StreamArg::Amplitude => StreamKind::Amplitude,
            StreamArg::Phase => StreamKind::Phase,
            StreamArg::FrequencyDelta => StreamKind::FrequencyDelta,
        }
    }
}
