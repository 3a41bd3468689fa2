use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "canvas-uploader",
    version,
    about = "Stream detector I/Q captures to a Grafana canvas",
    long_about = "Upload detector I/Q captures (.npy, .csv) to InfluxDB or Grafana Live for\n\
                  display on a Grafana canvas panel. Connection settings are read from\n\
                  CANVAS_* environment variables (or a .env file) and can be overridden\n\
                  with flags."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upload one or more files, one after another
    Upload(UploadArgs),
    /// Stream a file and print its min/max summary
    Inspect(InspectArgs),
    /// Check that files exist and have a readable header
    Validate(ValidateArgs),
    /// Print a channel-to-sensor mapping for the canvas panel
    Mapping(MappingArgs),
    /// Write a synthetic detector capture
    Synth(SynthArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    /// Grafana Live push
    Direct,
    /// InfluxDB 1.x
    Database,
    /// Discard after encoding (testing)
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StreamArg {
    Amplitude,
    Phase,
    FrequencyDelta,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MalformedArg {
    Skip,
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TimestampArg {
    Actual,
    Synthetic,
}

/// Reader settings shared by `upload` and `inspect`
#[derive(Args, Clone)]
pub struct ReadArgs {
    /// Records per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// What to do with records that cannot be decoded
    #[arg(long, value_enum)]
    pub on_malformed: Option<MalformedArg>,

    /// Use file timestamps or generate them from --interval
    #[arg(long, value_enum)]
    pub timestamps: Option<TimestampArg>,

    /// Seconds between data points
    #[arg(long)]
    pub interval: Option<f64>,

    /// Subtract each channel's mean amplitude and phase
    #[arg(long, default_value_t = false)]
    pub center: bool,
}

#[derive(Args)]
pub struct UploadArgs {
    /// Files to upload in order (.npy, .csv, .txt)
    pub files: Vec<String>,

    /// Also upload files matching this glob pattern
    #[arg(long)]
    pub glob: Option<String>,

    /// Upload entry N (0-based) of the CANVAS_FILES list
    #[arg(long, conflicts_with_all = ["files", "glob"])]
    pub index: Option<usize>,

    /// Destination
    #[arg(long, value_enum)]
    pub transport: Option<TransportArg>,

    /// Pace uploads to one batch per --upload-interval
    #[arg(long, default_value_t = false)]
    pub live: bool,

    /// Seconds between uploads in live mode
    #[arg(long)]
    pub upload_interval: Option<f64>,

    /// Field published to the canvas
    #[arg(long, value_enum)]
    pub stream: Option<StreamArg>,

    /// Frames averaged into each uploaded line
    #[arg(long)]
    pub average_points: Option<usize>,

    /// Batches buffered between reading and uploading
    #[arg(long)]
    pub queue_depth: Option<usize>,

    /// Time index (column) the first file starts uploading from
    #[arg(long)]
    pub start_index: Option<u64>,

    #[command(flatten)]
    pub read: ReadArgs,

    /// InfluxDB host
    #[arg(long)]
    pub host: Option<String>,

    /// InfluxDB port
    #[arg(long)]
    pub port: Option<u16>,

    /// InfluxDB database
    #[arg(long)]
    pub database: Option<String>,

    /// Measurement name
    #[arg(long)]
    pub measurement: Option<String>,

    /// Grafana base URL for --transport direct
    #[arg(long)]
    pub grafana_url: Option<String>,

    /// Grafana Live stream id
    #[arg(long)]
    pub grafana_stream: Option<String>,

    /// Grafana service account token
    #[arg(long, env = "CANVAS_GRAFANA_TOKEN", hide_env_values = true)]
    pub grafana_token: Option<String>,

    /// Drop the measurement before uploading
    #[arg(long, default_value_t = false)]
    pub clear: bool,

    /// Print the resolved files and destination without uploading
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Print the final report as JSON on stdout
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Suppress progress messages on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Input data file path(s)
    #[arg(long, required = true, num_args = 1..)]
    pub file: Vec<String>,

    #[command(flatten)]
    pub read: ReadArgs,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Input data file path(s)
    #[arg(long, required = true, num_args = 1..)]
    pub file: Vec<String>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Args)]
pub struct MappingArgs {
    /// Sensor number of channel 1
    #[arg(long, default_value_t = 1149)]
    pub start: u32,

    /// Number of channels
    #[arg(long, default_value_t = 428)]
    pub channels: usize,

    /// Write the mapping to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<String>,
}

#[derive(Args)]
pub struct SynthArgs {
    /// Output .npy path
    #[arg(long)]
    pub out: String,

    /// Number of sensor channels
    #[arg(long, default_value_t = 4)]
    pub channels: usize,

    /// Samples per channel
    #[arg(long, default_value_t = 1000)]
    pub samples: usize,

    /// Seed for reproducible output
    #[arg(long)]
    pub seed: Option<u64>,

    /// Seconds between samples
    #[arg(long, default_value_t = 0.05)]
    pub interval: f64,

    /// Timestamp of the first sample (default: now)
    #[arg(long)]
    pub start: Option<f64>,
}

/// Pick entry `index` (0-based) of the preconfigured file list.
pub fn select_indexed(files: &[std::path::PathBuf], index: usize) -> Result<std::path::PathBuf, String> {
    if files.is_empty() {
        return Err("--index needs CANVAS_FILES to list the uploadable files".to_string());
    }
    files.get(index).cloned().ok_or_else(|| {
        format!(
            "Invalid upload index {}: CANVAS_FILES has {} entr{}",
            index,
            files.len(),
            if files.len() == 1 { "y" } else { "ies" }
        )
    })
}
