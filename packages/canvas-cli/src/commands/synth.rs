use crate::cli::SynthArgs;
use crate::exit_codes;
use canvas_rs::synth::{generate_npy, SynthSpec};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn execute(args: SynthArgs) -> i32 {
    let path = Path::new(&args.out);
    if path.extension().and_then(|e| e.to_str()) != Some("npy") {
        eprintln!("Error: Output path must end in .npy: {}", args.out);
        return exit_codes::INPUT_ERROR;
    }

    let start = args.start.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    });
    let spec = SynthSpec {
        channels: args.channels,
        samples: args.samples,
        interval: args.interval,
        start,
        seed: args.seed,
        ..Default::default()
    };

    match generate_npy(path, &spec) {
        Ok(()) => {
            eprintln!(
                "Wrote {} ({} channels x {} samples)",
                args.out, args.channels, args.samples
            );
            exit_codes::SUCCESS
        }
        Err(canvas_rs::UploadError::InvalidParameter(msg)) => {
            eprintln!("Error: {}", msg);
            exit_codes::INPUT_ERROR
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::EXECUTION_ERROR
        }
    }
}
