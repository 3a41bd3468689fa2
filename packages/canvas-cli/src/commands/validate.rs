use crate::cli::ValidateArgs;
use crate::exit_codes;
use crate::output;
use canvas_rs::reader::{open_reader, MalformedPolicy, ReaderOptions};
use canvas_rs::{FileFormat, ResourceTracker};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ValidateOutput {
    file: String,
    exists: bool,
    readable: bool,
    supported: bool,
    format: Option<FileFormat>,
    size_bytes: Option<u64>,
    num_channels: Option<usize>,
    num_samples: Option<usize>,
    dtype: Option<String>,
    error: Option<String>,
}

pub fn execute(args: ValidateArgs) -> i32 {
    let tracker = ResourceTracker::new();
    let results: Vec<ValidateOutput> = args
        .file
        .par_iter()
        .map(|file| validate_file(file, &tracker))
        .collect();
    let invalid = results.iter().filter(|r| r.error.is_some()).count();

    if args.json {
        let printed = if results.len() == 1 {
            output::print_json(&results[0], args.compact)
        } else {
            output::print_json(&results, args.compact)
        };
        if let Err(e) = printed {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    } else {
        for result in &results {
            match result.error {
                Some(ref err) => eprintln!("Error: {}", err),
                None => println!(
                    "File '{}' is valid ({:?}, {} bytes{})",
                    result.file,
                    result.format.unwrap_or(FileFormat::Npy),
                    result.size_bytes.unwrap_or(0),
                    match (result.num_channels, result.num_samples) {
                        (Some(c), Some(s)) => format!(", {} channels x {} samples", c, s),
                        _ => String::new(),
                    }
                ),
            }
        }
    }

    if invalid == 0 {
        exit_codes::SUCCESS
    } else {
        exit_codes::INPUT_ERROR
    }
}

fn validate_file(file: &str, tracker: &ResourceTracker) -> ValidateOutput {
    let path = Path::new(file);
    let exists = path.exists();
    let readable = path.is_file() && std::fs::File::open(path).is_ok();
    let format = FileFormat::from_path(path);
    let size_bytes = if readable {
        std::fs::metadata(path).ok().map(|m| m.len())
    } else {
        None
    };

    let mut result = ValidateOutput {
        file: file.to_string(),
        exists,
        readable,
        supported: format.is_some(),
        format,
        size_bytes,
        num_channels: None,
        num_samples: None,
        dtype: None,
        error: None,
    };

    if !exists {
        result.error = Some(format!("File not found: {}", file));
    } else if !readable {
        result.error = Some(format!("File is not readable: {}", file));
    } else if let Some(format) = format {
        if let Err(e) = check_contents(path, format, tracker, &mut result) {
            result.error = Some(format!("{}: {}", file, e));
        }
    } else {
        result.error = Some(format!(
            "Unsupported file extension for '{}'. Supported: {}",
            file,
            FileFormat::supported_extensions().join(", ")
        ));
    }
    result
}

/// Open the file and decode its first record
fn check_contents(
    path: &Path,
    format: FileFormat,
    tracker: &ResourceTracker,
    result: &mut ValidateOutput,
) -> canvas_rs::Result<()> {
    let options = ReaderOptions {
        malformed: MalformedPolicy::Abort,
        ..Default::default()
    };
    let mut reader = open_reader(path, format, &options, tracker)?;
    let meta = reader.metadata();
    result.num_channels = meta.num_channels;
    result.num_samples = meta.num_samples;
    result.dtype = meta.dtype.clone();

    if reader.next_record()?.is_none() {
        return Err(canvas_rs::UploadError::UnsupportedFormat(
            "file contains no records".to_string(),
        ));
    }
    Ok(())
}
