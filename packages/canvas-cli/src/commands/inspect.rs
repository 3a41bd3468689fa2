use crate::cli::InspectArgs;
use crate::commands::load_config;
use crate::exit_codes;
use crate::output::{self, fmt_value};
use canvas_rs::reader::{open_reader, ReaderOptions};
use canvas_rs::{FileFormat, FileMetadata, ResourceTracker, StreamKind, Summary};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct InspectOutput {
    file: String,
    metadata: Option<FileMetadata>,
    summary: Option<Summary>,
    records_skipped: u64,
    error: Option<String>,
}

pub fn execute(args: InspectArgs) -> i32 {
    let config = match load_config(&args.read) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };
    let options = config.reader_options();
    let tracker = ResourceTracker::new();

    let results: Vec<InspectOutput> = args
        .file
        .par_iter()
        .map(|file| inspect_file(file, &options, &tracker))
        .collect();
    let failed = results.iter().filter(|r| r.error.is_some()).count();

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
            print_summary(result);
        }
    }

    if failed == 0 {
        exit_codes::SUCCESS
    } else if failed < results.len() {
        exit_codes::PARTIAL_FAILURE
    } else {
        exit_codes::INPUT_ERROR
    }
}

fn inspect_file(file: &str, options: &ReaderOptions, tracker: &ResourceTracker) -> InspectOutput {
    let path = Path::new(file);
    let mut result = InspectOutput {
        file: file.to_string(),
        metadata: None,
        summary: None,
        records_skipped: 0,
        error: None,
    };

    let Some(format) = FileFormat::from_path(path) else {
        result.error = Some(format!(
            "Unsupported file extension. Supported: {}",
            FileFormat::supported_extensions().join(", ")
        ));
        return result;
    };

    let mut reader = match open_reader(path, format, options, tracker) {
        Ok(r) => r,
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        }
    };
    result.metadata = Some(reader.metadata().clone());

    let mut failure = None;
    for record in reader.records() {
        if let Err(e) = record {
            failure = Some(e.to_string());
        }
    }

    result.summary = Some(reader.summary().clone());
    result.records_skipped = reader.stats().records_skipped;
    result.error = failure;
    result
}

fn print_summary(result: &InspectOutput) {
    println!("{}", result.file);
    if let Some(ref meta) = result.metadata {
        let dims = match (meta.num_channels, meta.num_samples) {
            (Some(c), Some(s)) => format!(", {} channels x {} samples", c, s),
            _ => String::new(),
        };
        println!("  Format:   {:?}{} ({} bytes)", meta.format, dims, meta.file_size);
    }
    if let Some(ref summary) = result.summary {
        println!("  Records:  {} ({} skipped)", summary.records, result.records_skipped);
        for kind in [StreamKind::Amplitude, StreamKind::Phase, StreamKind::FrequencyDelta] {
            let Some(range) = summary.range(kind) else {
                continue;
            };
            let avg = summary
                .average_extremes(kind)
                .map(|mm| format!("  avg min {}  avg max {}", fmt_value(mm.min), fmt_value(mm.max)))
                .unwrap_or_default();
            println!(
                "  {:<17} min {} (ch {} @ {})  max {} (ch {} @ {}){}",
                kind.as_str(),
                fmt_value(range.min),
                range.min_at.channel,
                range.min_at.index,
                fmt_value(range.max),
                range.max_at.channel,
                range.max_at.index,
                avg
            );
        }
    }
    if let Some(ref err) = result.error {
        eprintln!("  Error: {}", err);
    }
}
