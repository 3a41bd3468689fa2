use crate::cli::{select_indexed, UploadArgs};
use crate::commands::load_config;
use crate::exit_codes;
use crate::output;
use canvas_rs::transport::create_transport;
use canvas_rs::{
    FileFormat, SessionEvent, SessionReport, StreamKind, TransportConfig, UploadError,
    UploadSession, UploaderConfig,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Serialize)]
struct DryRunOutput<'a> {
    files: &'a [PathBuf],
    transport: TransportConfig,
    measurement: &'a str,
    stream: StreamKind,
    average_points: usize,
    batch_size: usize,
    start_index: u64,
}

#[derive(Serialize)]
struct UploadOutput {
    #[serde(flatten)]
    report: SessionReport,
    files_rejected: usize,
    elapsed_secs: f64,
    error: Option<String>,
}

pub async fn execute(args: UploadArgs) -> i32 {
    let config = match load_config(&args.read).and_then(|mut config| {
        apply_upload_args(&mut config, &args);
        config
            .validate()
            .map_err(|e| format!("Configuration error: {}", e))?;
        Ok(config)
    }) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let files = match resolve_files(&args, &config) {
        Ok(f) => f,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };
    if files.is_empty() {
        eprintln!("Error: No files to upload");
        return exit_codes::INPUT_ERROR;
    }

    if args.dry_run {
        let plan = DryRunOutput {
            files: &files,
            transport: redact(config.transport_config()),
            measurement: &config.measurement,
            stream: config.stream,
            average_points: config.effective_average_points(),
            batch_size: config.batch_size,
            start_index: config.start_index,
        };
        return match output::print_json(&plan, args.compact) {
            Ok(()) => exit_codes::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_codes::EXECUTION_ERROR
            }
        };
    }

    let encoder = match config.encoder() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };
    let cancel = CancellationToken::new();
    let transport = match create_transport(&config.transport_config(), encoder, cancel.clone()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let session = UploadSession::with_cancel(config.session_config(), transport, cancel.clone());
    let handle = session.handle();

    let mut rejected = 0usize;
    for (n, file) in files.iter().enumerate() {
        let start = if n == 0 { config.start_index } else { 0 };
        if let Err(e) = handle.enqueue_at(file, start) {
            eprintln!("Warning: skipping {}: {}", file.display(), e);
            rejected += 1;
        }
    }

    let progress = if args.quiet {
        None
    } else {
        Some(tokio::spawn(report_progress(handle.subscribe())))
    };

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, finishing the current batch...");
            ctrl_c.cancel();
        }
    });

    let start = Instant::now();
    let (report, result) = session.run_with_report().await;
    let elapsed = start.elapsed().as_secs_f64();
    // Closing the last sender ends the progress task
    drop(handle);
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    let error = result.as_ref().err().map(|e| e.to_string());

    if args.json {
        let out = UploadOutput {
            report: report.clone(),
            files_rejected: rejected,
            elapsed_secs: elapsed,
            error: error.clone(),
        };
        if let Err(e) = output::print_json(&out, args.compact) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    } else if !args.quiet {
        eprintln!(
            "Upload complete: {} file(s) uploaded, {} failed, {} switched, {} records in {:.1}s",
            report.files_completed,
            report.files_failed + rejected,
            report.files_switched,
            report.records_sent,
            elapsed
        );
    }

    match result {
        Ok(()) => exit_code(&report, rejected),
        Err(e) => {
            eprintln!("Error: {}", e);
            match e {
                UploadError::TransportUnavailable(_) | UploadError::TransportRejected(_) => {
                    exit_codes::TRANSPORT_ERROR
                }
                _ => exit_codes::EXECUTION_ERROR,
            }
        }
    }
}

fn exit_code(report: &SessionReport, rejected: usize) -> i32 {
    let failed = report.files_failed + rejected;
    if report.cancelled {
        exit_codes::CANCELLED
    } else if failed == 0 {
        exit_codes::SUCCESS
    } else if report.files_completed > 0 {
        exit_codes::PARTIAL_FAILURE
    } else {
        exit_codes::EXECUTION_ERROR
    }
}

/// Hide credentials before printing a destination
fn redact(config: TransportConfig) -> TransportConfig {
    let hidden = |secret: Option<String>| secret.map(|_| "***".to_string());
    match config {
        TransportConfig::Direct {
            url,
            stream,
            token,
            timeout_ms,
        } => TransportConfig::Direct {
            url,
            stream,
            token: hidden(token),
            timeout_ms,
        },
        TransportConfig::Database {
            host,
            port,
            database,
            username,
            password,
            clear,
            timeout_ms,
        } => TransportConfig::Database {
            host,
            port,
            database,
            username,
            password: hidden(password),
            clear,
            timeout_ms,
        },
        TransportConfig::Live { interval_ms, inner } => TransportConfig::Live {
            interval_ms,
            inner: Box::new(redact(*inner)),
        },
        TransportConfig::Memory => TransportConfig::Memory,
    }
}

fn apply_upload_args(config: &mut UploaderConfig, args: &UploadArgs) {
    if let Some(transport) = args.transport {
        config.transport = transport.into();
    }
    if args.live {
        config.live = true;
    }
    if let Some(interval) = args.upload_interval {
        config.upload_interval = interval;
    }
    if let Some(stream) = args.stream {
        config.stream = stream.into();
    }
    if let Some(points) = args.average_points {
        config.average_points = Some(points);
    }
    if let Some(depth) = args.queue_depth {
        config.queue_depth = depth;
    }
    if let Some(start) = args.start_index {
        config.start_index = start;
    }
    if let Some(ref host) = args.host {
        config.influx_host = host.clone();
    }
    if let Some(port) = args.port {
        config.influx_port = port;
    }
    if let Some(ref database) = args.database {
        config.influx_database = database.clone();
    }
    if let Some(ref measurement) = args.measurement {
        config.measurement = measurement.clone();
    }
    if let Some(ref url) = args.grafana_url {
        config.grafana_url = url.clone();
    }
    if let Some(ref stream) = args.grafana_stream {
        config.grafana_stream = stream.clone();
    }
    if let Some(ref token) = args.grafana_token {
        config.grafana_token = Some(token.clone());
    }
    if args.clear {
        config.clear_measurement = true;
    }
}

fn resolve_files(args: &UploadArgs, config: &UploaderConfig) -> Result<Vec<PathBuf>, String> {
    if let Some(index) = args.index {
        return select_indexed(&config.files, index).map(|f| vec![f]);
    }

    let mut files: Vec<PathBuf> = args.files.iter().map(PathBuf::from).collect();
    if let Some(ref pattern) = args.glob {
        files.extend(resolve_glob(pattern)?);
    }
    Ok(files)
}

fn resolve_glob(pattern: &str) -> Result<Vec<PathBuf>, String> {
    let paths =
        glob::glob(pattern).map_err(|e| format!("Invalid glob pattern '{}': {}", pattern, e))?;

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => {
                if path.is_file() && FileFormat::from_path(&path).is_some() {
                    files.push(path);
                }
            }
            Err(e) => {
                eprintln!("Warning: glob error: {}", e);
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn report_progress(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::FileActivated { path, .. }) => {
                eprintln!("Uploading {}...", path.display());
            }
            Ok(SessionEvent::Retrying {
                attempt,
                delay_ms,
                error,
                ..
            }) => {
                eprintln!("  Attempt {} failed ({}), retrying in {} ms", attempt, error, delay_ms);
            }
            Ok(SessionEvent::FileFinished {
                path,
                state,
                records_sent,
                records_skipped,
                error,
                ..
            }) => {
                eprintln!(
                    "  {}: {:?}, {} records sent, {} skipped",
                    path.display(),
                    state,
                    records_sent,
                    records_skipped
                );
                if let Some(error) = error {
                    eprintln!("  Error: {}", error);
                }
            }
            Ok(SessionEvent::Fatal { error }) => eprintln!("Fatal: {}", error),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("Progress display skipped {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
