use canvas_rs::npy::{Dtype, NpyWriter};
use canvas_rs::reader::{open_reader, MalformedPolicy, ReaderOptions};
use canvas_rs::synth::{generate_npy, SynthSpec};
use canvas_rs::transport::{FailureKind, MemorySink, MemoryTransport, PacedTransport};
use canvas_rs::{
    Batch, FileFormat, FileState, LineEncoder, QueueOptions, ResourceTracker, RetryPolicy,
    SessionConfig, SessionEvent, SessionHandle, SessionReport, StreamKind, Summary, UploadError,
    UploadSession,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn session_config(batch_size: usize, malformed: MalformedPolicy) -> SessionConfig {
    SessionConfig {
        queue: QueueOptions {
            reader: ReaderOptions {
                batch_size,
                malformed,
                ..Default::default()
            },
            ..Default::default()
        },
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        event_capacity: 100_000,
        ..Default::default()
    }
}

fn synth_file(dir: &TempDir, name: &str, channels: usize, samples: usize) -> PathBuf {
    let path = dir.path().join(name);
    let spec = SynthSpec {
        channels,
        samples,
        interval: 0.01,
        start: 1_700_000_000.0,
        seed: Some(42),
        ..Default::default()
    };
    generate_npy(&path, &spec).unwrap();
    path
}

/// Two channels, five samples, channel 1 sample 2 is NaN
fn file_with_nan(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut writer = NpyWriter::create(&path, Dtype::COMPLEX128, 3, 5).unwrap();
    for n in 0..5 {
        writer.write(n as f64, 0.0).unwrap();
    }
    for n in 0..5 {
        writer.write(1.0 + n as f64, 0.5).unwrap();
    }
    for n in 0..5 {
        let i = if n == 2 { f64::NAN } else { 2.0 };
        writer.write(i, -1.0).unwrap();
    }
    writer.finish().unwrap();
    path
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn finished_states(events: &[SessionEvent]) -> Vec<(PathBuf, FileState)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::FileFinished { path, state, .. } => Some((path.clone(), *state)),
            _ => None,
        })
        .collect()
}

fn memory_session(config: SessionConfig, sink: &MemorySink) -> UploadSession {
    UploadSession::new(config, Box::new(MemoryTransport::new(sink.clone())))
}

/// Wait (bounded) for the first event matching `pred`
async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended early: {}", err),
            }
        }
    })
    .await
    .unwrap()
}

fn encoding_session(
    config: SessionConfig,
    sink: &MemorySink,
    average_points: usize,
) -> UploadSession {
    let encoder = LineEncoder::new("m", StreamKind::Amplitude, average_points).unwrap();
    let transport = MemoryTransport::new(sink.clone()).with_encoder(encoder);
    UploadSession::new(config, Box::new(transport))
}

fn sent_records(sink: &MemorySink) -> Vec<canvas_rs::Record> {
    sink.batches()
        .iter()
        .flat_map(|b| b.records.iter().copied())
        .collect()
}

async fn paused_at_activation(
    handle: &SessionHandle,
    rx: &mut broadcast::Receiver<SessionEvent>,
) {
    wait_for(rx, |e| matches!(e, SessionEvent::FileActivated { .. })).await;
    assert!(handle.is_paused());
}

async fn run_single(path: &Path, batch_size: usize) -> (SessionReport, MemorySink) {
    let sink = MemorySink::new();
    let session = memory_session(session_config(batch_size, MalformedPolicy::Skip), &sink);
    session.handle().enqueue(path).unwrap();
    let report = session.run().await.unwrap();
    (report, sink)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausting_a_file_activates_the_next() {
    let dir = TempDir::new().unwrap();
    let a = synth_file(&dir, "a.npy", 3, 200);
    let b = synth_file(&dir, "b.npy", 2, 150);

    let sink = MemorySink::new();
    let session = memory_session(session_config(64, MalformedPolicy::Skip), &sink);
    let handle = session.handle();
    let mut rx = handle.subscribe();
    let id_a = handle.enqueue(&a).unwrap();
    let id_b = handle.enqueue(&b).unwrap();

    let report = session.run().await.unwrap();
    assert_eq!(report.files_completed, 2);
    assert_eq!(report.records_sent, 600 + 300);
    assert_eq!(sink.record_count(), 900);
    assert!(sink.batches().iter().all(|b| b.len() % 3 == 0 || b.entry_id == id_b));

    let events = drain(&mut rx);
    let activations: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::FileActivated {
                entry_id,
                open_handles_before,
                ..
            } => Some((*entry_id, *open_handles_before)),
            _ => None,
        })
        .collect();
    assert_eq!(activations, vec![(id_a, 0), (id_b, 0)]);
    assert_eq!(
        finished_states(&events),
        vec![(a, FileState::Exhausted), (b, FileState::Exhausted)]
    );
    assert!(matches!(events.last(), Some(SessionEvent::QueueEmpty)));
    assert_eq!(handle.open_handles(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_switch_releases_active_handle_first() {
    let dir = TempDir::new().unwrap();
    let a = synth_file(&dir, "a.npy", 4, 20_000);
    let b = synth_file(&dir, "b.npy", 2, 100);

    let sink = MemorySink::new();
    let transport = MemoryTransport::new(sink.clone()).with_send_delay(Duration::from_millis(2));
    let session = UploadSession::new(session_config(64, MalformedPolicy::Skip), Box::new(transport));
    let handle = session.handle();
    let mut rx = handle.subscribe();
    let mut watcher = handle.subscribe();
    let id_a = handle.enqueue(&a).unwrap();
    let id_b = handle.enqueue(&b).unwrap();

    let run = tokio::spawn(session.run());

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match watcher.recv().await {
                Ok(SessionEvent::BatchSent { entry_id, .. }) if entry_id == id_a => break,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended early: {}", err),
            }
        }
    })
    .await
    .unwrap();

    let snapshot = handle.queue_snapshot();
    assert_eq!(snapshot.active.map(|e| e.id), Some(id_a));
    assert_eq!(snapshot.open_handles, 1);
    handle.switch_to(id_b).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.files_switched, 1);
    assert_eq!(report.files_completed, 1);
    assert!(report.records_sent < 80_000);

    let events = drain(&mut rx);
    let b_activation = events.iter().find_map(|e| match e {
        SessionEvent::FileActivated {
            entry_id,
            open_handles_before,
            ..
        } if *entry_id == id_b => Some(*open_handles_before),
        _ => None,
    });
    assert_eq!(b_activation, Some(0));
    assert_eq!(
        finished_states(&events),
        vec![(a, FileState::UserSwitched), (b, FileState::Exhausted)]
    );
    assert_eq!(handle.open_handles(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_buffered_records_do_not_grow_with_file_size() {
    let dir = TempDir::new().unwrap();
    let small = synth_file(&dir, "small.npy", 2, 100);
    let large = synth_file(&dir, "large.npy", 2, 10_000);

    let (small_report, _) = run_single(&small, 32).await;
    let (large_report, sink) = run_single(&large, 32).await;

    assert_eq!(sink.record_count(), 20_000);
    assert!(large_report.peak_buffered > 0);
    // One batch, the frame it completes and the reader's column window
    assert!(large_report.peak_buffered <= 2 * 32 + 2 * 2);
    assert!(large_report.peak_buffered <= small_report.peak_buffered + 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_summary_matches_full_scan() {
    let dir = TempDir::new().unwrap();
    let path = synth_file(&dir, "scan.npy", 3, 500);

    let sink = MemorySink::new();
    let session = memory_session(session_config(50, MalformedPolicy::Skip), &sink);
    let handle = session.handle();
    handle.enqueue(&path).unwrap();
    session.run().await.unwrap();

    let tracker = ResourceTracker::new();
    let mut reader =
        open_reader(&path, FileFormat::Npy, &ReaderOptions::default(), &tracker).unwrap();
    let mut oracle = Summary::new();
    for record in reader.records() {
        oracle.observe(&record.unwrap());
    }

    let summary = handle.summary();
    assert_eq!(summary.records, 1500);
    assert_eq!(summary, oracle);
}

#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let dir = TempDir::new().unwrap();
    let path = file_with_nan(&dir, "nan.npy");

    let (report, sink) = run_single(&path, 4).await;
    assert_eq!(report.files_completed, 1);
    assert_eq!(report.records_skipped, 1);
    assert_eq!(sink.record_count(), 9);
    assert!(sink
        .batches()
        .iter()
        .flat_map(|b| b.records.iter())
        .all(|r| r.amplitude.is_finite()));
}

#[tokio::test]
async fn test_malformed_record_aborts_file_and_advances() {
    let dir = TempDir::new().unwrap();
    let bad = file_with_nan(&dir, "bad.npy");
    let good = synth_file(&dir, "good.npy", 2, 10);

    let sink = MemorySink::new();
    let session = memory_session(session_config(4, MalformedPolicy::Abort), &sink);
    let handle = session.handle();
    let mut rx = handle.subscribe();
    handle.enqueue(&bad).unwrap();
    handle.enqueue(&good).unwrap();

    let report = session.run().await.unwrap();
    assert_eq!(report.files_failed, 1);
    assert_eq!(report.files_completed, 1);

    let events = drain(&mut rx);
    assert_eq!(
        finished_states(&events),
        vec![(bad, FileState::Failed), (good, FileState::Exhausted)]
    );
    let error = events.iter().find_map(|e| match e {
        SessionEvent::FileFinished {
            state: FileState::Failed,
            error,
            ..
        } => error.clone(),
        _ => None,
    });
    assert!(error.unwrap().contains("sample 2, channel 1"));
}

#[tokio::test]
async fn test_unreadable_file_fails_and_queue_continues() {
    let dir = TempDir::new().unwrap();
    let broken = dir.path().join("broken.npy");
    std::fs::write(&broken, b"definitely not numpy").unwrap();
    let good = synth_file(&dir, "good.npy", 1, 10);

    let sink = MemorySink::new();
    let session = memory_session(session_config(8, MalformedPolicy::Skip), &sink);
    let handle = session.handle();
    handle.enqueue(&broken).unwrap();
    handle.enqueue(&good).unwrap();
    assert!(matches!(
        handle.enqueue(dir.path().join("notes.txt")),
        Err(UploadError::UnsupportedFormat(_))
    ));

    let report = session.run().await.unwrap();
    assert_eq!(report.files_failed, 1);
    assert_eq!(report.files_completed, 1);
    assert_eq!(sink.record_count(), 10);
    assert_eq!(handle.open_handles(), 0);
}

#[tokio::test]
async fn test_transient_outage_is_retried() {
    let dir = TempDir::new().unwrap();
    let path = synth_file(&dir, "a.npy", 2, 20);

    let sink = MemorySink::new();
    sink.fail_next(FailureKind::Unavailable, 2);
    let session = memory_session(session_config(8, MalformedPolicy::Skip), &sink);
    let handle = session.handle();
    let mut rx = handle.subscribe();
    handle.enqueue(&path).unwrap();

    let report = session.run().await.unwrap();
    assert_eq!(report.retries, 2);
    assert_eq!(sink.record_count(), 40);
    let retrying = drain(&mut rx)
        .iter()
        .filter(|e| matches!(e, SessionEvent::Retrying { .. }))
        .count();
    assert_eq!(retrying, 2);
}

#[tokio::test]
async fn test_exhausted_retries_end_the_session() {
    let dir = TempDir::new().unwrap();
    let a = synth_file(&dir, "a.npy", 2, 20);
    let b = synth_file(&dir, "b.npy", 2, 20);

    let sink = MemorySink::new();
    sink.fail_next(FailureKind::Unavailable, 100);
    let session = memory_session(session_config(8, MalformedPolicy::Skip), &sink);
    let handle = session.handle();
    let mut rx = handle.subscribe();
    handle.enqueue(&a).unwrap();
    handle.enqueue(&b).unwrap();

    let result = session.run().await;
    assert!(matches!(result, Err(UploadError::TransportUnavailable(_))));
    assert_eq!(sink.attempts(), 3);
    assert_eq!(sink.closes(), 1);
    assert_eq!(handle.open_handles(), 0);

    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(SessionEvent::Fatal { .. })));
    assert_eq!(finished_states(&events), vec![(a, FileState::Failed)]);
    assert_eq!(handle.queue_snapshot().pending.len(), 1);
}

#[tokio::test]
async fn test_rejected_batch_fails_only_that_file() {
    let dir = TempDir::new().unwrap();
    let a = synth_file(&dir, "a.npy", 2, 20);
    let b = synth_file(&dir, "b.npy", 2, 20);

    let sink = MemorySink::new();
    sink.fail_next(FailureKind::Rejected, 1);
    let session = memory_session(session_config(8, MalformedPolicy::Skip), &sink);
    let handle = session.handle();
    let mut rx = handle.subscribe();
    handle.enqueue(&a).unwrap();
    handle.enqueue(&b).unwrap();

    let report = session.run().await.unwrap();
    assert_eq!(report.files_failed, 1);
    assert_eq!(report.files_completed, 1);
    assert_eq!(report.retries, 0);
    assert_eq!(sink.record_count(), 40);
    assert_eq!(
        finished_states(&drain(&mut rx)),
        vec![(a, FileState::Failed), (b, FileState::Exhausted)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_between_batches() {
    let dir = TempDir::new().unwrap();
    let a = synth_file(&dir, "a.npy", 4, 20_000);

    let sink = MemorySink::new();
    let transport = MemoryTransport::new(sink.clone()).with_send_delay(Duration::from_millis(2));
    let session = UploadSession::new(session_config(64, MalformedPolicy::Skip), Box::new(transport));
    let handle = session.handle();
    let mut rx = handle.subscribe();
    handle.enqueue(&a).unwrap();

    let run = tokio::spawn(session.run());
    tokio::time::timeout(Duration::from_secs(10), async {
        while !matches!(rx.recv().await, Ok(SessionEvent::BatchSent { .. })) {}
    })
    .await
    .unwrap();
    handle.cancel();

    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(report.cancelled);
    assert!(report.records_sent < 80_000);
    assert_eq!(report.records_sent as usize, sink.record_count());
    assert_eq!(handle.open_handles(), 0);

    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(SessionEvent::Cancelled)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_holds_uploads_until_resume() {
    let dir = TempDir::new().unwrap();
    let path = synth_file(&dir, "a.npy", 2, 50);

    let sink = MemorySink::new();
    let session = memory_session(session_config(10, MalformedPolicy::Skip), &sink);
    let handle = session.handle();
    handle.enqueue(&path).unwrap();
    handle.pause();
    assert!(handle.is_paused());

    let run = tokio::spawn(session.run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.attempts(), 0);
    assert_eq!(handle.open_handles(), 1);

    handle.resume();
    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.records_sent, 100);
}

#[tokio::test]
async fn test_encoded_lines_reach_the_sink() {
    let dir = TempDir::new().unwrap();
    let path = synth_file(&dir, "a.npy", 3, 12);

    let sink = MemorySink::new();
    let encoder =
        canvas_rs::LineEncoder::new("LIVE_MEASUREMENTS", canvas_rs::StreamKind::Amplitude, 4)
            .unwrap();
    let transport = MemoryTransport::new(sink.clone()).with_encoder(encoder);
    let session = UploadSession::new(session_config(12, MalformedPolicy::Skip), Box::new(transport));
    session.handle().enqueue(&path).unwrap();
    session.run().await.unwrap();

    // 12 frames averaged 4 at a time
    let lines = sink.lines();
    assert_eq!(lines.len(), 3);
    for line in &lines {
        assert!(line.starts_with("LIVE_MEASUREMENTS channel_data=\"["));
        let values = line.split('"').nth(1).unwrap();
        assert_eq!(values.split(',').count(), 3);
    }
}

#[tokio::test]
async fn test_line_groups_survive_batch_boundaries() {
    let dir = TempDir::new().unwrap();
    let path = synth_file(&dir, "a.npy", 3, 12);

    // 9 records is three frames, which would cut a pair of frames in half
    let sink = MemorySink::new();
    let session = encoding_session(session_config(9, MalformedPolicy::Skip), &sink, 2);
    session.handle().enqueue(&path).unwrap();
    session.run().await.unwrap();

    assert!(sink.batches().iter().all(|b| b.num_frames() % 2 == 0));
    let lines = sink.lines();
    assert_eq!(lines.len(), 6);

    let encoder = LineEncoder::new("m", StreamKind::Amplitude, 2).unwrap();
    let whole = Batch::new(Uuid::nil(), 0, sent_records(&sink));
    assert_eq!(lines, encoder.lines(&whole));
}

#[tokio::test]
async fn test_skipped_sample_keeps_channel_positions() {
    let dir = TempDir::new().unwrap();
    let path = file_with_nan(&dir, "nan.npy");

    let sink = MemorySink::new();
    let session = encoding_session(session_config(4, MalformedPolicy::Skip), &sink, 1);
    session.handle().enqueue(&path).unwrap();
    let report = session.run().await.unwrap();
    assert_eq!(report.records_skipped, 1);

    let lines = sink.lines();
    assert_eq!(lines.len(), 5);
    for (n, line) in lines.iter().enumerate() {
        let values = line.split('"').nth(1).unwrap();
        assert_eq!(values.split(',').count(), 2, "{}", line);
        // channel 1 of sample 2 was dropped, channel 0 stays first
        assert_eq!(values.ends_with("null]"), n == 2, "{}", line);
    }
}

#[tokio::test(start_paused = true)]
async fn test_live_mode_publishes_one_line_per_interval() {
    let dir = TempDir::new().unwrap();
    let path = synth_file(&dir, "live.npy", 2, 10);

    let sink = MemorySink::new();
    let cancel = CancellationToken::new();
    let encoder = LineEncoder::new("LIVE_MEASUREMENTS", StreamKind::Amplitude, 2).unwrap();
    let transport = PacedTransport::new(
        MemoryTransport::new(sink.clone()).with_encoder(encoder),
        Duration::from_millis(100),
        cancel.clone(),
    );
    let session = UploadSession::with_cancel(
        session_config(1024, MalformedPolicy::Skip),
        Box::new(transport),
        cancel,
    );
    session.handle().enqueue(&path).unwrap();

    let start = Instant::now();
    let report = session.run().await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(report.records_sent, 20);
    assert_eq!(sink.batches().len(), 5);
    assert!(sink.batches().iter().all(|b| b.num_frames() == 2));
    assert_eq!(sink.lines().len(), 5);
    assert!(elapsed >= Duration::from_millis(400), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "{:?}", elapsed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_switch_loses_no_batches() {
    let dir = TempDir::new().unwrap();
    let a = synth_file(&dir, "a.npy", 4, 2_000);
    let b = synth_file(&dir, "b.npy", 2, 10);

    let sink = MemorySink::new();
    let transport = MemoryTransport::new(sink.clone()).with_send_delay(Duration::from_millis(1));
    let session = UploadSession::new(session_config(64, MalformedPolicy::Skip), Box::new(transport));
    let handle = session.handle();
    let mut rx = handle.subscribe();
    let id_a = handle.enqueue(&a).unwrap();
    let id_b = handle.enqueue(&b).unwrap();

    let run = tokio::spawn(session.run());
    wait_for(&mut rx, |e| {
        matches!(e, SessionEvent::BatchSent { entry_id, .. } if *entry_id == id_a)
    })
    .await;
    handle.switch_to(id_b).unwrap();
    handle.dequeue(id_b).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(20), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.files_switched, 0);
    assert_eq!(report.files_completed, 1);
    assert_eq!(report.records_sent, 8_000);
    assert_eq!(sink.record_count(), 8_000);
    let sequences: Vec<u64> = sink.batches().iter().map(|b| b.sequence).collect();
    assert_eq!(sequences, (0..sequences.len() as u64).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seek_and_step_while_paused() {
    let dir = TempDir::new().unwrap();
    let path = synth_file(&dir, "a.npy", 2, 100);

    let sink = MemorySink::new();
    let session = memory_session(session_config(10, MalformedPolicy::Skip), &sink);
    let handle = session.handle();
    let mut rx = handle.subscribe();
    handle.enqueue(&path).unwrap();
    handle.pause();

    let run = tokio::spawn(session.run());
    paused_at_activation(&handle, &mut rx).await;

    handle.seek(40).unwrap();
    let seeked = wait_for(&mut rx, |e| matches!(e, SessionEvent::Seeked { .. })).await;
    assert!(matches!(seeked, SessionEvent::Seeked { index: 40, .. }));
    assert_eq!(sink.attempts(), 0);

    for first in [40, 45] {
        handle.step().unwrap();
        let sent = wait_for(&mut rx, |e| matches!(e, SessionEvent::BatchSent { .. })).await;
        let last = match sent {
            SessionEvent::BatchSent { last_index, .. } => last_index,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(last, first + 4);
        assert_eq!(sink.batches().last().unwrap().records[0].index, first);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.batches().len(), 2);

    handle.resume();
    assert!(matches!(handle.step(), Err(UploadError::InvalidParameter(_))));
    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.records_sent, 2 * 60);
    assert_eq!(sent_records(&sink)[0].index, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fatal_error_keeps_partial_report() {
    let dir = TempDir::new().unwrap();
    let path = synth_file(&dir, "a.npy", 2, 50);

    let sink = MemorySink::new();
    let session = memory_session(session_config(10, MalformedPolicy::Skip), &sink);
    let handle = session.handle();
    let mut rx = handle.subscribe();
    handle.enqueue(&path).unwrap();
    handle.pause();

    let run = tokio::spawn(session.run_with_report());
    paused_at_activation(&handle, &mut rx).await;
    handle.step().unwrap();
    wait_for(&mut rx, |e| matches!(e, SessionEvent::BatchSent { .. })).await;

    sink.fail_next(FailureKind::Unavailable, 100);
    handle.resume();
    let (report, result) = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(UploadError::TransportUnavailable(_))));
    assert_eq!(report.batches_sent, 1);
    assert_eq!(report.records_sent, 10);
    assert_eq!(report.retries, 2);
    assert_eq!(report.files_failed, 0);
}
