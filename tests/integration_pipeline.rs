#![cfg(unix)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use mp4_squeeze::{
    CompressionError, CompressionRequest, CompressionStage, CompressorConfig, SourceMedia,
};
use support::{FakeToolEnv, recording_sink};

fn upload() -> SourceMedia {
    SourceMedia::Bytes(Bytes::from_static(b"not really an mp4, the fake tools don't care"))
}

#[tokio::test]
async fn compress_produces_artifact_within_target() {
    let env = FakeToolEnv::new();
    let orchestrator = env.orchestrator();
    let (sink, events) = recording_sink();

    let artifact = orchestrator
        .compress(
            CompressionRequest::new(upload()),
            Some(sink),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(artifact.size_bytes(), 4 * 1024 * 1024);
    assert!(artifact.size_bytes() <= 8 * 1024 * 1024);
    assert_eq!(artifact.plan().video_bitrate_bps, 968_111);
    assert_eq!(artifact.dimensions().to_string(), "1280x720");
    assert!(artifact.path().is_file());
    assert!(env.live_workspaces().is_empty());

    let calls = env.ffmpeg_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("-pass 1"));
    assert!(calls[0].contains("-an -f null -"));
    assert!(calls[1].contains("-pass 2"));
    for call in &calls {
        assert!(call.contains("-b:v 968111"), "{call}");
        assert!(call.contains("-vf scale=1280:720"), "{call}");
    }

    let stages: Vec<CompressionStage> = events
        .lock()
        .iter()
        .filter(|e| e.progress.is_none())
        .map(|e| e.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            CompressionStage::Probing,
            CompressionStage::EncodingPass1,
            CompressionStage::EncodingPass2,
            CompressionStage::Finalizing,
        ]
    );
    assert!(
        events
            .lock()
            .iter()
            .filter_map(|e| e.progress)
            .all(|p| (0.0..=1.0).contains(&p))
    );

    let path = artifact.path().to_path_buf();
    drop(artifact);
    assert!(!path.exists());
}

#[tokio::test]
async fn silent_source_encodes_without_audio() {
    let env = FakeToolEnv::new();
    env.set_probe(60.0, 640, 360, false);
    let artifact = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()).with_maintain_aspect_ratio(true),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(artifact.plan().video_bitrate_bps, 1_096_111);
    assert_eq!(artifact.plan().audio_bitrate_bps, 0);
    assert_eq!(artifact.dimensions().to_string(), "640x360");
    let calls = env.ffmpeg_calls();
    assert!(!calls[1].contains("-c:a aac"));
}

#[tokio::test]
async fn persist_keeps_artifact() {
    let env = FakeToolEnv::new();
    let artifact = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let dest_dir = tempfile::tempdir().unwrap();
    let temp_path = artifact.path().to_path_buf();
    let dest = artifact
        .persist(dest_dir.path().join("out.mp4"))
        .await
        .unwrap();
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4 * 1024 * 1024);
    assert!(!temp_path.exists());
}

#[tokio::test]
async fn probe_failure_skips_encoding_and_cleans_up() {
    let env = FakeToolEnv::new();
    env.set_probe_failure();

    let err = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CompressionError::Probe(_)), "{err:?}");
    assert!(env.ffprobe_called());
    assert!(env.ffmpeg_calls().is_empty());
    assert!(env.live_workspaces().is_empty());
}

#[tokio::test]
async fn zero_duration_is_rejected_before_encoding() {
    let env = FakeToolEnv::new();
    env.set_probe(0.0, 1920, 1080, true);

    let err = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CompressionError::InvalidDuration(_)), "{err:?}");
    assert!(env.ffmpeg_calls().is_empty());
}

#[tokio::test]
async fn long_video_hits_bitrate_floor_without_encoding() {
    let env = FakeToolEnv::new();
    env.set_probe(36_000.0, 1920, 1080, true);

    let err = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, CompressionError::BitrateFloorViolation { .. }),
        "{err:?}"
    );
    assert_eq!(err.kind(), "bitrate_floor_violation");
    assert!(env.ffmpeg_calls().is_empty());
    assert!(env.live_workspaces().is_empty());
}

#[tokio::test]
async fn first_pass_failure_stops_before_second_pass() {
    let env = FakeToolEnv::new();
    env.fail_pass(1);

    let err = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match &err {
        CompressionError::EncodePass { pass, code, stderr } => {
            assert_eq!(*pass, 1);
            assert_eq!(*code, 1);
            assert!(stderr.contains("Error while opening encoder"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(env.ffmpeg_calls().len(), 1);
    assert!(env.live_workspaces().is_empty());
}

#[tokio::test]
async fn second_pass_failure_reports_pass_two() {
    let env = FakeToolEnv::new();
    env.fail_pass(2);

    let err = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, CompressionError::EncodePass { pass: 2, .. }),
        "{err:?}"
    );
    assert!(env.live_workspaces().is_empty());
}

#[tokio::test]
async fn oversized_output_is_rejected() {
    let env = FakeToolEnv::new();
    env.set_output_bytes(2 * 1024 * 1024 + 1);

    let err = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()).with_target_size_mb(2.0),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        CompressionError::TargetSizeExceeded {
            actual_bytes,
            limit_bytes,
        } => {
            assert_eq!(actual_bytes, 2 * 1024 * 1024 + 1);
            assert_eq!(limit_bytes, 2 * 1024 * 1024);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(env.live_workspaces().is_empty());
    let leftovers = std::fs::read_dir(env.temp_root()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn output_exactly_at_limit_is_accepted() {
    let env = FakeToolEnv::new();
    env.set_output_bytes(2 * 1024 * 1024);

    let artifact = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()).with_target_size_mb(2.0),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(artifact.size_bytes(), 2 * 1024 * 1024);
}

#[tokio::test]
async fn hung_pass_times_out_and_cleans_up() {
    let env = FakeToolEnv::new();
    env.hang_for_secs(30);
    let orchestrator = env.orchestrator_with(CompressorConfig {
        encode_pass_timeout_secs: 1,
        ..env.config()
    });

    let err = orchestrator
        .compress(
            CompressionRequest::new(upload()),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, CompressionError::EncodeTimeout { .. }),
        "{err:?}"
    );
    assert_eq!(err.kind(), "encode_timeout");
    assert!(env.live_workspaces().is_empty());
}

#[tokio::test]
async fn cancellation_stops_running_encode() {
    let env = FakeToolEnv::new();
    env.hang_for_secs(30);
    let orchestrator = env.orchestrator();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = orchestrator
        .compress(CompressionRequest::new(upload()), None, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, CompressionError::Cancelled), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(env.live_workspaces().is_empty());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn dropped_request_kills_encoder_and_cleans_up() {
    let env = FakeToolEnv::new();
    env.hang_for_secs(30);
    let orchestrator = env.orchestrator();
    let cancel = CancellationToken::new();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        orchestrator.compress(CompressionRequest::new(upload()), None, &cancel),
    )
    .await;
    assert!(abandoned.is_err(), "compress finished before it was dropped");

    assert!(env.live_workspaces().is_empty());
    let pid = env.hung_ffmpeg_pid().expect("ffmpeg never started");
    assert!(support::wait_for_exit(pid).await, "ffmpeg {pid} survived");
    assert_eq!(orchestrator.available_slots(), 2);
}

#[tokio::test]
async fn already_cancelled_request_does_nothing() {
    let env = FakeToolEnv::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = env
        .orchestrator()
        .compress(CompressionRequest::new(upload()), None, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, CompressionError::Cancelled));
    assert!(!env.ffprobe_called());
}

#[tokio::test]
async fn invalid_request_never_touches_tools() {
    let env = FakeToolEnv::new();
    let err = env
        .orchestrator()
        .compress(
            CompressionRequest::new(upload()).with_target_size_mb(-1.0),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "invalid_request");
    assert!(!env.ffprobe_called());
    assert!(!env.temp_root().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_use_separate_workspaces() {
    let env = FakeToolEnv::new();
    env.delay_ffmpeg(0.2);
    let orchestrator = Arc::new(env.orchestrator_with(CompressorConfig {
        max_concurrent_jobs: 3,
        ..env.config()
    }));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let orchestrator = Arc::clone(&orchestrator);
        handles.push(tokio::spawn(async move {
            orchestrator
                .compress(
                    CompressionRequest::new(upload()),
                    None,
                    &CancellationToken::new(),
                )
                .await
        }));
    }
    let mut artifacts = Vec::new();
    for handle in handles {
        artifacts.push(handle.await.unwrap().unwrap());
    }

    let mut paths: Vec<_> = artifacts.iter().map(|a| a.path().to_path_buf()).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3);

    let mut passlogs: Vec<String> = env
        .ffmpeg_calls()
        .iter()
        .filter_map(|call| {
            call.split_whitespace()
                .skip_while(|a| *a != "-passlogfile")
                .nth(1)
                .map(str::to_string)
        })
        .collect();
    assert_eq!(passlogs.len(), 6);
    passlogs.sort();
    passlogs.dedup();
    assert_eq!(passlogs.len(), 3);
    assert!(env.live_workspaces().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_limit_serializes_encodes() {
    let env = FakeToolEnv::new();
    env.delay_ffmpeg(0.2);
    let orchestrator = Arc::new(env.orchestrator_with(CompressorConfig {
        max_concurrent_jobs: 1,
        ..env.config()
    }));

    let run = |orchestrator: Arc<mp4_squeeze::CompressionOrchestrator>| async move {
        orchestrator
            .compress(
                CompressionRequest::new(upload()),
                None,
                &CancellationToken::new(),
            )
            .await
    };
    let (a, b) = tokio::join!(
        tokio::spawn(run(Arc::clone(&orchestrator))),
        tokio::spawn(run(Arc::clone(&orchestrator)))
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    assert_eq!(env.ffmpeg_calls().len(), 4);
    assert!(!env.ffmpeg_overlapped());
    assert_eq!(orchestrator.available_slots(), 1);
}

#[tokio::test]
async fn repeated_requests_give_same_plan() {
    let env = FakeToolEnv::new();
    let orchestrator = env.orchestrator();
    let mut plans = Vec::new();
    for _ in 0..2 {
        let artifact = orchestrator
            .compress(
                CompressionRequest::new(upload()),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        plans.push((*artifact.plan(), artifact.dimensions(), artifact.size_bytes()));
    }
    assert_eq!(plans[0].0.video_bitrate_bps, plans[1].0.video_bitrate_bps);
    assert_eq!(plans[0].1, plans[1].1);
    assert_eq!(plans[0].2, plans[1].2);
}
