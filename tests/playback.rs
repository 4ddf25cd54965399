//! 端到端播放场景：合成媒体 + 无设备输出。

use crossbeam_channel::Receiver;
use myy_engine::core::{ErrorKind, PlaybackState, Stage};
use myy_engine::player::null_output::SinkRecorder;
use myy_engine::player::synthetic::{SyntheticAudio, SyntheticBackend, SyntheticMedia, SyntheticVideo};
use myy_engine::player::{NullOutput, StepDirection};
use myy_engine::{EngineConfig, MemoryPositionStore, PlaybackManager, PlayerError, PlayerEvent, PositionStore};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CLIP: &str = "clip.synthetic";

struct Harness {
    manager: PlaybackManager,
    recorder: SinkRecorder,
    store: Arc<MemoryPositionStore>,
    events: Receiver<PlayerEvent>,
}

fn harness(media: SyntheticMedia) -> Harness {
    harness_with(media, EngineConfig::default(), Arc::new(MemoryPositionStore::new()))
}

fn harness_with(media: SyntheticMedia, config: EngineConfig, store: Arc<MemoryPositionStore>) -> Harness {
    let backend = SyntheticBackend::new().with_media(CLIP, media);
    let output = NullOutput::new();
    let recorder = output.recorder();
    let manager = PlaybackManager::new(
        config,
        Arc::new(backend),
        Arc::new(output),
        Some(store.clone() as Arc<dyn PositionStore>),
    );
    let events = manager.subscribe();
    Harness {
        manager,
        recorder,
        store,
        events,
    }
}

/// 10 秒音视频，1 fps，第一帧在 0.5s，关键帧间隔 2 帧
fn one_fps_clip() -> SyntheticMedia {
    SyntheticMedia::av(10_000).with_video(SyntheticVideo {
        fps: 1.0,
        keyframe_interval: 2,
        width: 4,
        height: 4,
        start_ms: 500,
    })
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn wait_for_event(
    events: &Receiver<PlayerEvent>,
    timeout: Duration,
    pred: impl Fn(&PlayerEvent) -> bool,
) -> Option<PlayerEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn fatal_count(events: &Receiver<PlayerEvent>) -> usize {
    events
        .try_iter()
        .filter(|e| matches!(e, PlayerEvent::Fatal { .. }))
        .count()
}

#[test]
fn plays_five_seconds_and_presents_five_frames() {
    let mut h = harness(one_fps_clip());
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    thread::sleep(Duration::from_millis(5000));

    let position = h.manager.current_position();
    let presented = h.recorder.presented_video();
    h.manager.pause().unwrap();

    assert!((position - 5.0).abs() <= 0.2, "position {}", position);
    let pts: Vec<i64> = presented.iter().map(|f| f.pts).collect();
    assert_eq!(pts, vec![500, 1500, 2500, 3500, 4500]);
}

#[test]
fn seek_in_ready_then_play_starts_near_target() {
    let mut h = harness(one_fps_clip());
    h.manager.open(CLIP).unwrap();
    h.manager.seek(7.0).unwrap();
    assert_eq!(h.manager.current_state(), PlaybackState::Ready);
    assert!(wait_for_event(&h.events, Duration::from_secs(1), |e| matches!(
        e,
        PlayerEvent::SeekCompleted { .. }
    ))
    .is_some());

    h.manager.play().unwrap();
    assert!(wait_until(Duration::from_secs(3), || h.recorder.presented_count() > 0));
    let first = h.recorder.presented_video()[0].pts;
    // 关键帧 6.5s 到 目标 + 一帧时长
    assert!((6500..=8000).contains(&first), "first frame {}", first);
    assert!(h.manager.current_position() >= 7.0);
}

#[test]
fn audio_sink_failure_is_fatal_once() {
    let mut h = harness(SyntheticMedia::av(10_000));
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    assert!(wait_until(Duration::from_secs(2), || h.recorder.presented_count() > 3));

    h.recorder.fail_audio();
    assert!(wait_until(Duration::from_secs(2), || {
        h.manager.current_state() == PlaybackState::Error(ErrorKind::SinkError)
    }));
    let frozen = h.recorder.presented_count();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(h.recorder.presented_count(), frozen);

    let fatals: Vec<PlayerEvent> = h
        .events
        .try_iter()
        .filter(|e| matches!(e, PlayerEvent::Fatal { .. }))
        .collect();
    assert_eq!(fatals.len(), 1);
    assert!(matches!(
        fatals[0],
        PlayerEvent::Fatal {
            kind: ErrorKind::SinkError,
            stage: Stage::AudioSink,
            ..
        }
    ));

    // 出错后只能重新 open
    assert!(matches!(h.manager.play(), Err(PlayerError::InvalidState { .. })));
    assert!(matches!(h.manager.close(), Err(PlayerError::InvalidState { .. })));
    h.manager.open(CLIP).unwrap();
    assert_eq!(h.manager.current_state(), PlaybackState::Ready);
}

#[test]
fn pause_freezes_position_without_drift() {
    let mut h = harness(SyntheticMedia::av(10_000));
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    thread::sleep(Duration::from_millis(800));
    h.manager.pause().unwrap();
    let paused_at = h.manager.current_position();
    let frames = h.recorder.presented_count();

    thread::sleep(Duration::from_millis(500));
    assert_eq!(h.manager.current_position(), paused_at);
    assert_eq!(h.recorder.presented_count(), frames);

    h.manager.play().unwrap();
    thread::sleep(Duration::from_millis(500));
    let resumed = h.manager.current_position();
    assert!(
        (resumed - (paused_at + 0.5)).abs() <= 0.15,
        "paused at {} resumed at {}",
        paused_at,
        resumed
    );
}

#[test]
fn opening_missing_media_fails() {
    let mut h = harness(SyntheticMedia::av(1_000));
    let err = h.manager.open("missing.synthetic").unwrap_err();
    assert!(matches!(err, PlayerError::Open(_)));
    assert_eq!(
        h.manager.current_state(),
        PlaybackState::Error(ErrorKind::OpenFailed)
    );
    assert_eq!(fatal_count(&h.events), 1);
}

#[test]
fn video_pts_never_decreases_and_end_pauses() {
    let mut h = harness(SyntheticMedia::av(1_500));
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    assert!(wait_for_event(&h.events, Duration::from_secs(5), |e| *e == PlayerEvent::EndOfMedia).is_some());
    assert_eq!(h.manager.current_state(), PlaybackState::Paused);

    let pts: Vec<i64> = h.recorder.presented_video().iter().map(|f| f.pts).collect();
    assert!(pts.len() > 20);
    assert!(pts.windows(2).all(|w| w[0] <= w[1]), "{:?}", pts);
    assert!((h.manager.current_position() - 1.5).abs() <= 0.2);
}

#[test]
fn corrupt_packets_are_skipped() {
    let media = SyntheticMedia {
        corrupt_video_packets: vec![3],
        corrupt_reads: vec![10],
        ..SyntheticMedia::av(1_000)
    };
    let mut h = harness(media);
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    assert!(wait_for_event(&h.events, Duration::from_secs(4), |e| *e == PlayerEvent::EndOfMedia).is_some());

    let pts: Vec<i64> = h.recorder.presented_video().iter().map(|f| f.pts).collect();
    assert!(!pts.contains(&120), "{:?}", pts);
    assert!(pts.len() >= 15);
    assert_eq!(fatal_count(&h.events), 0);
}

#[test]
fn stop_persists_position_and_replays_from_start() {
    let mut h = harness(SyntheticMedia::av(10_000));
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    thread::sleep(Duration::from_millis(1000));
    h.manager.stop().unwrap();
    assert_eq!(h.manager.current_state(), PlaybackState::Stopped);

    let saved = h.store.load_position(CLIP).unwrap().unwrap();
    assert!((saved - 1.0).abs() <= 0.2, "saved {}", saved);
    assert_eq!(h.manager.current_position(), saved);

    h.recorder.clear_presented();
    h.manager.play().unwrap();
    assert!(wait_until(Duration::from_secs(2), || h.recorder.presented_count() > 0));
    assert!(h.recorder.presented_video()[0].pts < 200);
    assert_eq!(h.recorder.audio_sinks_opened(), 2);
}

#[test]
fn resumes_from_saved_position() {
    let store = Arc::new(MemoryPositionStore::new());
    store.save_position(CLIP, 4.0).unwrap();
    let mut h = harness_with(SyntheticMedia::av(10_000), EngineConfig::default(), store);
    h.manager.open(CLIP).unwrap();
    assert_eq!(h.manager.current_position(), 4.0);

    h.manager.play().unwrap();
    assert!(wait_until(Duration::from_secs(2), || h.recorder.presented_count() > 0));
    assert!(h.recorder.presented_video()[0].pts >= 3960);
}

#[test]
fn position_near_end_is_not_resumed() {
    let store = Arc::new(MemoryPositionStore::new());
    store.save_position(CLIP, 9.5).unwrap();
    let mut h = harness_with(SyntheticMedia::av(10_000), EngineConfig::default(), store);
    h.manager.open(CLIP).unwrap();
    assert_eq!(h.manager.current_position(), 0.0);
}

#[test]
fn invalid_transitions_are_rejected() {
    let mut h = harness(SyntheticMedia::av(2_000));
    assert!(matches!(h.manager.play(), Err(PlayerError::InvalidState { .. })));
    assert!(matches!(h.manager.seek(1.0), Err(PlayerError::InvalidState { .. })));
    assert!(h.manager.close().is_ok());

    h.manager.open(CLIP).unwrap();
    assert!(matches!(h.manager.pause(), Err(PlayerError::InvalidState { .. })));
    h.manager.stop().unwrap();
    assert!(matches!(h.manager.seek(1.0), Err(PlayerError::InvalidState { .. })));
    h.manager.close().unwrap();
    assert_eq!(h.manager.current_state(), PlaybackState::Idle);
}

#[test]
fn repeated_decoder_faults_become_fatal() {
    let media = SyntheticMedia {
        decoder_state_faults: vec![5, 6, 7, 8],
        ..SyntheticMedia::av(5_000)
    };
    let mut h = harness(media);
    let _ = h.manager.open(CLIP);
    assert!(wait_until(Duration::from_secs(2), || {
        h.manager.current_state() == PlaybackState::Error(ErrorKind::DecodeFailed)
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fatal_count(&h.events), 1);
}

#[test]
fn single_decoder_fault_recovers() {
    let media = SyntheticMedia {
        decoder_state_faults: vec![5],
        ..SyntheticMedia::av(1_000).without_audio()
    };
    let mut h = harness(media);
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    assert!(wait_for_event(&h.events, Duration::from_secs(3), |e| *e == PlayerEvent::EndOfMedia).is_some());
    assert_eq!(fatal_count(&h.events), 0);
    // 重建后等到下一个关键帧之前的帧都无法解码
    let pts: Vec<i64> = h.recorder.presented_video().iter().map(|f| f.pts).collect();
    assert!(pts.iter().all(|p| *p < 200));
}

#[test]
fn demux_io_failure_is_fatal() {
    let media = SyntheticMedia {
        io_failure_after: Some(40),
        ..SyntheticMedia::av(5_000)
    };
    let mut h = harness(media);
    let _ = h.manager.open(CLIP);
    assert!(wait_until(Duration::from_secs(2), || {
        h.manager.current_state() == PlaybackState::Error(ErrorKind::DemuxFailed)
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fatal_count(&h.events), 1);
}

#[test]
fn paused_seek_presents_one_preview_frame() {
    let mut h = harness(SyntheticMedia::av(10_000));
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    thread::sleep(Duration::from_millis(300));
    h.manager.pause().unwrap();
    h.recorder.clear_presented();

    h.manager.seek(3.0).unwrap();
    assert_eq!(h.manager.current_state(), PlaybackState::Paused);
    assert!(wait_until(Duration::from_secs(1), || h.recorder.presented_count() > 0));
    thread::sleep(Duration::from_millis(200));
    let pts: Vec<i64> = h.recorder.presented_video().iter().map(|f| f.pts).collect();
    assert_eq!(pts, vec![3000]);

    h.manager.frame_step(StepDirection::Forward).unwrap();
    assert!(wait_until(Duration::from_secs(1), || h.recorder.presented_count() > 1));
    assert_eq!(h.recorder.presented_video()[1].pts, 3040);
}

/// 解码负担重的片段：大画面 + 4 秒一个关键帧
fn heavy_gop_clip() -> SyntheticMedia {
    SyntheticMedia::av(10_000).with_video(SyntheticVideo {
        fps: 25.0,
        keyframe_interval: 100,
        width: 960,
        height: 540,
        start_ms: 0,
    })
}

#[test]
fn seek_while_playing_lands_within_one_frame_of_target() {
    let mut h = harness(heavy_gop_clip());
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    assert!(wait_until(Duration::from_secs(3), || h.recorder.presented_count() > 0));
    thread::sleep(Duration::from_millis(500));

    // 3.9s 不是关键帧，解码需要从 0s 开始追
    h.manager.seek(3.9).unwrap();
    h.recorder.clear_presented();
    assert_eq!(h.manager.current_state(), PlaybackState::Playing);
    assert!(wait_until(Duration::from_secs(5), || h.recorder.presented_count() > 3));

    let pts: Vec<i64> = h.recorder.presented_video().iter().map(|f| f.pts).collect();
    // 跨越目标位置的那一帧到 目标 + 一帧时长
    assert!((3860..=3940).contains(&pts[0]), "first frame after seek {:?}", pts);
    assert!(pts.windows(2).all(|w| w[0] < w[1]), "frames {:?}", pts);
    assert!(h.manager.current_position() >= 3.86);
    assert_eq!(fatal_count(&h.events), 0);
}

#[test]
fn audio_only_seek_while_playing_continues_from_target() {
    let mut h = harness(SyntheticMedia {
        duration_ms: 10_000,
        audio: Some(SyntheticAudio::default()),
        ..SyntheticMedia::default()
    });
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    thread::sleep(Duration::from_millis(300));

    h.manager.seek(6.0).unwrap();
    assert!(h.manager.current_position() >= 6.0);
    thread::sleep(Duration::from_millis(300));
    let position = h.manager.current_position();
    assert!((6.1..=6.5).contains(&position), "position {}", position);
    assert_eq!(h.manager.current_state(), PlaybackState::Playing);
}

#[test]
fn double_speed_plays_video_on_wall_clock() {
    let mut h = harness(SyntheticMedia::av(10_000));
    h.manager.open(CLIP).unwrap();
    h.manager.set_playback_speed(2.0);
    h.manager.play().unwrap();
    thread::sleep(Duration::from_millis(1000));
    let position = h.manager.current_position();
    assert!((1.7..=2.3).contains(&position), "position {}", position);

    let pts: Vec<i64> = h.recorder.presented_video().iter().map(|f| f.pts).collect();
    assert!(pts.len() > 10, "frames {:?}", pts);
    assert!(pts.windows(2).all(|w| w[0] < w[1]));

    h.manager.normal_speed();
    assert_eq!(h.manager.config().playback.speed, 1.0);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(fatal_count(&h.events), 0);
}

#[test]
fn screenshot_writes_image_files() {
    let mut h = harness(SyntheticMedia::av(5_000));
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    assert!(wait_until(Duration::from_secs(2), || h.recorder.presented_count() > 0));
    h.manager.pause().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let png = dir.path().join("shot.png");
    h.manager.screenshot(&png).unwrap();
    let image = image::open(&png).unwrap().to_rgb8();
    assert_eq!(image.dimensions(), (64, 36));
    // 合成画面的蓝色分量固定为 128
    assert_eq!(image.get_pixel(10, 10)[2], 128);

    let ppm = dir.path().join("shot.ppm");
    h.manager.screenshot(&ppm).unwrap();
    assert!(std::fs::read(&ppm).unwrap().starts_with(b"P6"));
}

#[test]
fn volume_and_mute() {
    let mut h = harness(SyntheticMedia::av(1_000));
    h.manager.set_volume(0.25);
    assert_eq!(h.manager.volume(), 0.25);
    h.manager.set_volume(3.0);
    assert_eq!(h.manager.volume(), 1.0);
    h.manager.set_muted(true);
    assert!(h.manager.is_muted());
    assert!(h.manager.config().audio.muted);
}

#[test]
fn audio_only_media_plays_on_audio_clock() {
    let media = SyntheticMedia {
        audio: Some(SyntheticAudio {
            sample_rate: 44_100,
            channels: 1,
            ..SyntheticAudio::default()
        }),
        ..SyntheticMedia::default()
    };
    let mut h = harness(SyntheticMedia {
        duration_ms: 800,
        ..media
    });
    h.manager.open(CLIP).unwrap();
    h.manager.play().unwrap();
    assert!(wait_for_event(&h.events, Duration::from_secs(3), |e| *e == PlayerEvent::EndOfMedia).is_some());
    // 输出格式由设备决定（默认 48kHz 双声道）
    assert!(h.recorder.audio_frames_written() >= 48_000 * 7 / 10);
    assert_eq!(h.recorder.presented_count(), 0);
    // 音频不经过同步决策：没有漂移记录，也没有粗同步
    let stats = h.manager.stats();
    assert!(stats.presented_audio > 0);
    assert_eq!(stats.resyncs, 0);
    assert_eq!(stats.average_drift_ms, 0.0);
}
