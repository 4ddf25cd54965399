use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{info, warn};
use myy_engine::core::log_ctx;
use myy_engine::player::synthetic::URI_PREFIX;
use myy_engine::player::{MediaBackend, OutputBackend, Playlist, PlaylistEntry, SyntheticBackend};
use myy_engine::{
    EngineConfig, PlaybackManager, PlaybackState, PlayerEvent, PositionStore, SqlitePositionStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 无界面播放器：按播放列表依次打开媒体、播放并输出状态
#[derive(Parser, Debug)]
#[command(name = "myy-play", version)]
struct Args {
    /// 媒体文件路径，可以有多个（`synthetic:<秒数>` 使用合成测试源）
    paths: Vec<PathBuf>,

    /// 列表播完后从头循环
    #[arg(long = "loop")]
    repeat: bool,

    /// 随机播放
    #[arg(long)]
    shuffle: bool,

    /// 播放速度（0.25 ~ 4.0）
    #[arg(long)]
    speed: Option<f64>,

    /// JSON 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 播放历史数据库（覆盖配置文件中的 database_path）
    #[arg(long)]
    db: Option<PathBuf>,

    /// 起始位置（秒）
    #[arg(long)]
    start: Option<f64>,

    /// 最多播放多少秒后停止（整个列表）
    #[arg(long)]
    duration: Option<f64>,

    /// 列出最近播放记录后退出
    #[arg(long)]
    history: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    info!("🎬 myy-play 启动");

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(speed) = args.speed {
        config.playback.speed = speed;
    }

    let db_path = args.db.clone().or_else(|| config.database_path.clone());
    let store: Option<Arc<dyn PositionStore>> = match db_path {
        Some(path) => match SqlitePositionStore::open(&path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("⚠️ 播放历史不可用: {}", e);
                None
            }
        },
        None => None,
    };

    if args.history {
        let store = store.ok_or_else(|| anyhow!("未指定播放历史数据库 (--db)"))?;
        for entry in store.recent(20)? {
            println!("{:>10.1}s  {}", entry.position, entry.media_id);
        }
        return Ok(());
    }

    let mut playlist = Playlist::new();
    for path in &args.paths {
        playlist.add(PlaylistEntry::new(path));
    }
    if args.shuffle {
        playlist.next(false, true);
    }
    let first = playlist
        .current()
        .map(|entry| entry.path.clone())
        .ok_or_else(|| anyhow!("需要指定媒体路径"))?;
    let backend = media_backend(&first)?;
    let output = output_backend();

    let mut manager = PlaybackManager::new(config, backend, output, store);
    let events = manager.subscribe();

    let limit = args.duration.map(Duration::from_secs_f64);
    let started = Instant::now();
    let mut start = args.start;
    while let Some(entry) = playlist.current().cloned() {
        let finished = play_entry(&mut manager, &events, &entry, start.take(), || {
            limit.is_some_and(|limit| started.elapsed() >= limit)
        })?;
        if !finished {
            info!("⏱️ 达到播放时长上限");
            break;
        }
        if playlist.next(args.repeat, args.shuffle).is_none() {
            info!("🏁 播放列表结束");
            break;
        }
    }

    if manager.current_state() == PlaybackState::Playing {
        manager.pause()?;
    }
    manager.close()?;
    Ok(())
}

/// 播放一个条目直到结束；返回 false 表示时长上限已到
fn play_entry(
    manager: &mut PlaybackManager,
    events: &Receiver<PlayerEvent>,
    entry: &PlaylistEntry,
    start: Option<f64>,
    expired: impl Fn() -> bool,
) -> Result<bool> {
    info!("{} ▶️ 播放: {}", log_ctx(), entry.title);
    let media = manager.open(entry.path())?;
    info!(
        "{} 📋 时长 {:?}ms, {} 条流",
        log_ctx(),
        media.duration,
        media.streams.len()
    );
    if let Some(start) = start {
        manager.seek(start)?;
    }
    manager.play()?;

    let mut last_report = Instant::now();
    loop {
        if expired() {
            return Ok(false);
        }
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(PlayerEvent::EndOfMedia) => {
                info!("🏁 播放结束: {}", entry.title);
                return Ok(true);
            }
            Ok(PlayerEvent::Fatal {
                kind,
                stage,
                message,
            }) => {
                return Err(anyhow!("播放失败 [{:?} @ {:?}]: {}", kind, stage, message));
            }
            Ok(event) => info!("📣 {:?}", event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(false),
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            let stats = manager.stats();
            println!(
                "{:>8.2}s  {:.2}x  呈现 {} 帧, 丢弃 {} 帧, 漂移 {:.1}ms",
                manager.current_position(),
                manager.playback_speed(),
                stats.presented_video,
                stats.dropped_video,
                stats.average_drift_ms
            );
        }
    }
}

fn media_backend(path: &std::path::Path) -> Result<Arc<dyn MediaBackend>> {
    if path.to_string_lossy().starts_with(URI_PREFIX) {
        return Ok(Arc::new(SyntheticBackend::new()));
    }
    #[cfg(feature = "ffmpeg")]
    {
        Ok(Arc::new(myy_engine::player::FfmpegBackend))
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Err(anyhow!(
            "未启用 ffmpeg feature，只能播放 {}<秒数> 合成源",
            URI_PREFIX
        ))
    }
}

fn output_backend() -> Arc<dyn OutputBackend> {
    #[cfg(feature = "audio-device")]
    {
        Arc::new(myy_engine::player::CpalOutput::new())
    }
    #[cfg(not(feature = "audio-device"))]
    {
        Arc::new(myy_engine::player::NullOutput::new())
    }
}
