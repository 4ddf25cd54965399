//! 合成媒体后端：按参数生成音视频包，不依赖任何编解码库。
//!
//! 视频包按 GOP 排列关键帧，解码器带一帧预读（模拟 B 帧重排延迟）；
//! 音频包解码成正弦波。还支持在指定位置注入损坏包、I/O 失败和解码器状态错误。

use crate::core::{
    log_ctx, AudioFormat, AudioFrame, DecodeError, DemuxError, Frame, MediaKind, MediaSource,
    OpenError, Packet, PixelFormat, Rational, SeekError, StreamDescriptor, VideoFrame,
};
use crate::player::decoder::{Decoder, DecoderFactory, DecoderOptions};
use crate::player::demuxer_source::{DemuxerSource, MediaBackend};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::Arc;

pub const VIDEO_STREAM_ID: usize = 0;
pub const AUDIO_STREAM_ID: usize = 1;

/// `synthetic:<秒数>` 形式的路径直接生成音视频媒体
pub const URI_PREFIX: &str = "synthetic:";

const VIDEO_TIME_BASE: Rational = Rational {
    num: 1,
    den: 90_000,
};

const FLAG_CORRUPT: u8 = 0x01;
const FLAG_STATE_FAULT: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticVideo {
    pub fps: f64,
    pub keyframe_interval: u32,
    pub width: u32,
    pub height: u32,
    /// 第一帧的 PTS（毫秒）
    pub start_ms: i64,
}

impl Default for SyntheticVideo {
    fn default() -> Self {
        Self {
            fps: 25.0,
            keyframe_interval: 25,
            width: 64,
            height: 36,
            start_ms: 0,
        }
    }
}

impl SyntheticVideo {
    fn frame_ms(&self) -> f64 {
        1000.0 / self.fps.max(0.001)
    }

    fn pts_ms(&self, index: u64) -> i64 {
        self.start_ms + (index as f64 * self.frame_ms()).round() as i64
    }

    fn frame_count(&self, duration_ms: i64) -> u64 {
        if duration_ms <= self.start_ms {
            return 0;
        }
        ((duration_ms - self.start_ms) as f64 / self.frame_ms()).ceil() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub packet_frames: u32,
    pub tone_hz: f32,
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            packet_frames: 1024,
            tone_hz: 440.0,
        }
    }
}

impl SyntheticAudio {
    fn pts_ms(&self, index: u64) -> i64 {
        (index * self.packet_frames as u64 * 1000 / self.sample_rate.max(1) as u64) as i64
    }

    fn packet_count(&self, duration_ms: i64) -> u64 {
        let total_frames = duration_ms.max(0) as u64 * self.sample_rate as u64 / 1000;
        total_frames.div_ceil(self.packet_frames.max(1) as u64)
    }

    /// 位于 ms 处（或之前）的包序号
    fn index_at(&self, ms: i64) -> u64 {
        ms.max(0) as u64 * self.sample_rate as u64 / 1000 / self.packet_frames.max(1) as u64
    }
}

/// 合成媒体描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticMedia {
    pub duration_ms: i64,
    pub video: Option<SyntheticVideo>,
    pub audio: Option<SyntheticAudio>,
    pub seekable: bool,
    /// 这些视频包（序号从 0 开始）解码时报告损坏
    pub corrupt_video_packets: Vec<u64>,
    /// 这些视频包解码时报告解码器状态损坏
    pub decoder_state_faults: Vec<u64>,
    /// 第 N 次读取（从 1 开始）报告损坏包头
    pub corrupt_reads: Vec<u64>,
    /// 成功读取 N 次之后发生 I/O 错误
    pub io_failure_after: Option<u64>,
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            video: None,
            audio: None,
            seekable: true,
            corrupt_video_packets: Vec::new(),
            decoder_state_faults: Vec::new(),
            corrupt_reads: Vec::new(),
            io_failure_after: None,
        }
    }
}

impl SyntheticMedia {
    /// 默认参数的音视频媒体
    pub fn av(duration_ms: i64) -> Self {
        Self {
            duration_ms,
            video: Some(SyntheticVideo::default()),
            audio: Some(SyntheticAudio::default()),
            ..Self::default()
        }
    }

    pub fn with_video(mut self, video: SyntheticVideo) -> Self {
        self.video = Some(video);
        self
    }

    pub fn with_audio(mut self, audio: SyntheticAudio) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn without_audio(mut self) -> Self {
        self.audio = None;
        self
    }

    /// 解析 `synthetic:<秒数>`
    pub fn from_uri(uri: &str) -> Option<Self> {
        let seconds: f64 = uri.strip_prefix(URI_PREFIX)?.trim().parse().ok()?;
        (seconds > 0.0).then(|| Self::av((seconds * 1000.0).round() as i64))
    }

    fn streams(&self) -> Vec<StreamDescriptor> {
        let mut streams = Vec::new();
        if let Some(video) = &self.video {
            streams.push(StreamDescriptor {
                id: VIDEO_STREAM_ID,
                kind: MediaKind::Video,
                codec: "synthetic-rgba".into(),
                time_base: VIDEO_TIME_BASE,
                frame_rate: Some(video.fps),
                sample_rate: None,
                channels: None,
                width: Some(video.width),
                height: Some(video.height),
            });
        }
        if let Some(audio) = &self.audio {
            streams.push(StreamDescriptor {
                id: AUDIO_STREAM_ID,
                kind: MediaKind::Audio,
                codec: "synthetic-sine".into(),
                time_base: Rational::new(1, audio.sample_rate as i32),
                frame_rate: None,
                sample_rate: Some(audio.sample_rate),
                channels: Some(audio.channels),
                width: None,
                height: None,
            });
        }
        streams
    }
}

/// 合成媒体后端：路径 -> 媒体描述
#[derive(Clone, Default)]
pub struct SyntheticBackend {
    catalog: Arc<Mutex<HashMap<String, SyntheticMedia>>>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media(self, path: impl Into<String>, media: SyntheticMedia) -> Self {
        self.insert(path, media);
        self
    }

    pub fn insert(&self, path: impl Into<String>, media: SyntheticMedia) {
        self.catalog.lock().insert(path.into(), media);
    }
}

impl MediaBackend for SyntheticBackend {
    fn open(&self, source: &MediaSource) -> Result<Box<dyn DemuxerSource>, OpenError> {
        let key = source.as_str();
        let media = self
            .catalog
            .lock()
            .get(&key)
            .cloned()
            .or_else(|| SyntheticMedia::from_uri(&key))
            .ok_or_else(|| OpenError::Unreadable(key.clone()))?;
        if media.video.is_none() && media.audio.is_none() {
            return Err(OpenError::NoDecodableStreams);
        }
        info!("{} 🧪 打开合成媒体: {} ({}ms)", log_ctx(), key, media.duration_ms);
        Ok(Box::new(SyntheticSource::new(key, media)))
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

/// 合成数据源：按 PTS 交错输出音视频包
pub struct SyntheticSource {
    name: String,
    media: SyntheticMedia,
    streams: Vec<StreamDescriptor>,
    next_video: u64,
    next_audio: u64,
    reads: u64,
}

impl SyntheticSource {
    pub fn new(name: impl Into<String>, media: SyntheticMedia) -> Self {
        let streams = media.streams();
        Self {
            name: name.into(),
            media,
            streams,
            next_video: 0,
            next_audio: 0,
            reads: 0,
        }
    }

    fn video_packet(&self, video: &SyntheticVideo, index: u64) -> Packet {
        let pts_ms = video.pts_ms(index);
        let mut flags = 0;
        if self.media.corrupt_video_packets.contains(&index) {
            flags |= FLAG_CORRUPT;
        }
        if self.media.decoder_state_faults.contains(&index) {
            flags |= FLAG_STATE_FAULT;
        }
        let pts = VIDEO_TIME_BASE.from_millis(pts_ms);
        Packet {
            stream_id: VIDEO_STREAM_ID,
            pts: Some(pts),
            dts: Some(pts),
            duration: VIDEO_TIME_BASE.from_millis(video.frame_ms().round() as i64),
            keyframe: index % video.keyframe_interval.max(1) as u64 == 0,
            data: encode_payload(b'V', index, flags),
        }
    }

    fn audio_packet(&self, audio: &SyntheticAudio, index: u64) -> Packet {
        let pts = (index * audio.packet_frames as u64) as i64;
        Packet {
            stream_id: AUDIO_STREAM_ID,
            pts: Some(pts),
            dts: Some(pts),
            duration: audio.packet_frames as i64,
            keyframe: true,
            data: encode_payload(b'A', index, 0),
        }
    }
}

fn encode_payload(tag: u8, index: u64, flags: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity(10);
    data.push(tag);
    data.extend_from_slice(&index.to_le_bytes());
    data.push(flags);
    data
}

fn decode_payload(tag: u8, data: &[u8]) -> Result<(u64, u8), DecodeError> {
    if data.len() != 10 || data[0] != tag {
        return Err(DecodeError::Corrupt(format!("无效的负载 ({} 字节)", data.len())));
    }
    let mut index = [0u8; 8];
    index.copy_from_slice(&data[1..9]);
    Ok((u64::from_le_bytes(index), data[9]))
}

impl DemuxerSource for SyntheticSource {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        self.reads += 1;
        if let Some(limit) = self.media.io_failure_after {
            if self.reads > limit {
                return Err(DemuxError::Io(format!("第 {} 次读取失败", self.reads)));
            }
        }
        if self.media.corrupt_reads.contains(&self.reads) {
            return Err(DemuxError::Corrupt(format!("第 {} 次读取包头损坏", self.reads)));
        }

        let duration = self.media.duration_ms;
        let video_pts = self
            .media
            .video
            .as_ref()
            .filter(|v| self.next_video < v.frame_count(duration))
            .map(|v| v.pts_ms(self.next_video));
        let audio_pts = self
            .media
            .audio
            .as_ref()
            .filter(|a| self.next_audio < a.packet_count(duration))
            .map(|a| a.pts_ms(self.next_audio));

        let next_kind = match (video_pts, audio_pts) {
            (Some(vp), Some(ap)) if vp <= ap => MediaKind::Video,
            (Some(_), None) => MediaKind::Video,
            (_, Some(_)) => MediaKind::Audio,
            (None, None) => return Ok(None),
        };
        let packet = match (next_kind, &self.media.video, &self.media.audio) {
            (MediaKind::Video, Some(video), _) => self.video_packet(video, self.next_video),
            (MediaKind::Audio, _, Some(audio)) => self.audio_packet(audio, self.next_audio),
            _ => return Ok(None),
        };
        match next_kind {
            MediaKind::Video => self.next_video += 1,
            MediaKind::Audio => self.next_audio += 1,
        }
        Ok(Some(packet))
    }

    fn seek(&mut self, target_ms: i64) -> Result<i64, SeekError> {
        if !self.media.seekable {
            return Err(SeekError::NotSeekable);
        }
        let duration = self.media.duration_ms;
        let target = target_ms.clamp(0, duration.max(0));
        let actual = match &self.media.video {
            Some(video) => {
                let count = video.frame_count(duration);
                let nearest = if target <= video.start_ms {
                    0
                } else {
                    ((target - video.start_ms) as f64 / video.frame_ms()).floor() as u64
                };
                let nearest = nearest.min(count.saturating_sub(1));
                let keyframe = nearest - nearest % video.keyframe_interval.max(1) as u64;
                self.next_video = keyframe;
                video.pts_ms(keyframe)
            }
            None => target,
        };
        if let Some(audio) = &self.media.audio {
            self.next_audio = audio.index_at(actual.min(target));
        }
        debug!(
            "{} ⏩ 合成媒体 seek: 目标 {}ms -> 关键帧 {}ms",
            log_ctx(),
            target_ms,
            actual
        );
        Ok(actual)
    }

    fn duration_ms(&self) -> Option<i64> {
        Some(self.media.duration_ms)
    }

    fn decoder_factory(
        &self,
        stream_id: usize,
        options: &DecoderOptions,
    ) -> Result<Box<dyn DecoderFactory>, OpenError> {
        let stream = self
            .streams
            .iter()
            .find(|s| s.id == stream_id)
            .cloned()
            .ok_or(OpenError::NoDecodableStreams)?;
        Ok(Box::new(SyntheticDecoderFactory {
            stream,
            video: self.media.video.clone(),
            audio: self.media.audio.clone(),
            audio_target: options.audio_target,
        }))
    }

    fn is_seekable(&self) -> bool {
        self.media.seekable
    }

    fn description(&self) -> String {
        format!(
            "synthetic {} ({}ms, {} streams)",
            self.name,
            self.media.duration_ms,
            self.streams.len()
        )
    }
}

pub struct SyntheticDecoderFactory {
    stream: StreamDescriptor,
    video: Option<SyntheticVideo>,
    audio: Option<SyntheticAudio>,
    audio_target: Option<AudioFormat>,
}

impl DecoderFactory for SyntheticDecoderFactory {
    fn create(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        match self.stream.kind {
            MediaKind::Video => {
                let video = self
                    .video
                    .clone()
                    .ok_or_else(|| DecodeError::Unsupported("缺少视频参数".into()))?;
                Ok(Box::new(SyntheticVideoDecoder {
                    time_base: self.stream.time_base,
                    video,
                    held: None,
                    need_keyframe: true,
                }))
            }
            MediaKind::Audio => {
                let audio = self
                    .audio
                    .clone()
                    .ok_or_else(|| DecodeError::Unsupported("缺少音频参数".into()))?;
                let output = self.audio_target.unwrap_or(AudioFormat {
                    sample_rate: audio.sample_rate,
                    channels: audio.channels,
                });
                Ok(Box::new(SyntheticAudioDecoder {
                    time_base: self.stream.time_base,
                    audio,
                    output,
                }))
            }
        }
    }
}

/// 带一帧预读的视频解码器
pub struct SyntheticVideoDecoder {
    time_base: Rational,
    video: SyntheticVideo,
    held: Option<VideoFrame>,
    need_keyframe: bool,
}

impl SyntheticVideoDecoder {
    fn render(&self, index: u64, pts: i64) -> VideoFrame {
        let pixels = (self.video.width * self.video.height) as usize;
        let shade = [
            (index * 37 % 256) as u8,
            (index * 91 % 256) as u8,
            128,
            255,
        ];
        let mut data = Vec::with_capacity(pixels * 4);
        for _ in 0..pixels {
            data.extend_from_slice(&shade);
        }
        VideoFrame {
            pts,
            duration: self.video.frame_ms().round() as i64,
            width: self.video.width,
            height: self.video.height,
            format: PixelFormat::RGBA,
            data,
        }
    }
}

impl Decoder for SyntheticVideoDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, DecodeError> {
        let (index, flags) = decode_payload(b'V', &packet.data)?;
        if flags & FLAG_CORRUPT != 0 {
            return Err(DecodeError::Corrupt(format!("视频包 #{} 损坏", index)));
        }
        if flags & FLAG_STATE_FAULT != 0 {
            return Err(DecodeError::State(format!("视频包 #{} 触发解码器故障", index)));
        }
        if self.need_keyframe {
            if !packet.keyframe {
                // 缺少参考帧，丢弃直到下一个关键帧
                return Ok(Vec::new());
            }
            self.need_keyframe = false;
        }
        let pts = self.time_base.to_millis(packet.pts.unwrap_or(0));
        let frame = self.render(index, pts);
        Ok(self.held.replace(frame).map(Frame::Video).into_iter().collect())
    }

    fn flush(&mut self) {
        self.held = None;
        self.need_keyframe = true;
    }

    fn drain(&mut self) -> Result<Vec<Frame>, DecodeError> {
        Ok(self.held.take().map(Frame::Video).into_iter().collect())
    }

    fn description(&self) -> String {
        format!(
            "synthetic video {}x{} @ {}fps",
            self.video.width, self.video.height, self.video.fps
        )
    }
}

/// 正弦波音频解码器（按目标格式输出）
pub struct SyntheticAudioDecoder {
    time_base: Rational,
    audio: SyntheticAudio,
    output: AudioFormat,
}

impl Decoder for SyntheticAudioDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, DecodeError> {
        let (index, _) = decode_payload(b'A', &packet.data)?;
        let in_rate = self.audio.sample_rate.max(1) as f64;
        let out_rate = self.output.sample_rate.max(1);
        let channels = self.output.channels.max(1) as usize;
        let frames = (self.audio.packet_frames as f64 * out_rate as f64 / in_rate).round() as usize;
        let start_secs = (index * self.audio.packet_frames as u64) as f64 / in_rate;

        let mut data = Vec::with_capacity(frames * channels);
        for n in 0..frames {
            let t = start_secs + n as f64 / out_rate as f64;
            let value = ((TAU * self.audio.tone_hz as f64 * t).sin() * 0.1) as f32;
            data.extend(std::iter::repeat(value).take(channels));
        }
        Ok(vec![Frame::Audio(AudioFrame {
            pts: self.time_base.to_millis(packet.pts.unwrap_or(0)),
            duration: (frames as i64 * 1000) / out_rate as i64,
            sample_rate: out_rate,
            channels: channels as u16,
            data,
        })])
    }

    fn flush(&mut self) {}

    fn drain(&mut self) -> Result<Vec<Frame>, DecodeError> {
        Ok(Vec::new())
    }

    fn description(&self) -> String {
        format!(
            "synthetic audio {}Hz/{}ch -> {}Hz/{}ch",
            self.audio.sample_rate, self.audio.channels, self.output.sample_rate, self.output.channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_fps() -> SyntheticMedia {
        SyntheticMedia {
            duration_ms: 10_000,
            video: Some(SyntheticVideo {
                fps: 1.0,
                keyframe_interval: 2,
                width: 2,
                height: 2,
                start_ms: 500,
            }),
            ..SyntheticMedia::default()
        }
    }

    fn drain_source(source: &mut SyntheticSource) -> Vec<Packet> {
        std::iter::from_fn(|| source.read_packet().unwrap()).collect()
    }

    #[test]
    fn interleaves_by_timestamp() {
        let mut source = SyntheticSource::new("t", SyntheticMedia::av(200));
        let packets = drain_source(&mut source);
        let video = packets.iter().filter(|p| p.stream_id == VIDEO_STREAM_ID).count();
        let audio = packets.iter().filter(|p| p.stream_id == AUDIO_STREAM_ID).count();
        assert_eq!(video, 5);
        assert_eq!(audio, 10);
        assert_eq!(packets[0].stream_id, VIDEO_STREAM_ID);
    }

    #[test]
    fn seek_lands_on_preceding_keyframe() {
        let mut source = SyntheticSource::new("t", one_fps());
        // 帧 PTS: 500, 1500, ... 关键帧每 2 帧
        assert_eq!(source.seek(7000).unwrap(), 6500);
        let packet = source.read_packet().unwrap().unwrap();
        assert!(packet.keyframe);
        assert_eq!(VIDEO_TIME_BASE.to_millis(packet.pts.unwrap()), 6500);
        assert_eq!(source.seek(-5).unwrap(), 500);
        assert_eq!(source.seek(60_000).unwrap(), 8500);
    }

    #[test]
    fn video_decoder_delays_one_frame_and_drains() {
        let mut source = SyntheticSource::new("t", one_fps());
        let factory = source
            .decoder_factory(VIDEO_STREAM_ID, &DecoderOptions::default())
            .unwrap();
        let mut decoder = factory.create().unwrap();
        let first = source.read_packet().unwrap().unwrap();
        let second = source.read_packet().unwrap().unwrap();
        assert!(decoder.decode(&first).unwrap().is_empty());
        let out = decoder.decode(&second).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pts(), 500);
        let drained = decoder.drain().unwrap();
        assert_eq!(drained[0].pts(), 1500);
    }

    #[test]
    fn flushed_decoder_waits_for_keyframe() {
        let mut source = SyntheticSource::new("t", one_fps());
        let factory = source
            .decoder_factory(VIDEO_STREAM_ID, &DecoderOptions::default())
            .unwrap();
        let mut decoder = factory.create().unwrap();
        let packets = drain_source(&mut source);
        decoder.decode(&packets[0]).unwrap();
        decoder.flush();
        assert!(decoder.drain().unwrap().is_empty());
        // 序号 1 不是关键帧
        assert!(decoder.decode(&packets[1]).unwrap().is_empty());
        assert!(decoder.drain().unwrap().is_empty());
        decoder.decode(&packets[2]).unwrap();
        assert_eq!(decoder.drain().unwrap()[0].pts(), 2500);
    }

    #[test]
    fn injected_faults_surface_as_errors() {
        let mut media = one_fps();
        media.corrupt_video_packets = vec![1];
        media.corrupt_reads = vec![3];
        media.io_failure_after = Some(4);
        let mut source = SyntheticSource::new("t", media);
        let factory = source
            .decoder_factory(VIDEO_STREAM_ID, &DecoderOptions::default())
            .unwrap();
        let mut decoder = factory.create().unwrap();

        let p0 = source.read_packet().unwrap().unwrap();
        let p1 = source.read_packet().unwrap().unwrap();
        assert!(decoder.decode(&p0).is_ok());
        assert!(matches!(decoder.decode(&p1), Err(DecodeError::Corrupt(_))));
        assert!(matches!(source.read_packet(), Err(DemuxError::Corrupt(_))));
        assert!(source.read_packet().unwrap().is_some());
        assert!(matches!(source.read_packet(), Err(DemuxError::Io(_))));
    }

    #[test]
    fn audio_decoder_resamples_to_target() {
        let media = SyntheticMedia::default().with_audio(SyntheticAudio {
            sample_rate: 24_000,
            channels: 1,
            packet_frames: 480,
            tone_hz: 440.0,
        });
        let mut source = SyntheticSource::new("t", media);
        let options = DecoderOptions {
            audio_target: Some(AudioFormat {
                sample_rate: 48_000,
                channels: 2,
            }),
        };
        let mut decoder = source
            .decoder_factory(AUDIO_STREAM_ID, &options)
            .unwrap()
            .create()
            .unwrap();
        let packet = source.read_packet().unwrap().unwrap();
        match &decoder.decode(&packet).unwrap()[0] {
            Frame::Audio(frame) => {
                assert_eq!(frame.frames(), 960);
                assert_eq!(frame.channels, 2);
                assert_eq!(frame.duration, 20);
            }
            Frame::Video(_) => panic!("expected audio"),
        }
    }

    #[test]
    fn unknown_path_is_unreadable() {
        let backend = SyntheticBackend::new().with_media("a.mp4", one_fps());
        assert!(backend.open(&MediaSource::new("a.mp4")).is_ok());
        assert!(backend.open(&MediaSource::new("synthetic:3")).is_ok());
        assert!(matches!(
            backend.open(&MediaSource::new("missing.mp4")),
            Err(OpenError::Unreadable(_))
        ));
    }
}
