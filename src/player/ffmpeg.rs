//! FFmpeg 媒体后端（`ffmpeg` feature）。

use crate::core::{
    log_ctx, AudioFormat, AudioFrame, DecodeError, DemuxError, Frame, MediaKind, MediaSource,
    OpenError, Packet, PixelFormat, Rational, SeekError, StreamDescriptor, VideoFrame,
    timeline_origin_ms,
};
use crate::player::decoder::{Decoder, DecoderFactory, DecoderOptions};
use crate::player::demuxer_source::{DemuxerSource, MediaBackend};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media, software, util};
use log::{debug, info, warn};
use std::sync::Once;

static INIT: Once = Once::new();

fn ensure_init() {
    INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("FFmpeg 初始化失败: {}", e);
        }
    });
}

fn rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

/// FFmpeg 后端
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

impl MediaBackend for FfmpegBackend {
    fn open(&self, source: &MediaSource) -> Result<Box<dyn DemuxerSource>, OpenError> {
        ensure_init();
        Ok(Box::new(FfmpegDemuxer::open(source)?))
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

/// 解封装器 - 负责读取媒体文件并分离音视频流
pub struct FfmpegDemuxer {
    input_ctx: format::context::Input,
    streams: Vec<StreamDescriptor>,
    parameters: Vec<(usize, codec::Parameters)>,
    duration_ms: Option<i64>,
    /// 时间轴起点（毫秒），对外的时间戳都相对于它
    origin_ms: i64,
    /// seek 时为确定关键帧位置预读的包
    peeked: Option<Packet>,
    source_path: String,
}

// Input/Parameters 内部是裸指针；解封装器只被 Demuxer 线程独占使用
unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    pub fn open(source: &MediaSource) -> Result<Self, OpenError> {
        let path = source.as_str();
        info!("{} 正在打开文件: {}", log_ctx(), path);

        let input_ctx = format::input(&source.path).map_err(|e| match e {
            ffmpeg::Error::InvalidData | ffmpeg::Error::DemuxerNotFound => {
                OpenError::Unsupported(format!("{}: {}", path, e))
            }
            other => OpenError::Unreadable(format!("{}: {}", path, other)),
        })?;

        let mut streams = Vec::new();
        let mut parameters = Vec::new();
        let mut starts = Vec::new();
        for kind in [MediaKind::Video, MediaKind::Audio] {
            let medium = match kind {
                MediaKind::Video => media::Type::Video,
                MediaKind::Audio => media::Type::Audio,
            };
            let Some(stream) = input_ctx.streams().best(medium) else {
                continue;
            };
            let params = stream.parameters();
            let codec_name = params.id().name().to_string();
            let mut desc = StreamDescriptor {
                id: stream.index(),
                kind,
                codec: codec_name,
                time_base: rational(stream.time_base()),
                frame_rate: None,
                sample_rate: None,
                channels: None,
                width: None,
                height: None,
            };
            let context = codec::context::Context::from_parameters(params.clone())
                .map_err(|e| OpenError::Unsupported(e.to_string()))?;
            match kind {
                MediaKind::Video => {
                    if let Ok(decoder) = context.decoder().video() {
                        desc.width = Some(decoder.width());
                        desc.height = Some(decoder.height());
                    }
                    let fps = stream.avg_frame_rate();
                    if fps.denominator() != 0 && fps.numerator() > 0 {
                        desc.frame_rate = Some(fps.numerator() as f64 / fps.denominator() as f64);
                    }
                }
                MediaKind::Audio => {
                    if let Ok(decoder) = context.decoder().audio() {
                        desc.sample_rate = Some(decoder.rate());
                        desc.channels = Some(decoder.channels());
                    }
                }
            }
            let start = stream.start_time();
            starts.push((desc.time_base, (start != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(start)));
            debug!("{} {} 流: {:?} (起始 {})", log_ctx(), kind, desc, start);
            parameters.push((desc.id, params));
            streams.push(desc);
        }

        if streams.is_empty() {
            return Err(OpenError::NoDecodableStreams);
        }

        let duration = input_ctx.duration();
        let duration_ms = (duration > 0).then(|| duration / 1000);
        let origin_ms = timeline_origin_ms(starts);
        if origin_ms != 0 {
            info!("{} 时间轴起点: {}ms", log_ctx(), origin_ms);
        }

        Ok(Self {
            input_ctx,
            streams,
            parameters,
            duration_ms,
            origin_ms,
            peeked: None,
            source_path: path,
        })
    }

    fn read_next(&mut self) -> Result<Option<Packet>, DemuxError> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input_ctx) {
            Ok(()) => Ok(Some(Packet {
                stream_id: packet.stream(),
                pts: packet.pts(),
                dts: packet.dts(),
                duration: packet.duration(),
                keyframe: packet.is_key(),
                data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
            })),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(ffmpeg::Error::InvalidData) => Err(DemuxError::Corrupt("无效数据".into())),
            Err(ffmpeg::Error::Other { errno: 11 }) => Err(DemuxError::Corrupt("EAGAIN".into())),
            Err(e) => Err(DemuxError::Io(e.to_string())),
        }
    }

    /// 包时间戳换算为相对起点的毫秒
    fn packet_millis(&self, packet: &Packet) -> Option<i64> {
        let time_base = self
            .streams
            .iter()
            .find(|s| s.id == packet.stream_id)?
            .time_base;
        packet
            .pts
            .or(packet.dts)
            .map(|ts| time_base.to_millis(ts) - self.origin_ms)
    }
}

impl DemuxerSource for FfmpegDemuxer {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        match self.peeked.take() {
            Some(packet) => Ok(Some(packet)),
            None => self.read_next(),
        }
    }

    fn seek(&mut self, target_ms: i64) -> Result<i64, SeekError> {
        let timestamp = (target_ms + self.origin_ms) * 1000; // 毫秒转微秒
        self.peeked = None;
        self.input_ctx
            .seek(timestamp, ..timestamp)
            .map_err(|e| SeekError::Backend(e.to_string()))?;
        // 预读定位后的第一个包，报告实际落到的关键帧位置
        match self.read_next() {
            Ok(Some(packet)) => {
                let actual = self.packet_millis(&packet).unwrap_or(target_ms);
                self.peeked = Some(packet);
                Ok(actual)
            }
            Ok(None) => Ok(target_ms),
            Err(e) => {
                warn!("{} ⚠️ seek 后预读失败: {}", log_ctx(), e);
                Ok(target_ms)
            }
        }
    }

    fn duration_ms(&self) -> Option<i64> {
        self.duration_ms
    }

    fn decoder_factory(
        &self,
        stream_id: usize,
        options: &DecoderOptions,
    ) -> Result<Box<dyn DecoderFactory>, OpenError> {
        let desc = self
            .streams
            .iter()
            .find(|s| s.id == stream_id)
            .cloned()
            .ok_or(OpenError::NoDecodableStreams)?;
        let parameters = self
            .parameters
            .iter()
            .find(|(id, _)| *id == stream_id)
            .map(|(_, p)| p.clone())
            .ok_or(OpenError::NoDecodableStreams)?;
        let factory = FfmpegDecoderFactory {
            desc,
            parameters,
            audio_target: options.audio_target,
            origin_ms: self.origin_ms,
        };
        // 立即试建一次，不支持的编码在 open 阶段就暴露
        factory
            .create()
            .map_err(|e| OpenError::Unsupported(e.to_string()))?;
        Ok(Box::new(factory))
    }

    fn description(&self) -> String {
        format!("FFmpeg Demuxer: {}", self.source_path)
    }
}

pub struct FfmpegDecoderFactory {
    desc: StreamDescriptor,
    parameters: codec::Parameters,
    audio_target: Option<AudioFormat>,
    origin_ms: i64,
}

// Parameters 只在 create() 中被克隆读取
unsafe impl Send for FfmpegDecoderFactory {}
unsafe impl Sync for FfmpegDecoderFactory {}

impl DecoderFactory for FfmpegDecoderFactory {
    fn create(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        let context = codec::context::Context::from_parameters(self.parameters.clone())
            .map_err(|e| DecodeError::Unsupported(e.to_string()))?;
        match self.desc.kind {
            MediaKind::Video => {
                let decoder = context
                    .decoder()
                    .video()
                    .map_err(|e| DecodeError::Unsupported(e.to_string()))?;
                debug!(
                    "软件解码器: {}x{}, 格式: {:?}",
                    decoder.width(),
                    decoder.height(),
                    decoder.format()
                );
                Ok(Box::new(FfmpegVideoDecoder {
                    decoder,
                    scaler: None,
                    time_base: self.desc.time_base,
                    origin_ms: self.origin_ms,
                    frame_ms: self.desc.frame_duration_ms().unwrap_or(0),
                }))
            }
            MediaKind::Audio => {
                let decoder = context
                    .decoder()
                    .audio()
                    .map_err(|e| DecodeError::Unsupported(e.to_string()))?;
                let target = self.audio_target.unwrap_or(AudioFormat {
                    sample_rate: decoder.rate(),
                    channels: decoder.channels(),
                });
                debug!(
                    "音频解码器: {} Hz, {} 声道 → 目标: {} Hz, {} 声道",
                    decoder.rate(),
                    decoder.channels(),
                    target.sample_rate,
                    target.channels
                );
                Ok(Box::new(FfmpegAudioDecoder {
                    decoder,
                    resampler: None,
                    time_base: self.desc.time_base,
                    origin_ms: self.origin_ms,
                    target,
                }))
            }
        }
    }
}

fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&packet.data);
    out.set_pts(packet.pts);
    out.set_dts(packet.dts);
    out.set_duration(packet.duration);
    if packet.keyframe {
        out.set_flags(ffmpeg::packet::Flags::KEY);
    }
    out
}

fn send_error(e: ffmpeg::Error) -> DecodeError {
    match e {
        ffmpeg::Error::InvalidData => DecodeError::Corrupt(e.to_string()),
        other => DecodeError::State(other.to_string()),
    }
}

/// 软件视频解码器（输出 RGBA）
pub struct FfmpegVideoDecoder {
    decoder: codec::decoder::Video,
    scaler: Option<(software::scaling::Context, util::format::Pixel, u32, u32)>,
    time_base: Rational,
    origin_ms: i64,
    frame_ms: i64,
}

// SwsContext 本身不是 Send，但每个解码器实例只会在一个线程中使用
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    fn receive_all(&mut self, frames: &mut Vec<Frame>) -> Result<(), DecodeError> {
        loop {
            let mut decoded = util::frame::Video::empty();
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => frames.push(Frame::Video(self.convert_frame(&decoded)?)),
                Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(ffmpeg::Error::InvalidData) => {
                    warn!("解码错误（已跳过）");
                    return Ok(());
                }
                Err(e) => return Err(DecodeError::State(e.to_string())),
            }
        }
    }

    /// 转换帧格式为 RGBA
    fn convert_frame(&mut self, frame: &util::frame::Video) -> Result<VideoFrame, DecodeError> {
        let width = frame.width();
        let height = frame.height();
        let format = frame.format();

        let stale = !matches!(&self.scaler, Some((_, f, w, h)) if *f == format && *w == width && *h == height);
        if stale {
            let scaler = software::scaling::Context::get(
                format,
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| DecodeError::State(e.to_string()))?;
            self.scaler = Some((scaler, format, width, height));
        }

        let mut rgba_frame = util::frame::Video::empty();
        if let Some((scaler, ..)) = self.scaler.as_mut() {
            scaler
                .run(frame, &mut rgba_frame)
                .map_err(|e| DecodeError::State(e.to_string()))?;
        }

        let pts = frame
            .timestamp()
            .map(|ts| self.time_base.to_millis(ts) - self.origin_ms)
            .unwrap_or(0);

        // 复制数据到连续内存
        let row_size = width as usize * 4;
        let mut data = vec![0u8; row_size * height as usize];
        let stride = rgba_frame.stride(0);
        let frame_data = rgba_frame.data(0);
        for y in 0..height as usize {
            let src = y * stride;
            data[y * row_size..(y + 1) * row_size]
                .copy_from_slice(&frame_data[src..src + row_size]);
        }

        Ok(VideoFrame {
            pts,
            duration: self.frame_ms,
            width,
            height,
            format: PixelFormat::RGBA,
            data,
        })
    }
}

impl Decoder for FfmpegVideoDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        match self.decoder.send_packet(&to_ffmpeg_packet(packet)) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                debug!("视频解码器收到 EOF（send_packet），执行 flush 并忽略本次包");
                self.decoder.flush();
                return Ok(frames);
            }
            Err(e) => return Err(send_error(e)),
        }
        self.receive_all(&mut frames)?;
        Ok(frames)
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn drain(&mut self) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        self.decoder
            .send_eof()
            .map_err(|e| DecodeError::State(e.to_string()))?;
        self.receive_all(&mut frames)?;
        self.decoder.flush();
        Ok(frames)
    }

    fn description(&self) -> String {
        format!(
            "FFmpeg 视频解码器 {}x{} {:?}",
            self.decoder.width(),
            self.decoder.height(),
            self.decoder.format()
        )
    }
}

/// 音频解码器（重采样为交错 f32）
pub struct FfmpegAudioDecoder {
    decoder: codec::decoder::Audio,
    resampler: Option<software::resampling::Context>,
    time_base: Rational,
    origin_ms: i64,
    target: AudioFormat,
}

unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    fn receive_all(&mut self, frames: &mut Vec<Frame>) -> Result<(), DecodeError> {
        loop {
            let mut decoded = util::frame::Audio::empty();
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => frames.push(Frame::Audio(self.convert_frame(&decoded)?)),
                Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(ffmpeg::Error::InvalidData) => return Ok(()),
                Err(e) => return Err(DecodeError::State(e.to_string())),
            }
        }
    }

    fn convert_frame(&mut self, frame: &util::frame::Audio) -> Result<AudioFrame, DecodeError> {
        if self.resampler.is_none() {
            let target_layout = match self.target.channels {
                1 => util::channel_layout::ChannelLayout::MONO,
                6 => util::channel_layout::ChannelLayout::_5POINT1,
                _ => util::channel_layout::ChannelLayout::STEREO,
            };
            debug!(
                "🔧 初始化音频重采样器: {}Hz/{}ch → {}Hz/{}ch",
                frame.rate(),
                frame.channels(),
                self.target.sample_rate,
                self.target.channels
            );
            self.resampler = Some(
                software::resampling::Context::get(
                    frame.format(),
                    frame.channel_layout(),
                    frame.rate(),
                    util::format::Sample::F32(util::format::sample::Type::Packed),
                    target_layout,
                    self.target.sample_rate,
                )
                .map_err(|e| DecodeError::State(e.to_string()))?,
            );
        }

        let mut resampled = util::frame::Audio::empty();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler
                .run(frame, &mut resampled)
                .map_err(|e| DecodeError::State(e.to_string()))?;
        }

        let pts = frame
            .timestamp()
            .map(|ts| self.time_base.to_millis(ts) - self.origin_ms)
            .unwrap_or(0);

        let channels = self.target.channels.max(1) as usize;
        let sample_count = resampled.samples() * channels;
        let bytes = resampled.data(0);
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .take(sample_count)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let frames = data.len() / channels;

        Ok(AudioFrame {
            pts,
            duration: frames as i64 * 1000 / self.target.sample_rate.max(1) as i64,
            sample_rate: self.target.sample_rate,
            channels: self.target.channels,
            data,
        })
    }
}

impl Decoder for FfmpegAudioDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        match self.decoder.send_packet(&to_ffmpeg_packet(packet)) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                debug!("音频解码器收到 EOF（send_packet），执行 flush 并忽略本次包");
                self.decoder.flush();
                return Ok(frames);
            }
            Err(e) => return Err(send_error(e)),
        }
        self.receive_all(&mut frames)?;
        Ok(frames)
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn drain(&mut self) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        self.decoder
            .send_eof()
            .map_err(|e| DecodeError::State(e.to_string()))?;
        self.receive_all(&mut frames)?;
        self.decoder.flush();
        Ok(frames)
    }

    fn description(&self) -> String {
        format!(
            "FFmpeg 音频解码器 {}Hz/{}ch → {}Hz/{}ch",
            self.decoder.rate(),
            self.decoder.channels(),
            self.target.sample_rate,
            self.target.channels
        )
    }
}
