// 播放器核心模块：解封装 → 解码 → 呈现 流水线与控制器

pub mod audio_output;
pub mod decoder;
pub mod decoder_thread;
pub mod demuxer_source;
pub mod demuxer_thread;
pub mod events;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod manager;
pub mod null_output;
pub mod output;
pub mod playlist;
pub mod presenter;
pub mod session;
pub mod synthetic;
pub mod video_output;

pub use audio_output::AudioSink;
#[cfg(feature = "audio-device")]
pub use audio_output::{CpalAudioSink, CpalOutput};
pub use decoder::{Decoder, DecoderFactory, DecoderOptions};
pub use demuxer_source::{DemuxerSource, MediaBackend};
pub use demuxer_thread::DemuxerThread;
pub use events::PlayerEvent;
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegBackend;
pub use manager::{PlaybackManager, StepDirection};
pub use null_output::{NullOutput, SinkRecorder};
pub use output::OutputBackend;
pub use playlist::{Playlist, PlaylistEntry};
pub use synthetic::{SyntheticBackend, SyntheticMedia};
pub use video_output::{SharedFrameSlot, VideoSink};
