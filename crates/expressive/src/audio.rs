//! Audio utilities.
//!
//! - container/codec decoding (symphonia), channels preserved
//! - band-limited resampling (rubato)
//! - literal head truncation
//! - 32-bit float WAV encoding (hound)
//! - in-place preprocessing of uploaded clips

use std::io::Cursor;
use std::path::{Path, PathBuf};

use audioadapter_buffers::direct::InterleavedSlice;
use ndarray::{Array2, s};
use rubato::{Fft, FixedSync, Resampler};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{CODEC_TYPE_NULL, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::{MediaSource, MediaSourceStream},
    meta::MetadataOptions,
    probe::Hint,
};
use thiserror::Error;

use crate::constants::{AUDIO_SAMPLE_RATE_HZ, MAX_INPUT_AUDIO_SAMPLES, MAX_INPUT_AUDIO_SECS};

/// A decoded clip: `samples` is `[channels, frames]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub sample_rate_hz: u32,
    pub samples: Array2<f32>,
}

impl Waveform {
    #[must_use]
    pub fn new(sample_rate_hz: u32, samples: Array2<f32>) -> Self {
        Self {
            sample_rate_hz,
            samples,
        }
    }

    /// Build a waveform from interleaved samples.
    pub fn from_interleaved(
        sample_rate_hz: u32,
        channels: usize,
        interleaved: &[f32],
    ) -> Result<Self, AudioError> {
        if channels == 0 {
            return Err(AudioError::NoChannels);
        }
        let frames = interleaved.len() / channels;
        let samples = Array2::from_shape_fn((channels, frames), |(c, f)| interleaved[f * channels + c]);
        Ok(Self::new(sample_rate_hz, samples))
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.samples.nrows()
    }

    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.ncols()
    }

    #[must_use]
    pub fn duration_secs(&self) -> f32 {
        self.frames() as f32 / self.sample_rate_hz as f32
    }

    #[must_use]
    pub fn interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.channels() * self.frames());
        for frame in self.samples.columns() {
            out.extend(frame.iter().copied());
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unsupported or unreadable audio container: {0}")]
    Probe(#[source] SymphoniaError),
    #[error("no supported audio tracks found")]
    NoTrack,
    #[error("failed to create decoder for selected track: {0}")]
    Codec(#[source] SymphoniaError),
    #[error("unrecoverable decode error: {0}")]
    Decode(#[source] SymphoniaError),
    #[error("decoder reset required mid-stream")]
    ResetRequired,
    #[error("could not determine input sample rate")]
    UnknownSampleRate,
    #[error("audio has no channels")]
    NoChannels,
    #[error("decoded audio was empty")]
    Empty,
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),
}

/// Decode an audio file into a [`Waveform`] at its native rate.
pub fn decode_file(path: impl AsRef<Path>) -> Result<Waveform, AudioError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|source| AudioError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let extension = path.extension().and_then(|e| e.to_str());
    decode_source(Box::new(file), extension)
}

/// Decode in-memory audio bytes into a [`Waveform`] at their native rate.
pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> Result<Waveform, AudioError> {
    if bytes.is_empty() {
        return Err(AudioError::Empty);
    }
    decode_source(Box::new(Cursor::new(bytes)), extension)
}

fn decode_source(
    source: Box<dyn MediaSource>,
    extension: Option<&str>,
) -> Result<Waveform, AudioError> {
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(AudioError::Probe)?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoTrack)?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut channels = track.codec_params.channels.map(|c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(AudioError::Codec)?;

    let mut interleaved: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(_)) => break, // end of stream
            Err(SymphoniaError::ResetRequired) => return Err(AudioError::ResetRequired),
            Err(e) => return Err(AudioError::Decode(e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::IoError(_) | SymphoniaError::DecodeError(_)) => continue,
            Err(SymphoniaError::ResetRequired) => return Err(AudioError::ResetRequired),
            Err(e) => return Err(AudioError::Decode(e)),
        };

        sample_rate.get_or_insert(decoded.spec().rate);
        channels.get_or_insert(decoded.spec().channels.count());

        let mut sbuf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        sbuf.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(sbuf.samples());
    }

    let sample_rate = sample_rate.ok_or(AudioError::UnknownSampleRate)?;
    let channels = channels.ok_or(AudioError::NoChannels)?;
    if interleaved.is_empty() {
        return Err(AudioError::Empty);
    }

    Waveform::from_interleaved(sample_rate, channels, &interleaved)
}

/// Resample every channel of `wave` to `dst_hz`.
pub fn resample(wave: &Waveform, dst_hz: u32) -> Result<Waveform, AudioError> {
    if wave.sample_rate_hz == dst_hz || wave.frames() == 0 {
        return Ok(Waveform::new(dst_hz, wave.samples.clone()));
    }

    let channels = wave.channels();
    let frames_in = wave.frames();
    let input = wave.interleaved();

    let mut resampler = Fft::<f32>::new(
        wave.sample_rate_hz as usize,
        dst_hz as usize,
        1024,
        1,
        channels,
        FixedSync::Input,
    )
    .map_err(|e| AudioError::Resample(e.to_string()))?;

    let frames_out = resampler.process_all_needed_output_len(frames_in);
    let mut out = vec![0.0f32; frames_out * channels];

    let written = {
        let input_adapter = InterleavedSlice::new(&input, channels, frames_in)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        let mut output_adapter = InterleavedSlice::new_mut(&mut out, channels, frames_out)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        let (_read, written) = resampler
            .process_all_into_buffer(&input_adapter, &mut output_adapter, frames_in, None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        written
    };

    out.truncate(written * channels);
    Waveform::from_interleaved(dst_hz, channels, &out)
}

/// Keep the first `max_frames` frames. Returns `true` when anything was cut.
pub fn truncate(wave: &mut Waveform, max_frames: usize) -> bool {
    if wave.frames() <= max_frames {
        return false;
    }
    wave.samples = wave.samples.slice(s![.., ..max_frames]).to_owned();
    true
}

fn wav_spec(wave: &Waveform) -> Result<hound::WavSpec, AudioError> {
    let channels = u16::try_from(wave.channels()).map_err(|_| AudioError::NoChannels)?;
    if channels == 0 {
        return Err(AudioError::NoChannels);
    }
    Ok(hound::WavSpec {
        channels,
        sample_rate: wave.sample_rate_hz,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    })
}

/// Write `wave` as a 32-bit float WAV file, replacing any existing file.
pub fn write_wav(path: impl AsRef<Path>, wave: &Waveform) -> Result<(), AudioError> {
    let mut writer = hound::WavWriter::create(path, wav_spec(wave)?)?;
    for frame in wave.samples.columns() {
        for &s in frame {
            writer.write_sample(s)?;
        }
    }
    writer.finalize()?;
    Ok(())
}

/// Encode `wave` as 32-bit float WAV bytes.
pub fn encode_wav(wave: &Waveform) -> Result<Vec<u8>, AudioError> {
    let mut buf = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), wav_spec(wave)?)?;
        for frame in wave.samples.columns() {
            for &s in frame {
                writer.write_sample(s)?;
            }
        }
        writer.finalize()?;
    }
    Ok(buf)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessReport {
    pub source_sample_rate_hz: u32,
    pub frames: usize,
    pub truncated: bool,
    pub warnings: Vec<String>,
}

#[must_use]
pub fn too_long_warning() -> String {
    format!("Input audio is too long. Only the first {MAX_INPUT_AUDIO_SECS} seconds is used.")
}

/// Normalize an uploaded clip in place: resample to 44.1 kHz and keep at most
/// the first 60 seconds. The file is overwritten with WAV content.
pub fn preprocess_audio(path: impl AsRef<Path>) -> Result<PreprocessReport, AudioError> {
    let path = path.as_ref();
    let original = decode_file(path)?;
    let source_sample_rate_hz = original.sample_rate_hz;

    let mut wave = resample(&original, AUDIO_SAMPLE_RATE_HZ)?;
    let mut warnings = Vec::new();
    let truncated = truncate(&mut wave, MAX_INPUT_AUDIO_SAMPLES);
    if truncated {
        let warning = too_long_warning();
        tracing::warn!(path = %path.display(), "{warning}");
        warnings.push(warning);
    }

    write_wav(path, &wave)?;
    tracing::debug!(
        path = %path.display(),
        source_sample_rate_hz,
        frames = wave.frames(),
        channels = wave.channels(),
        "preprocessed input audio"
    );

    Ok(PreprocessReport {
        source_sample_rate_hz,
        frames: wave.frames(),
        truncated,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(sample_rate_hz: u32, channels: usize, secs: f32) -> Waveform {
        let frames = (sample_rate_hz as f32 * secs) as usize;
        let samples = Array2::from_shape_fn((channels, frames), |(c, f)| {
            let t = f as f32 / sample_rate_hz as f32;
            0.25 * (2.0 * std::f32::consts::PI * (220.0 * (c + 1) as f32) * t).sin()
        });
        Waveform::new(sample_rate_hz, samples)
    }

    #[test]
    fn interleave_roundtrip_keeps_channel_order() {
        let w = Waveform::from_interleaved(8_000, 2, &[1.0, -1.0, 2.0, -2.0, 3.0, -3.0])
            .expect("waveform");
        assert_eq!(w.channels(), 2);
        assert_eq!(w.frames(), 3);
        assert_eq!(w.samples.row(0).to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(w.interleaved(), vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
    }

    #[test]
    fn truncate_keeps_literal_head() {
        let mut w = Waveform::from_interleaved(4, 1, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
            .expect("waveform");
        assert!(truncate(&mut w, 4));
        assert_eq!(w.samples.row(0).to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
        assert!(!truncate(&mut w, 4));
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let w = sine(AUDIO_SAMPLE_RATE_HZ, 1, 0.1);
        let r = resample(&w, AUDIO_SAMPLE_RATE_HZ).expect("resample");
        assert_eq!(r, w);
    }

    #[test]
    fn resample_scales_length_and_keeps_channels() {
        let w = sine(22_050, 2, 0.5);
        let r = resample(&w, AUDIO_SAMPLE_RATE_HZ).expect("resample");
        assert_eq!(r.sample_rate_hz, AUDIO_SAMPLE_RATE_HZ);
        assert_eq!(r.channels(), 2);
        let expected = w.frames() * 2;
        assert!(r.frames().abs_diff(expected) <= 2, "got {} frames", r.frames());
    }

    #[test]
    fn wav_bytes_decode_back() {
        let w = sine(16_000, 2, 0.05);
        let bytes = encode_wav(&w).expect("encode");
        let d = decode_bytes(bytes, None).expect("decode");
        assert_eq!(d.sample_rate_hz, 16_000);
        assert_eq!(d.channels(), 2);
        assert_eq!(d.frames(), w.frames());
        assert!((d.samples[[1, 10]] - w.samples[[1, 10]]).abs() < 1e-6);
    }

    #[test]
    fn empty_bytes_are_a_decode_error() {
        assert!(matches!(decode_bytes(Vec::new(), None), Err(AudioError::Empty)));
        assert!(decode_bytes(b"definitely not audio".to_vec(), None).is_err());
    }

    #[test]
    fn preprocess_keeps_short_clip_duration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.wav");
        write_wav(&path, &sine(AUDIO_SAMPLE_RATE_HZ, 1, 2.0)).expect("write");

        let report = preprocess_audio(&path).expect("preprocess");
        assert!(!report.truncated);
        assert!(report.warnings.is_empty());

        let after = decode_file(&path).expect("decode");
        assert_eq!(after.sample_rate_hz, AUDIO_SAMPLE_RATE_HZ);
        assert_eq!(after.frames(), 2 * AUDIO_SAMPLE_RATE_HZ as usize);
    }

    #[test]
    fn preprocess_resamples_to_target_rate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lowrate.wav");
        write_wav(&path, &sine(22_050, 1, 1.0)).expect("write");

        let report = preprocess_audio(&path).expect("preprocess");
        assert_eq!(report.source_sample_rate_hz, 22_050);

        let after = decode_file(&path).expect("decode");
        assert_eq!(after.sample_rate_hz, AUDIO_SAMPLE_RATE_HZ);
        assert!(after.frames().abs_diff(AUDIO_SAMPLE_RATE_HZ as usize) <= 2);
    }

    #[test]
    fn preprocess_truncates_long_clip_with_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("long.wav");
        write_wav(&path, &sine(AUDIO_SAMPLE_RATE_HZ, 1, 61.0)).expect("write");

        let report = preprocess_audio(&path).expect("preprocess");
        assert!(report.truncated);
        assert_eq!(report.warnings, vec![too_long_warning()]);
        assert_eq!(report.frames, MAX_INPUT_AUDIO_SAMPLES);

        let after = decode_file(&path).expect("decode");
        assert_eq!(after.frames(), 60 * 44_100);
    }

    #[test]
    fn preprocess_fails_on_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.wav");
        std::fs::write(&path, b"").expect("write");
        assert!(preprocess_audio(&path).is_err());
    }
}
