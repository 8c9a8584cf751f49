//! Audio, feature and generation constants.

// Input normalization.
pub const AUDIO_SAMPLE_RATE_HZ: u32 = 44_100;
pub const MAX_INPUT_AUDIO_SECS: u32 = 60;
pub const MAX_INPUT_AUDIO_SAMPLES: usize = (MAX_INPUT_AUDIO_SECS * AUDIO_SAMPLE_RATE_HZ) as usize;

// Kaldi-style filter bank.
pub const NUM_MEL_BINS: usize = 80;
pub const WAVEFORM_SCALE: f32 = 32_768.0; // 2^15
pub const FRAME_LENGTH_MS: f32 = 25.0;
pub const FRAME_SHIFT_MS: f32 = 10.0;
pub const PREEMPHASIS_COEFF: f32 = 0.97;
pub const MEL_LOW_FREQ_HZ: f32 = 20.0;

// Batching.
pub const PAD_VALUE: f32 = 0.0;

// Generation settings handed to the translator.
pub const BEAM_SIZE: usize = 5;
pub const UNIT_SOFT_MAX_SEQ_LEN: (i64, i64) = (25, 50);
pub const DURATION_FACTOR: f32 = 1.0;

// Request admission in front of the handler.
pub const QUEUE_MAX_SIZE: usize = 50;
