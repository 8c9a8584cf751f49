//! Kaldi-compatible log-mel filter banks.
//!
//! Framing follows Kaldi's defaults with `snip_edges`:
//! - DC offset removal, pre-emphasis, Povey window
//! - FFT zero-padded to the next power of two
//! - power spectrum, triangular banks on the `1127 ln(1 + f/700)` mel scale
//! - natural log floored at `f32::EPSILON`

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{Fft, FftPlanner, num_complex::Complex};

use crate::audio::Waveform;
use crate::constants::{
    FRAME_LENGTH_MS, FRAME_SHIFT_MS, MEL_LOW_FREQ_HZ, NUM_MEL_BINS, PREEMPHASIS_COEFF,
    WAVEFORM_SCALE,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FbankConfig {
    pub num_mel_bins: usize,
    pub waveform_scale: f32,
    pub frame_length_ms: f32,
    pub frame_shift_ms: f32,
    pub preemphasis: f32,
    pub low_freq_hz: f32,
    /// `[frames, bins]` when set, `[bins, frames]` otherwise.
    pub channel_last: bool,
    /// Standardize per utterance inside the converter.
    pub standardize: bool,
}

impl Default for FbankConfig {
    fn default() -> Self {
        Self {
            num_mel_bins: NUM_MEL_BINS,
            waveform_scale: WAVEFORM_SCALE,
            frame_length_ms: FRAME_LENGTH_MS,
            frame_shift_ms: FRAME_SHIFT_MS,
            preemphasis: PREEMPHASIS_COEFF,
            low_freq_hz: MEL_LOW_FREQ_HZ,
            channel_last: true,
            standardize: false,
        }
    }
}

#[inline]
fn hertz_to_mel(freq: f32) -> f32 {
    1127.0 * (1.0 + freq / 700.0).ln()
}

fn build_povey_window(size: usize) -> Vec<f32> {
    let denom = (size.max(2) - 1) as f32;
    (0..size)
        .map(|i| {
            let angle = 2.0 * std::f32::consts::PI * (i as f32) / denom;
            (0.5 - 0.5 * angle.cos()).powf(0.85)
        })
        .collect()
}

/// Triangular banks over the first `padded / 2` FFT bins, row-major `[bins, padded / 2]`.
fn build_mel_banks(num_bins: usize, padded: usize, sample_rate_hz: u32, low_freq_hz: f32) -> Vec<f32> {
    let num_fft_bins = padded / 2;
    let nyquist = 0.5 * sample_rate_hz as f32;
    let fft_bin_width = sample_rate_hz as f32 / padded as f32;

    let mel_low = hertz_to_mel(low_freq_hz);
    let mel_high = hertz_to_mel(nyquist);
    let delta = (mel_high - mel_low) / (num_bins + 1) as f32;

    let mut banks = vec![0.0f32; num_bins * num_fft_bins];
    for b in 0..num_bins {
        let left = mel_low + b as f32 * delta;
        let center = left + delta;
        let right = center + delta;
        let row = &mut banks[b * num_fft_bins..(b + 1) * num_fft_bins];
        for (i, w) in row.iter_mut().enumerate() {
            let mel = hertz_to_mel(fft_bin_width * i as f32);
            if mel > left && mel < right {
                *w = if mel <= center {
                    (mel - left) / (center - left)
                } else {
                    (right - mel) / (right - center)
                };
            }
        }
    }
    banks
}

/// Filter-bank extractor for one sample rate. Tables are built once.
pub struct FbankComputer {
    cfg: FbankConfig,
    sample_rate_hz: u32,
    window_size: usize,
    window_shift: usize,
    padded: usize,
    window: Vec<f32>,
    banks: Vec<f32>, // [num_mel_bins * padded/2]
    fft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for FbankComputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FbankComputer")
            .field("cfg", &self.cfg)
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("window_size", &self.window_size)
            .field("window_shift", &self.window_shift)
            .field("padded", &self.padded)
            .finish_non_exhaustive()
    }
}

impl FbankComputer {
    #[must_use]
    pub fn new(cfg: FbankConfig, sample_rate_hz: u32) -> Self {
        let ms = 0.001 * sample_rate_hz as f32;
        let window_size = ((ms * cfg.frame_length_ms) as usize).max(1);
        let window_shift = ((ms * cfg.frame_shift_ms) as usize).max(1);
        let padded = window_size.next_power_of_two();

        let fft = FftPlanner::<f32>::new().plan_fft_forward(padded);

        Self {
            cfg,
            sample_rate_hz,
            window_size,
            window_shift,
            padded,
            window: build_povey_window(window_size),
            banks: build_mel_banks(cfg.num_mel_bins, padded, sample_rate_hz, cfg.low_freq_hz),
            fft,
        }
    }

    #[must_use]
    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    #[must_use]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    #[must_use]
    pub fn window_shift(&self) -> usize {
        self.window_shift
    }

    #[must_use]
    pub fn padded_size(&self) -> usize {
        self.padded
    }

    /// Number of frames produced for `n_samples` input samples.
    #[must_use]
    pub fn num_frames(&self, n_samples: usize) -> usize {
        if n_samples < self.window_size {
            0
        } else {
            1 + (n_samples - self.window_size) / self.window_shift
        }
    }

    /// Compute filter banks from the first channel of `wave`.
    ///
    /// The waveform must already be at [`Self::sample_rate_hz`].
    #[must_use]
    pub fn compute(&self, wave: &Waveform) -> Array2<f32> {
        debug_assert_eq!(wave.sample_rate_hz, self.sample_rate_hz);
        let bins = self.cfg.num_mel_bins;
        if wave.channels() == 0 {
            return self.layout(Array2::zeros((0, bins)));
        }

        let channel = wave.samples.row(0);
        let n_frames = self.num_frames(channel.len());
        let num_fft_bins = self.padded / 2;

        let mut out = Array2::<f32>::zeros((n_frames, bins));
        let mut frame = vec![0.0f32; self.window_size];
        let mut buf = vec![Complex::new(0.0f32, 0.0); self.padded];
        let mut power = vec![0.0f32; num_fft_bins];

        for t in 0..n_frames {
            let start = t * self.window_shift;
            for (i, v) in frame.iter_mut().enumerate() {
                *v = channel[start + i] * self.cfg.waveform_scale;
            }

            let mean = frame.iter().sum::<f32>() / self.window_size as f32;
            for v in &mut frame {
                *v -= mean;
            }

            if self.cfg.preemphasis != 0.0 {
                for i in (1..self.window_size).rev() {
                    frame[i] -= self.cfg.preemphasis * frame[i - 1];
                }
                frame[0] -= self.cfg.preemphasis * frame[0];
            }

            for (i, c) in buf.iter_mut().enumerate() {
                let re = if i < self.window_size {
                    frame[i] * self.window[i]
                } else {
                    0.0
                };
                *c = Complex::new(re, 0.0);
            }
            self.fft.process(&mut buf);

            for (p, c) in power.iter_mut().zip(buf.iter()) {
                *p = c.norm_sqr();
            }

            let mut row = out.row_mut(t);
            for (m, out_m) in row.iter_mut().enumerate() {
                let bank = &self.banks[m * num_fft_bins..(m + 1) * num_fft_bins];
                let energy: f32 = bank.iter().zip(power.iter()).map(|(w, p)| w * p).sum();
                *out_m = energy.max(f32::EPSILON).ln();
            }
        }

        if self.cfg.standardize {
            crate::features::standardize_in_place(&mut out);
        }
        self.layout(out)
    }

    fn layout(&self, frames_by_bins: Array2<f32>) -> Array2<f32> {
        if self.cfg.channel_last {
            frames_by_bins
        } else {
            frames_by_bins.reversed_axes().as_standard_layout().to_owned()
        }
    }
}
