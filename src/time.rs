//! Time representation for the playback pipeline.
//!
//! Media time is carried as milliseconds (`i64`) everywhere above the codec
//! boundary. Stream timestamps stay in their stream's time base until a
//! decode worker converts them with [`pts_to_ms`].

/// Milliseconds of media time.
pub type Millis = i64;

/// "No presentation timestamp" marker. Same value the codec library uses.
pub const NOPTS: i64 = i64::MIN;

/// Time constants for conversions
pub mod constants {
    use super::Millis;

    pub const MILLIS_PER_SECOND: Millis = 1_000;
    pub const MILLIS_PER_MINUTE: Millis = 60 * MILLIS_PER_SECOND;
    pub const MILLIS_PER_HOUR: Millis = 60 * MILLIS_PER_MINUTE;
}

/// Rational unit of a stream's timestamps: `pts * num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MILLIS: TimeBase = TimeBase::new(1, 1_000);
    pub const MICROS: TimeBase = TimeBase::new(1, 1_000_000);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Time base whose unit is one sample at `rate` Hz.
    pub const fn sample_rate(rate: u32) -> Self {
        Self::new(1, rate as i32)
    }
}

/// Convert a stream timestamp to milliseconds.
///
/// `NOPTS` maps to `NOPTS`; a zero denominator maps to 0.
pub fn pts_to_ms(pts: i64, time_base: TimeBase) -> Millis {
    if pts == NOPTS {
        return NOPTS;
    }
    if time_base.den == 0 {
        return 0;
    }
    // i128 keeps 90 kHz timestamps of multi-hour files from overflowing
    let ms = (pts as i128 * time_base.num as i128 * 1_000) / time_base.den as i128;
    ms as Millis
}

/// Convert milliseconds to a stream timestamp (reverse of [`pts_to_ms`]).
pub fn ms_to_pts(ms: Millis, time_base: TimeBase) -> i64 {
    if time_base.num == 0 {
        return 0;
    }
    let pts = (ms as i128 * time_base.den as i128) / (time_base.num as i128 * 1_000);
    pts as i64
}

/// Duration of `samples` sample frames at `rate` Hz.
#[inline]
pub fn samples_to_ms(samples: i64, rate: u32) -> Millis {
    if rate == 0 {
        return 0;
    }
    samples * 1_000 / rate as i64
}

/// Number of sample frames covering `ms` at `rate` Hz.
#[inline]
pub fn ms_to_samples(ms: Millis, rate: u32) -> i64 {
    ms * rate as i64 / 1_000
}

/// Format time as HH:MM:SS.mmm
pub fn format_time(ms: Millis) -> String {
    if ms == NOPTS {
        return "--:--:--.---".to_string();
    }
    let sign = if ms < 0 { "-" } else { "" };
    let ms = ms.abs();
    let hours = ms / constants::MILLIS_PER_HOUR;
    let minutes = (ms % constants::MILLIS_PER_HOUR) / constants::MILLIS_PER_MINUTE;
    let seconds = (ms % constants::MILLIS_PER_MINUTE) / constants::MILLIS_PER_SECOND;
    let millis = ms % constants::MILLIS_PER_SECOND;

    format!("{}{:02}:{:02}:{:02}.{:03}", sign, hours, minutes, seconds, millis)
}
