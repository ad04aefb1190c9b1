//! Fixed-point wall-clock timestamp used on the wire and for playout scheduling.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const USEC_PER_SEC: i64 = 1_000_000;

/// Seconds + microseconds, always normalized so `0 <= usec < 1_000_000`.
///
/// Negative values are represented with a negative `sec` and a positive
/// `usec` (e.g. -1.5ms is `{ sec: -1, usec: 998_500 }`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    sec: i32,
    usec: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, usec: 0 };

    /// Size of the wire representation (`int32 sec, int32 usec`).
    pub const WIRE_SIZE: usize = 8;

    /// Build a timestamp, normalizing any out-of-range microseconds.
    pub fn new(sec: i32, usec: i32) -> Self {
        Self::from_micros(sec as i64 * USEC_PER_SEC + usec as i64)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_micros(since_epoch.as_micros() as i64)
    }

    pub fn from_micros(micros: i64) -> Self {
        Self {
            sec: micros.div_euclid(USEC_PER_SEC) as i32,
            usec: micros.rem_euclid(USEC_PER_SEC) as i32,
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::from_micros(millis * 1000)
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self::from_micros(duration.as_micros() as i64)
    }

    pub fn sec(&self) -> i32 {
        self.sec
    }

    pub fn usec(&self) -> i32 {
        self.usec
    }

    pub fn to_micros(&self) -> i64 {
        self.sec as i64 * USEC_PER_SEC + self.usec as i64
    }

    /// Milliseconds, truncated toward zero.
    pub fn to_millis(&self) -> i64 {
        self.to_micros() / 1000
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// Positive part as a `Duration`; negative values clamp to zero.
    pub fn to_duration(&self) -> Duration {
        Duration::from_micros(self.to_micros().max(0) as u64)
    }

    /// Decode from the 8-byte little-endian wire form.
    ///
    /// The pair is normalized, so a sender's non-canonical `usec` (outside
    /// `0..1_000_000`) re-encodes as the equivalent canonical bytes, not the
    /// bytes received.
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        let (sec, usec) = bytes.split_at(4);
        let sec = i32::from_le_bytes([sec[0], sec[1], sec[2], sec[3]]);
        let usec = i32::from_le_bytes([usec[0], usec[1], usec[2], usec[3]]);
        Self::new(sec, usec)
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.sec.to_le_bytes());
        out[4..].copy_from_slice(&self.usec.to_le_bytes());
        out
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sec.cmp(&other.sec).then(self.usec.cmp(&other.usec))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timestamp) -> Timestamp {
        Timestamp::from_micros(self.to_micros() + rhs.to_micros())
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Timestamp) -> Timestamp {
        Timestamp::from_micros(self.to_micros() - rhs.to_micros())
    }
}

impl Mul<f32> for Timestamp {
    type Output = Timestamp;

    fn mul(self, factor: f32) -> Timestamp {
        Timestamp::from_micros((self.to_micros() as f64 * factor as f64).round() as i64)
    }
}

impl Div<i32> for Timestamp {
    type Output = Timestamp;

    fn div(self, divisor: i32) -> Timestamp {
        Timestamp::from_micros(self.to_micros() / divisor as i64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let micros = self.to_micros();
        let sign = if micros < 0 { "-" } else { "" };
        let abs = micros.unsigned_abs();
        write!(f, "{}{}.{:06}s", sign, abs / 1_000_000, abs % 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let t = Timestamp::new(1, 1_500_000);
        assert_eq!((t.sec(), t.usec()), (2, 500_000));

        let t = Timestamp::new(0, -1_500);
        assert_eq!((t.sec(), t.usec()), (-1, 998_500));
        assert_eq!(t.to_micros(), -1_500);
        assert_eq!(t.to_millis(), -1);
    }

    #[test]
    fn test_signed_subtraction() {
        let a = Timestamp::new(10, 100);
        let b = Timestamp::new(10, 300);
        assert_eq!((a - b).to_micros(), -200);
        assert_eq!((b - a).to_micros(), 200);
        assert!(a < b);
        assert!(a - b < Timestamp::ZERO);
    }

    #[test]
    fn test_scaling_and_halving() {
        let t = Timestamp::from_millis(100);
        assert_eq!((t * 0.5).to_millis(), 50);
        assert_eq!((t / 2).to_micros(), 50_000);
        assert_eq!((Timestamp::from_micros(-3) / 2).to_micros(), -1);
    }

    #[test]
    fn test_wire_bytes() {
        let t = Timestamp::new(1_700_000_000, 123_456);
        assert_eq!(Timestamp::from_le_bytes(t.to_le_bytes()), t);
        assert_eq!(&t.to_le_bytes()[..4], &1_700_000_000i32.to_le_bytes());
    }

    #[test]
    fn test_non_canonical_wire_bytes_are_normalized() {
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&1i32.to_le_bytes());
        raw[4..].copy_from_slice(&1_500_000i32.to_le_bytes());

        let t = Timestamp::from_le_bytes(raw);
        assert_eq!((t.sec(), t.usec()), (2, 500_000));
        assert_ne!(t.to_le_bytes(), raw);
        assert_eq!(&t.to_le_bytes()[4..], &500_000i32.to_le_bytes());
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::from_micros(-1_500).to_string(), "-0.001500s");
        assert_eq!(Timestamp::new(3, 42).to_string(), "3.000042s");
    }
}
