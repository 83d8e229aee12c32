//! Human-readable byte volumes.

use std::fmt;

const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];

/// An amount of bytes, displayed as `1.5kB`, `10MB` and so on (base 1024).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Volume(pub u64);

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 1024 {
            return write!(f, "{}B", self.0);
        }

        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }

        let text = format!("{:.2}", value);
        let text = text.trim_end_matches('0').trim_end_matches('.');
        write!(f, "{}{}", text, UNITS[unit])
    }
}

impl From<u64> for Volume {
    fn from(v: u64) -> Self {
        Self(v)
    }
}
