use std::{
    fmt,
    time::Duration,
};

use number_prefix::NumberPrefix;

/// Byte count rendered with base 2 prefixes, eg. `1.50KiB`.
#[derive(Clone, Copy, Debug)]
pub struct BinarySize(pub u64);

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NumberPrefix::binary(self.0 as f64) {
            NumberPrefix::Standalone(n) => write!(f, "{n:.0}B"),
            NumberPrefix::Prefixed(prefix, n) => write!(f, "{n:.2}{prefix}B"),
        }
    }
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Duration rendered as its two most significant units, eg. `3m 12s`.
/// Subsecond precision is dropped.
#[derive(Clone, Copy, Debug)]
pub struct HumanDuration(pub Duration);

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();

        let units = [
            (secs / DAY, 'd'),
            (secs % DAY / HOUR, 'h'),
            (secs % HOUR / MINUTE, 'm'),
            (secs % MINUTE, 's'),
        ];

        let Some(first) = units.iter().position(|(v, _)| *v > 0) else {
            return f.write_str("0s");
        };

        let (value, suffix) = units[first];
        write!(f, "{value}{suffix}")?;

        if let Some((value, suffix)) = units.get(first + 1) {
            if *value > 0 {
                write!(f, " {value}{suffix}")?;
            }
        }

        Ok(())
    }
}

/// Duration rendered as a clock, eg. `01:02:03`. Subsecond precision is
/// dropped.
#[derive(Clone, Copy, Debug)]
pub struct ClockDuration(pub Duration);

impl fmt::Display for ClockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();

        write!(
            f,
            "{:02}:{:02}:{:02}",
            secs / HOUR,
            secs % HOUR / MINUTE,
            secs % MINUTE,
        )
    }
}
