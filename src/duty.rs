//! Sensor duty counters.
//!
//! The node wakes far more often than it takes readings. These counters,
//! persisted between wake cycles, decide on which wake a reading is due and
//! when a reporting period is complete.

use std::fmt;

/// Serialized size: four little-endian `u32` counters.
pub const DUTY_CONFIG_LEN: usize = 16;

/// Persisted reading schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDutyConfig {
    /// Readings that make up one reporting period.
    pub readings_per_period: u32,
    /// Readings taken so far in the current period.
    pub readings_done_this_period: u32,
    /// Wakes between two readings.
    pub wakeups_before_reading: u32,
    /// Wakes counted since the last reading.
    pub wakeups_since_last_reading: u32,
}

/// What one wake cycle did to the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DutyStep {
    /// A reading is due on this wake.
    pub reading_due: bool,
}

impl SensorDutyConfig {
    /// Fresh schedule at the start of a period.
    pub fn new(readings_per_period: u32, wakeups_before_reading: u32) -> Self {
        Self {
            readings_per_period,
            readings_done_this_period: 0,
            wakeups_before_reading,
            wakeups_since_last_reading: 0,
        }
    }

    /// Count one wake and report whether a reading is due.
    pub fn register_wake(&mut self) -> DutyStep {
        self.wakeups_since_last_reading = self.wakeups_since_last_reading.saturating_add(1);
        if self.wakeups_since_last_reading >= self.wakeups_before_reading {
            self.wakeups_since_last_reading = 0;
            DutyStep { reading_due: true }
        } else {
            DutyStep { reading_due: false }
        }
    }

    /// Record that a reading was taken.
    pub fn record_reading(&mut self) {
        self.readings_done_this_period = self.readings_done_this_period.saturating_add(1);
    }

    /// True once the period holds all of its readings.
    pub fn period_complete(&self) -> bool {
        self.readings_done_this_period >= self.readings_per_period
    }

    /// Start the next period. Returns true if a rollover happened.
    pub fn roll_over_if_complete(&mut self) -> bool {
        if self.period_complete() {
            self.readings_done_this_period = 0;
            true
        } else {
            false
        }
    }

    /// Serialize for the persistent store.
    pub fn to_bytes(&self) -> [u8; DUTY_CONFIG_LEN] {
        let mut bytes = [0u8; DUTY_CONFIG_LEN];
        let fields = [
            self.readings_per_period,
            self.readings_done_this_period,
            self.wakeups_before_reading,
            self.wakeups_since_last_reading,
        ];
        for (chunk, value) in bytes.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Deserialize from the persistent store.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DutyConfigError> {
        if bytes.len() != DUTY_CONFIG_LEN {
            return Err(DutyConfigError::InvalidLength(bytes.len()));
        }
        let mut fields = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        let mut next = || fields.next().unwrap_or_default();
        let config = Self {
            readings_per_period: next(),
            readings_done_this_period: next(),
            wakeups_before_reading: next(),
            wakeups_since_last_reading: next(),
        };
        if config.readings_per_period == 0 {
            return Err(DutyConfigError::ZeroPeriod);
        }
        Ok(config)
    }
}

/// Errors decoding a persisted duty config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DutyConfigError {
    InvalidLength(usize),
    ZeroPeriod,
}

impl fmt::Display for DutyConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength(len) => write!(
                f,
                "duty config is {} bytes (expected {})",
                len, DUTY_CONFIG_LEN
            ),
            Self::ZeroPeriod => write!(f, "duty config has zero readings per period"),
        }
    }
}

impl std::error::Error for DutyConfigError {}
