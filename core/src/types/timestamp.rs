// Second + nanosecond timestamp with byte-ordered encoding

use crate::{PttError, Result};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SIZE_TIMESTAMP: usize = 12;

/// Ordered by seconds, then nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "T")]
    pub ts: i64,
    #[serde(rename = "NT")]
    pub nano: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { ts: 0, nano: 0 };
    pub const MAX: Timestamp = Timestamp {
        ts: i64::MAX,
        nano: 999_999_999,
    };

    pub fn new(ts: i64, nano: u32) -> Self {
        Self { ts, nano }
    }

    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            ts: now.as_secs() as i64,
            nano: now.subsec_nanos(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.ts == 0 && self.nano == 0
    }

    pub fn add_secs(&self, secs: i64) -> Self {
        Self {
            ts: self.ts.saturating_add(secs),
            nano: self.nano,
        }
    }

    /// 12 bytes: seconds then nanoseconds, big endian.
    pub fn marshal(&self) -> [u8; SIZE_TIMESTAMP] {
        let mut buf = [0u8; SIZE_TIMESTAMP];
        buf[..8].copy_from_slice(&self.ts.to_be_bytes());
        buf[8..].copy_from_slice(&self.nano.to_be_bytes());
        buf
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SIZE_TIMESTAMP {
            return Err(PttError::InvalidData);
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[..8]);
        let mut nano = [0u8; 4];
        nano.copy_from_slice(&bytes[8..SIZE_TIMESTAMP]);
        Ok(Self {
            ts: i64::from_be_bytes(ts),
            nano: u32::from_be_bytes(nano),
        })
    }

    /// (start of the hour, start of the next hour)
    pub fn to_hr_timestamp(&self) -> (Timestamp, Timestamp) {
        let start = self.ts - self.ts.rem_euclid(3600);
        (Timestamp::new(start, 0), Timestamp::new(start + 3600, 0))
    }

    pub fn to_day_timestamp(&self) -> (Timestamp, Timestamp) {
        let start = self.ts - self.ts.rem_euclid(86400);
        (Timestamp::new(start, 0), Timestamp::new(start + 86400, 0))
    }

    pub fn to_month_timestamp(&self) -> (Timestamp, Timestamp) {
        let Some(t) = Utc.timestamp_opt(self.ts, 0).single() else {
            return (*self, *self);
        };
        let (next_year, next_month) = if t.month() == 12 {
            (t.year() + 1, 1)
        } else {
            (t.year(), t.month() + 1)
        };
        (
            ymd_timestamp(t.year(), t.month()),
            ymd_timestamp(next_year, next_month),
        )
    }

    pub fn to_year_timestamp(&self) -> (Timestamp, Timestamp) {
        let Some(t) = Utc.timestamp_opt(self.ts, 0).single() else {
            return (*self, *self);
        };
        (ymd_timestamp(t.year(), 1), ymd_timestamp(t.year() + 1, 1))
    }

    pub fn to_rfc3339(&self) -> String {
        Utc.timestamp_opt(self.ts, self.nano)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default()
    }

    pub fn hour(&self) -> u32 {
        Utc.timestamp_opt(self.ts, 0)
            .single()
            .map(|t| t.hour())
            .unwrap_or_default()
    }
}

fn ymd_timestamp(year: i32, month: u32) -> Timestamp {
    let ts = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp())
        .unwrap_or_default();
    Timestamp::new(ts, 0)
}
