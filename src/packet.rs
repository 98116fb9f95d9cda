//! Syclone wire frame decoding.
//!
//! Every frame the sensor emits is exactly [`FRAME_LEN`] bytes. Only a handful
//! of fields are of interest here:
//!
//! | Offset | Len | Field        | Encoding                     |
//! |--------|-----|--------------|------------------------------|
//! | 0      | 2   | magic        | `0x43 0x59` ("CY")           |
//! | 22     | 6   | timestamp    | BCD: yy, mm, dd, hh, mm, ss  |
//! | 38     | 4   | dose rate    | u32 LE, units of 0.1 nR/s    |

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

pub const FRAME_LEN: usize = 50;
pub const FRAME_MAGIC: [u8; 2] = [0x43, 0x59];

const TIMESTAMP_OFFSET: usize = 22;
const DOSE_OFFSET: usize = 38;

// Raw dose unit is 0.1 nR/s; 1 nR/s corresponds to 36 nSv/h.
const RAW_TO_NR_PER_S: f64 = 0.1;
const NR_PER_S_TO_NSV_PER_H: f64 = 36.0;

const YEAR_BASE: u16 = 2000;

const_assert!(TIMESTAMP_OFFSET + 6 <= DOSE_OFFSET);
const_assert!(DOSE_OFFSET + 4 <= FRAME_LEN);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("frame is {0} bytes, expected {expected}", expected = FRAME_LEN)]
    WrongLength(usize),
    #[error("bad frame magic {0:#04x} {1:#04x}")]
    BadMagic(u8, u8),
}

/// One raw frame as captured from the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    pub fn has_magic(&self) -> bool {
        self.0[..2] == FRAME_MAGIC
    }

    pub fn decode(&self) -> Result<Sample, PacketError> {
        decode(&self.0)
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Sensor clock reading, exactly as transmitted.
///
/// Fields are not calendar-checked: a month of 13 decodes as 13.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl SensorTimestamp {
    /// Calendar view of the timestamp, if the fields form a real date and time.
    pub fn to_datetime(&self) -> Option<chrono::NaiveDateTime> {
        chrono::NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        )?
        .and_hms_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
        )
    }
}

impl core::fmt::Display for SensorTimestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub dose_nsv_per_h: f64,
    pub timestamp: SensorTimestamp,
}

fn bcd_to_int(byte: u8) -> u8 {
    (byte >> 4) * 10 + (byte & 0x0F)
}

fn int_to_bcd(value: u8) -> u8 {
    let value = value % 100;
    ((value / 10) << 4) | (value % 10)
}

/// Decode one frame into a sample.
///
/// Rejects anything that is not exactly [`FRAME_LEN`] bytes starting with
/// [`FRAME_MAGIC`]. Never panics.
pub fn decode(bytes: &[u8]) -> Result<Sample, PacketError> {
    if bytes.len() != FRAME_LEN {
        return Err(PacketError::WrongLength(bytes.len()));
    }
    if bytes[..2] != FRAME_MAGIC {
        return Err(PacketError::BadMagic(bytes[0], bytes[1]));
    }

    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[DOSE_OFFSET..DOSE_OFFSET + 4]);
    let dose_raw = u32::from_le_bytes(raw);
    let dose_nsv_per_h = f64::from(dose_raw) * RAW_TO_NR_PER_S * NR_PER_S_TO_NSV_PER_H;

    let ts = &bytes[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 6];
    let timestamp = SensorTimestamp {
        year: YEAR_BASE + u16::from(bcd_to_int(ts[0])),
        month: bcd_to_int(ts[1]),
        day: bcd_to_int(ts[2]),
        hour: bcd_to_int(ts[3]),
        minute: bcd_to_int(ts[4]),
        second: bcd_to_int(ts[5]),
    };

    Ok(Sample {
        dose_nsv_per_h,
        timestamp,
    })
}

/// Build a well-formed frame carrying `dose_raw` (0.1 nR/s units) and `timestamp`.
///
/// Bytes outside the decoded fields are zero. Timestamp fields wrap modulo 100
/// since each is a single BCD byte on the wire.
pub fn encode_frame(dose_raw: u32, timestamp: &SensorTimestamp) -> Frame {
    let mut bytes = [0u8; FRAME_LEN];
    bytes[..2].copy_from_slice(&FRAME_MAGIC);

    let year_offset = (timestamp.year.saturating_sub(YEAR_BASE) % 100) as u8;
    let fields = [
        year_offset,
        timestamp.month,
        timestamp.day,
        timestamp.hour,
        timestamp.minute,
        timestamp.second,
    ];
    for (slot, value) in bytes[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 6]
        .iter_mut()
        .zip(fields)
    {
        *slot = int_to_bcd(value);
    }

    bytes[DOSE_OFFSET..DOSE_OFFSET + 4].copy_from_slice(&dose_raw.to_le_bytes());
    Frame(bytes)
}
