//! SAS dates, datetimes and times
//!
//! SAS stores all three as plain numbers: days since 1960-01-01 for dates,
//! seconds since 1960-01-01 00:00 for datetimes and seconds since midnight
//! for times. Only the column's display format tells them apart.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::types::{DisplayFormat, Value};

/// Past this many seconds (or days) from 1960 a value is treated as garbage
const MAX_SAS_SECONDS: f64 = 1e12;
const MAX_SAS_DAYS: f64 = 1e7;
const SECONDS_PER_DAY: f64 = 86_400.0;

const DATE_FORMATS: &[&str] = &[
    "B8601DA", "DATE", "DAY", "DDMMYY", "DDMMYYB", "DDMMYYC", "DDMMYYD", "DDMMYYN", "DDMMYYP",
    "DDMMYYS", "DOWNAME", "E8601DA", "IS8601DA", "JULDAY", "JULIAN", "MMDDYY", "MMDDYYB",
    "MMDDYYC", "MMDDYYD", "MMDDYYN", "MMDDYYP", "MMDDYYS", "MMYY", "MMYYC", "MMYYD", "MMYYN",
    "MMYYP", "MMYYS", "MONNAME", "MONTH", "MONYY", "NENGO", "QTR", "QTRR", "WEEKDATE",
    "WEEKDATX", "WEEKDAY", "WEEKV", "WORDDATE", "WORDDATX", "YEAR", "YYMM", "YYMMC", "YYMMD",
    "YYMMDD", "YYMMDDB", "YYMMDDC", "YYMMDDD", "YYMMDDN", "YYMMDDP", "YYMMDDS", "YYMMN",
    "YYMMP", "YYMMS", "YYMON", "YYQ", "YYQC", "YYQD", "YYQN", "YYQP", "YYQR", "YYQRC", "YYQRD",
    "YYQRN", "YYQRP", "YYQRS", "YYQS",
];

const DATETIME_FORMATS: &[&str] = &[
    "B8601DN", "B8601DT", "B8601DX", "B8601DZ", "B8601LX", "DATEAMPM", "DATETIME", "DTDATE",
    "DTMONYY", "DTWKDATX", "DTYEAR", "E8601DN", "E8601DT", "E8601DX", "E8601DZ", "E8601LX",
    "IS8601DN", "IS8601DT", "IS8601DZ", "MDYAMPM",
];

const TIME_FORMATS: &[&str] = &[
    "B8601LZ", "B8601TM", "B8601TZ", "E8601LZ", "E8601TM", "E8601TZ", "HHMM", "HOUR",
    "IS8601LZ", "IS8601TM", "IS8601TZ", "MMSS", "TIME", "TIMEAMPM", "TOD",
];

/// Which calendar meaning a numeric column carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporal {
    Date,
    DateTime,
    Time,
}

impl Temporal {
    /// Classify a display format such as `DATE9.` or `DATETIME20.`
    pub fn of(format: &DisplayFormat) -> Option<Self> {
        let name = format.name.trim().to_ascii_uppercase();
        let name = name.as_str();
        if DATE_FORMATS.contains(&name) {
            Some(Temporal::Date)
        } else if DATETIME_FORMATS.contains(&name) {
            Some(Temporal::DateTime)
        } else if TIME_FORMATS.contains(&name) {
            Some(Temporal::Time)
        } else {
            None
        }
    }

    /// Turn a stored number into a calendar value. Numbers that would not
    /// convert back to exactly the same value stay numbers.
    pub fn decode(self, n: f64) -> Value {
        let value = match self {
            Temporal::Date => sas_date(n).map(Value::Date),
            Temporal::DateTime => sas_datetime(n).map(Value::DateTime),
            Temporal::Time => sas_time(n).map(Value::Time),
        };
        match value {
            Some(value) if to_sas_number(&value) == Some(n) => value,
            _ => Value::Number(n),
        }
    }
}

fn epoch() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1960, 1, 1)?.and_hms_opt(0, 0, 0)
}

fn sas_date(days: f64) -> Option<NaiveDate> {
    if !days.is_finite() || days.abs() > MAX_SAS_DAYS {
        return None;
    }
    epoch()?
        .date()
        .checked_add_signed(Duration::days(days.floor() as i64))
}

/// Convert seconds since the SAS epoch, rounded to the millisecond
pub fn sas_datetime(seconds: f64) -> Option<NaiveDateTime> {
    if !seconds.is_finite() || seconds.abs() > MAX_SAS_SECONDS {
        return None;
    }
    epoch()?.checked_add_signed(Duration::milliseconds((seconds * 1000.0).round() as i64))
}

fn sas_time(seconds: f64) -> Option<NaiveTime> {
    if !(0.0..SECONDS_PER_DAY).contains(&seconds) {
        return None;
    }
    let millis = (seconds * 1000.0).round() as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(millis / 1000, (millis % 1000) * 1_000_000)
}

/// The number SAS stores for a cell, or `None` for nulls and text
pub fn to_sas_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::Date(date) => {
            let days = date.signed_duration_since(epoch()?.date()).num_days();
            Some(days as f64)
        }
        Value::DateTime(datetime) => {
            let millis = datetime.signed_duration_since(epoch()?).num_milliseconds();
            Some(millis as f64 / 1000.0)
        }
        Value::Time(time) => {
            let millis = time.num_seconds_from_midnight() * 1000 + time.nanosecond() / 1_000_000;
            Some(f64::from(millis) / 1000.0)
        }
        Value::Null | Value::String(_) => None,
    }
}
