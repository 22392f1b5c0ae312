use chrono::{DateTime, FixedOffset, Offset, TimeDelta, Timelike, Utc};

/// Offset of America/Sao_Paulo. Brazil dropped daylight saving in 2019 so a fixed offset is exact.
const SAO_PAULO_OFFSET_SECS: i32 = 3 * 3600;

pub fn sao_paulo() -> FixedOffset {
    FixedOffset::west_opt(SAO_PAULO_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Current wall clock time in São Paulo.
pub fn now_sao_paulo() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&sao_paulo())
}

/// The value written next to a bank snapshot: the timestamp shifted by -3h and
/// truncated to the minute.
pub fn snapshot_minute(taken_at: DateTime<Utc>) -> String {
    let shifted = taken_at - TimeDelta::hours(3);
    let truncated = shifted
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(shifted);
    truncated.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Stamp used in the status cell of the indicators worksheet.
pub fn status_stamp(now: DateTime<FixedOffset>) -> String {
    now.format("%d/%m/%Y %H:%M:%S").to_string()
}

pub fn loop_banner(now: DateTime<FixedOffset>) -> String {
    let rule = "=".repeat(50);
    format!("{rule}\nUpdate at: {now}\n{rule}")
}
