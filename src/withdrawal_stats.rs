//! Statistics over hourly PIXOUT withdrawal rows.

use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDateTime, NaiveTime, Timelike};

use crate::db::{MerchantKey, WithdrawalHour};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Hour,
    /// Half days starting at 00:00 and 12:00.
    HalfDay,
    Day,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Hour, Bucket::HalfDay, Bucket::Day];

    pub fn start_of(self, at: NaiveDateTime) -> NaiveDateTime {
        let date = at.date();
        let hour = match self {
            Bucket::Hour => at.hour(),
            Bucket::HalfDay => at.hour() / 12 * 12,
            Bucket::Day => 0,
        };
        date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN))
    }
}

/// Mean and sample standard deviation. The deviation is `None` for fewer than two samples.
pub fn mean_std(samples: &[f64]) -> (Option<f64>, Option<f64>) {
    if samples.is_empty() {
        return (None, None);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (Some(mean), None);
    }
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (Some(mean), Some(variance.sqrt()))
}

/// Per bucket size: mean volume, std volume, mean count, std count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WithdrawalMetrics(pub [Option<f64>; 12]);

/// Sums volume and count per merchant and bucket, then reduces each merchant's buckets
/// to mean and standard deviation. Buckets without withdrawals don't take part.
pub fn withdrawal_metrics(rows: &[WithdrawalHour]) -> HashMap<MerchantKey, WithdrawalMetrics> {
    let mut metrics: HashMap<MerchantKey, WithdrawalMetrics> = HashMap::new();
    for (i, bucket) in Bucket::ALL.into_iter().enumerate() {
        let mut sums: HashMap<&MerchantKey, BTreeMap<NaiveDateTime, (f64, f64)>> = HashMap::new();
        for row in rows {
            let slot = sums
                .entry(&row.key)
                .or_default()
                .entry(bucket.start_of(row.hour))
                .or_default();
            slot.0 += row.volume;
            slot.1 += row.count;
        }
        for (key, buckets) in sums {
            let volumes: Vec<f64> = buckets.values().map(|(v, _)| *v).collect();
            let counts: Vec<f64> = buckets.values().map(|(_, c)| *c).collect();
            let (mean_volume, std_volume) = mean_std(&volumes);
            let (mean_count, std_count) = mean_std(&counts);
            let entry = metrics.entry(key.clone()).or_default();
            entry.0[i * 4..i * 4 + 4]
                .copy_from_slice(&[mean_volume, std_volume, mean_count, std_count]);
        }
    }
    metrics
}

/// Total withdrawn volume per merchant.
pub fn volume_by_merchant(rows: &[WithdrawalHour]) -> HashMap<MerchantKey, f64> {
    let mut totals: HashMap<MerchantKey, f64> = HashMap::new();
    for row in rows {
        *totals.entry(row.key.clone()).or_default() += row.volume;
    }
    totals
}

/// Volume of the last 1h, 12h and 24h per merchant. Merchants missing from a window get `None` there.
pub fn recent_withdrawals(
    last_1h: &[WithdrawalHour],
    last_12h: &[WithdrawalHour],
    last_24h: &[WithdrawalHour],
) -> HashMap<MerchantKey, [Option<f64>; 3]> {
    let mut recent: HashMap<MerchantKey, [Option<f64>; 3]> = HashMap::new();
    for (i, window) in [last_1h, last_12h, last_24h].into_iter().enumerate() {
        for (key, volume) in volume_by_merchant(window) {
            recent.entry(key).or_default()[i] = Some(volume);
        }
    }
    recent
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 4, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn row(id: &str, hour: NaiveDateTime, count: f64, volume: f64) -> WithdrawalHour {
        WithdrawalHour {
            key: MerchantKey::new(id, format!("m{id}")),
            hour,
            count,
            volume,
        }
    }

    #[test]
    fn half_days_align_to_noon() {
        assert_eq!(Bucket::HalfDay.start_of(at(3, 11)), at(3, 0));
        assert_eq!(Bucket::HalfDay.start_of(at(3, 12)), at(3, 12));
        assert_eq!(Bucket::HalfDay.start_of(at(3, 23)), at(3, 12));
        assert_eq!(Bucket::Day.start_of(at(3, 23)), at(3, 0));
        assert_eq!(Bucket::Hour.start_of(at(3, 23)), at(3, 23));
    }

    #[test]
    fn sample_standard_deviation() {
        let (mean, std) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(mean, Some(5.0));
        assert!((std.unwrap() - 2.138_089_935).abs() < 1e-6);
        assert_eq!(mean_std(&[3.0]), (Some(3.0), None));
        assert_eq!(mean_std(&[]), (None, None));
    }

    #[test]
    fn metrics_per_bucket_size() {
        let rows = vec![
            row("1", at(1, 9), 1.0, 100.0),
            row("1", at(1, 10), 3.0, 300.0),
            row("1", at(2, 13), 2.0, 50.0),
            row("2", at(1, 9), 1.0, 10.0),
        ];
        let metrics = withdrawal_metrics(&rows);

        let m1 = &metrics[&MerchantKey::new("1", "m1")].0;
        // hourly: 100, 300, 50
        assert_eq!(m1[0], Some(150.0));
        assert_eq!(m1[2], Some(2.0));
        // half days: 400 (day 1 am), 50 (day 2 pm)
        assert_eq!(m1[4], Some(225.0));
        assert_eq!(m1[6], Some(3.0));
        // days: 400, 50
        assert_eq!(m1[8], Some(225.0));
        assert!(m1[9].is_some());

        let m2 = &metrics[&MerchantKey::new("2", "m2")].0;
        assert_eq!(m2[0], Some(10.0));
        assert_eq!(m2[1], None);
        assert_eq!(m2[11], None);
    }

    #[test]
    fn recent_windows_are_outer_joined() {
        let last_1h = vec![row("1", at(5, 10), 1.0, 5.0)];
        let last_24h = vec![row("1", at(5, 10), 1.0, 5.0), row("2", at(5, 1), 2.0, 20.0)];
        let recent = recent_withdrawals(&last_1h, &[], &last_24h);
        assert_eq!(recent[&MerchantKey::new("1", "m1")], [Some(5.0), None, Some(5.0)]);
        assert_eq!(recent[&MerchantKey::new("2", "m2")], [None, None, Some(20.0)]);
    }
}
