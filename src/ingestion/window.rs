//! Run dates and the daily close-date window used to select markets.

use crate::error::{PipelineError, Result};
use crate::ingestion::source::MarketFilters;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde_json::Value;

/// Target date and window size for a run.
///
/// An explicit target wins and redefines the window; a target before the run
/// date is a configuration error.
pub fn resolve_dates(
    run_date: NaiveDate,
    window_days: i64,
    target_override: Option<NaiveDate>,
) -> Result<(i64, NaiveDate)> {
    match target_override {
        Some(target) => {
            let window = (target - run_date).num_days();
            if window < 0 {
                return Err(PipelineError::InvalidConfig(
                    "Target date cannot be before the run date".to_string(),
                ));
            }
            Ok((window, target))
        }
        None => Ok((window_days, run_date + Duration::days(window_days))),
    }
}

/// `[target 00:00 UTC, next day 00:00 UTC)`
pub fn day_bounds(target: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = target.and_time(NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}

/// Configured filters plus open markets closing on the target day
pub fn daily_window_filters(base: &MarketFilters, target: NaiveDate) -> MarketFilters {
    let (start, end) = day_bounds(target);
    let mut filters = base.clone();
    filters.insert("closed".to_string(), Value::Bool(false));
    filters.insert(
        "end_date_min".to_string(),
        Value::String(start.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    filters.insert(
        "end_date_max".to_string(),
        Value::String(end.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_window_from_days() {
        let (window, target) = resolve_dates(date(2025, 3, 1), 2, None).unwrap();
        assert_eq!(window, 2);
        assert_eq!(target, date(2025, 3, 3));
    }

    #[test]
    fn test_explicit_target_sets_window() {
        let (window, target) = resolve_dates(date(2025, 3, 1), 1, Some(date(2025, 3, 5))).unwrap();
        assert_eq!(window, 4);
        assert_eq!(target, date(2025, 3, 5));

        let err = resolve_dates(date(2025, 3, 1), 1, Some(date(2025, 2, 28))).unwrap_err();
        assert!(err.to_string().contains("Target date cannot be before the run date"));
    }

    #[test]
    fn test_daily_window_filters() {
        let mut base = MarketFilters::new();
        base.insert("tag_id".to_string(), json!(7));
        base.insert("closed".to_string(), json!(true));

        let filters = daily_window_filters(&base, date(2025, 3, 1));
        assert_eq!(filters["closed"], json!(false));
        assert_eq!(filters["end_date_min"], json!("2025-03-01T00:00:00Z"));
        assert_eq!(filters["end_date_max"], json!("2025-03-02T00:00:00Z"));
        assert_eq!(filters["tag_id"], json!(7));
    }
}
