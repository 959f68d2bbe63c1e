use chrono::{Duration, NaiveDate};

use crate::models::{DayStats, Statistics};

/// 日期键，ISO格式（YYYY-MM-DD）。由调用方在完成时刻取本地日期，
/// 统计本体不感知"现在"。
pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// 记录一次完成的专注会话：总量与当日桶在同一次调用里一起递增，
/// 外部看不到中间状态。
pub fn record_focus_completion(stats: &mut Statistics, minutes: u32, today: &str) {
    stats.total_sessions += 1;
    stats.total_focus_minutes += minutes;

    let day = stats.daily_stats.entry(today.to_string()).or_default();
    day.sessions += 1;
    day.focus_minutes += minutes;
}

/// 最近7天报表
#[derive(Debug, Clone)]
pub struct WeeklyReport {
    pub days: Vec<(String, DayStats)>,
    pub sessions: u32,
    pub focus_minutes: u32,
}

/// 以today结尾的最近7天逐日数据与合计，缺失的日期补零桶
pub fn weekly_report(stats: &Statistics, today: NaiveDate) -> WeeklyReport {
    let mut days = Vec::with_capacity(7);
    let mut sessions = 0;
    let mut focus_minutes = 0;

    for offset in (0..7).rev() {
        let date = today - Duration::days(offset);
        let key = day_key(date);
        let bucket = stats.daily_stats.get(&key).copied().unwrap_or_default();
        sessions += bucket.sessions;
        focus_minutes += bucket.focus_minutes;
        days.push((key, bucket));
    }

    WeeklyReport {
        days,
        sessions,
        focus_minutes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn completion_increments_totals_and_day_bucket_together() {
        let mut stats = Statistics::default();
        record_focus_completion(&mut stats, 25, "2026-08-29");

        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.total_focus_minutes, 25);
        let day = stats.daily_stats.get("2026-08-29").unwrap();
        assert_eq!(day.sessions, 1);
        assert_eq!(day.focus_minutes, 25);
    }

    #[test]
    fn completion_accumulates_across_days() {
        let mut stats = Statistics::default();
        record_focus_completion(&mut stats, 25, "2026-08-28");
        record_focus_completion(&mut stats, 25, "2026-08-29");
        record_focus_completion(&mut stats, 50, "2026-08-29");

        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.total_focus_minutes, 100);
        assert_eq!(stats.daily_stats.get("2026-08-28").unwrap().sessions, 1);
        let today = stats.daily_stats.get("2026-08-29").unwrap();
        assert_eq!(today.sessions, 2);
        assert_eq!(today.focus_minutes, 75);
    }

    #[test]
    fn weekly_report_covers_trailing_seven_days() {
        let mut stats = Statistics::default();
        record_focus_completion(&mut stats, 25, "2026-08-29");
        record_focus_completion(&mut stats, 25, "2026-08-23");
        // 超出7天窗口，不应计入
        record_focus_completion(&mut stats, 25, "2026-08-22");

        let report = weekly_report(&stats, date("2026-08-29"));
        assert_eq!(report.days.len(), 7);
        assert_eq!(report.days[0].0, "2026-08-23");
        assert_eq!(report.days[6].0, "2026-08-29");
        assert_eq!(report.sessions, 2);
        assert_eq!(report.focus_minutes, 50);
        // 缺失日期是零桶
        assert_eq!(report.days[1].1, DayStats::default());
    }
}
