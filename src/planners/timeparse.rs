//! 确定性时间解析与周期规则校验
//!
//! parse_when 覆盖常见的一次性时间表达（in 10 minutes / tomorrow at 9am / next friday /
//! 2025-03-14 18:30），在用户时区下计算后转为 UTC；解析不了返回 None，交给模型解析。
//! 周期日程用 cron 表达式，5 段写法补齐秒字段后由 cron crate 校验。

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use cron::Schedule;
use regex::Regex;

/// 无具体时刻时使用的本地时刻
pub const DEFAULT_HOUR: u32 = 17;
const TONIGHT_HOUR: u32 = 20;

const RECURRING_KEYWORDS: &[&str] = &[
    "every", "each", "daily", "weekly", "monthly", "annually", "yearly", "hourly",
];

struct Patterns {
    relative: Regex,
    from_now: Regex,
    iso_date: Regex,
    weekday: Regex,
    clock_at: Regex,
    clock_ampm: Regex,
    too_frequent: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                relative: Regex::new(r"\bin\s+(\d+|an?|one|half\s+an?)\s+(minute|min|hour|hr|day|week)s?\b").ok()?,
                from_now: Regex::new(r"\b(\d+|an?|one)\s+(minute|min|hour|hr|day|week)s?\s+from\s+now\b").ok()?,
                iso_date: Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})(?:[ t](\d{1,2}):(\d{2}))?").ok()?,
                weekday: Regex::new(
                    r"\b(next\s+|on\s+|this\s+)?(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b",
                )
                .ok()?,
                clock_at: Regex::new(r"\bat\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").ok()?,
                clock_ampm: Regex::new(r"\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b").ok()?,
                too_frequent: Regex::new(
                    r"\b(every|each)\s+(\d+\s+|few\s+|couple\s+of\s+|other\s+)?(seconds?|minutes?|mins?|hours?|hrs?)\b|\bhourly\b|\bevery\s+half\s+(an\s+)?hour\b|\b(twice|thrice|\d+\s+times)\s+(a|per|each)\s+day\b",
                )
                .ok()?,
            })
        })
        .as_ref()
}

/// 是否含周期关键词
pub fn has_recurring_keyword(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| RECURRING_KEYWORDS.contains(&w))
}

/// 表达式本身是否要求比每天一次更频繁的周期
pub fn is_sub_daily_phrase(text: &str) -> bool {
    patterns().map_or(false, |p| p.too_frequent.is_match(&text.to_lowercase()))
}

fn amount(word: &str) -> Option<i64> {
    match word.trim() {
        "a" | "an" | "one" => Some(1),
        w if w.starts_with("half") => Some(0),
        w => w.parse().ok(),
    }
}

/// 超出可表示范围的数量返回 None
fn unit_duration(n: i64, unit: &str, half: bool) -> Option<Duration> {
    match unit {
        "minute" | "min" => Duration::try_minutes(n),
        "hour" | "hr" if half => Duration::try_minutes(30),
        "hour" | "hr" => Duration::try_hours(n),
        "day" => Duration::try_days(n),
        "week" => Duration::try_weeks(n),
        _ => None,
    }
}

fn local_to_utc(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    Weekday::from_str(name).ok()
}

/// 从文本中取时刻（at 9 / 9:30pm / noon / midnight）
fn clock_time(p: &Patterns, text: &str) -> Option<NaiveTime> {
    if text.contains("noon") {
        return NaiveTime::from_hms_opt(12, 0, 0);
    }
    if text.contains("midnight") {
        return NaiveTime::from_hms_opt(0, 0, 0);
    }
    let caps = p.clock_ampm.captures(text).or_else(|| p.clock_at.captures(text))?;
    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
    match caps.get(3).map(|m| m.as_str()) {
        Some("pm") if hour < 12 => hour += 12,
        Some("am") if hour == 12 => hour = 0,
        _ => {}
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// 解析一次性时间表达，返回 UTC 时刻
pub fn parse_when(text: &str, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let p = patterns()?;
    let text = text.to_lowercase();

    for re in [&p.relative, &p.from_now] {
        if let Some(caps) = re.captures(&text) {
            let word = caps.get(1)?.as_str();
            let half = word.starts_with("half");
            let n = amount(word)?;
            return unit_duration(n, caps.get(2)?.as_str(), half).and_then(|d| now.checked_add_signed(d));
        }
    }

    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive();
    let time = clock_time(p, &text);

    if let Some(caps) = p.iso_date.captures(&text) {
        let date = NaiveDate::from_ymd_opt(
            caps.get(1)?.as_str().parse().ok()?,
            caps.get(2)?.as_str().parse().ok()?,
            caps.get(3)?.as_str().parse().ok()?,
        )?;
        let explicit = match (caps.get(4), caps.get(5)) {
            (Some(h), Some(m)) => NaiveTime::from_hms_opt(h.as_str().parse().ok()?, m.as_str().parse().ok()?, 0),
            _ => None,
        };
        let time = explicit.or(time).or_else(|| NaiveTime::from_hms_opt(DEFAULT_HOUR, 0, 0))?;
        return local_to_utc(tz, date, time);
    }

    let day = if text.contains("day after tomorrow") {
        Some((today + Duration::days(2), DEFAULT_HOUR))
    } else if text.contains("tomorrow") {
        Some((today + Duration::days(1), DEFAULT_HOUR))
    } else if text.contains("tonight") {
        Some((today, TONIGHT_HOUR))
    } else if text.contains("today") {
        Some((today, DEFAULT_HOUR))
    } else if let Some(caps) = p.weekday.captures(&text) {
        let target = parse_weekday(caps.get(2)?.as_str())?;
        let current = today.weekday().num_days_from_monday() as i64;
        let wanted = target.num_days_from_monday() as i64;
        let mut ahead = (wanted - current).rem_euclid(7);
        if ahead == 0 {
            ahead = 7;
        }
        Some((today + Duration::days(ahead), DEFAULT_HOUR))
    } else {
        None
    };

    match (day, time) {
        (Some((date, default_hour)), t) => {
            let t = t.or_else(|| NaiveTime::from_hms_opt(default_hour, 0, 0))?;
            local_to_utc(tz, date, t)
        }
        (None, Some(t)) => {
            let candidate = local_to_utc(tz, today, t)?;
            if candidate > now {
                Some(candidate)
            } else {
                local_to_utc(tz, today + Duration::days(1), t)
            }
        }
        (None, None) => None,
    }
}

/// 解析 UTC 时间戳（`2025-03-10T12:00:00Z` 或任意 RFC 3339）
pub fn parse_iso_utc(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|n| n.and_utc())
        })
}

/// 标准 cron 的星期数字（0-7，周日为 0 或 7）换成 cron crate 的 1-7（周日为 1）
fn shift_weekday_field(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (part, None),
            };
            let range = range
                .split('-')
                .map(|t| match t.parse::<u32>() {
                    Ok(n) => ((n % 7) + 1).to_string(),
                    Err(_) => t.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(s) => format!("{range}/{s}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// 5 段 cron 补齐秒字段；不合法返回 None
pub fn normalize_cron(value: &str) -> Option<String> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            shift_weekday_field(fields[4])
        ),
        6 | 7 => fields.join(" "),
        _ => return None,
    };
    Schedule::from_str(&normalized).ok().map(|_| normalized)
}

fn schedule(value: &str) -> Option<Schedule> {
    normalize_cron(value).and_then(|v| Schedule::from_str(&v).ok())
}

/// 接下来若干次运行之间的最小间隔
pub fn min_cron_gap(value: &str, tz: Tz, after: DateTime<Utc>) -> Option<Duration> {
    let schedule = schedule(value)?;
    let runs: Vec<DateTime<Tz>> = schedule.after(&after.with_timezone(&tz)).take(8).collect();
    runs.windows(2).map(|w| w[1].clone() - w[0].clone()).min()
}

/// after 之后的下一次运行时刻
pub fn next_cron_run(value: &str, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule(value)?
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}
