use std::{borrow::Cow, fmt, str::FromStr, time::Duration as StdDuration};

use jiff::{tz::TimeZone, Timestamp, Zoned};
use jiff_cron::Schedule;

/// Expression for a job that never fires on its own.
pub const NEVER: &str = "@never";

/// Errors returned when parsing a trigger.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// Error returned by the `jiff` crate, e.g. an unknown time zone.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),

    /// Error returned by the `jiff-cron` crate.
    #[error(transparent)]
    Cron(#[from] jiff_cron::error::Error),

    /// The expression isn't well formed.
    #[error("Parsing error: {0}")]
    Parse(String),
}

/// When a job fires.
///
/// Parsed from a cron expression with an optional IANA time zone suffix, or
/// from [`NEVER`] for jobs that only run when triggered manually.
///
/// # Example
///
/// ```rust
/// use tickwork::job::Trigger;
///
/// // Standard five-field cron, evaluated in UTC.
/// let every_five_minutes: Trigger = "*/5 * * * *".parse()?;
///
/// // Six fields (with seconds) and a zone.
/// let nightly: Trigger = "0 30 2 * * *[America/New_York]".parse()?;
///
/// let manual: Trigger = "@never".parse()?;
/// assert!(manual.next_fire().is_none());
/// # Ok::<_, tickwork::job::TriggerError>(())
/// ```
#[derive(Debug, PartialEq)]
pub enum Trigger {
    /// Fires on a cron schedule.
    Cron(ZonedSchedule),

    /// Never fires automatically.
    Never,
}

impl Trigger {
    /// The next fire time after now, if there is one.
    pub fn next_fire(&self) -> Option<Timestamp> {
        match self {
            Self::Cron(schedule) => schedule.next_fire(),
            Self::Never => None,
        }
    }

    /// Returns `true` for [`Trigger::Never`].
    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }
}

impl FromStr for Trigger {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim() == NEVER {
            return Ok(Self::Never);
        }

        s.parse().map(Self::Cron)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron(schedule) => fmt::Display::fmt(schedule, f),
            Self::Never => f.write_str(NEVER),
        }
    }
}

/// A cron schedule evaluated in a time zone.
#[derive(Debug, PartialEq)]
pub struct ZonedSchedule {
    schedule: Schedule,
    timezone: TimeZone,
}

impl ZonedSchedule {
    /// Creates a new schedule which is associated with a time zone.
    ///
    /// Five-field expressions are read as standard cron,
    /// `minute hour day month weekday`, with weekdays 0-7 (0 and 7 are
    /// Sunday) or `sun`-`sat`. Six- and seven-field expressions carry a
    /// seconds field and are passed to the cron parser as-is, so their
    /// weekdays run 1 (Sunday) through 7.
    pub fn new(cron_expr: &str, time_zone_name: &str) -> Result<Self, TriggerError> {
        let timezone = TimeZone::get(time_zone_name)?;
        if timezone.iana_name().is_none() {
            return Err(TriggerError::Parse(format!(
                "Time zone `{time_zone_name}` is not an IANA name"
            )));
        }

        Self::with_timezone(cron_expr, timezone)
    }

    /// Creates a new schedule evaluated in UTC.
    pub fn utc(cron_expr: &str) -> Result<Self, TriggerError> {
        Self::with_timezone(cron_expr, TimeZone::UTC)
    }

    fn with_timezone(cron_expr: &str, timezone: TimeZone) -> Result<Self, TriggerError> {
        let schedule = with_seconds(cron_expr.trim())?.parse()?;
        Ok(Self { schedule, timezone })
    }

    /// The normalized cron expression.
    pub fn cron_expr(&self) -> String {
        self.schedule.to_string()
    }

    /// The time zone's IANA name.
    pub fn iana_name(&self) -> &str {
        self.timezone.iana_name().unwrap_or("UTC")
    }

    /// The next fire time after now.
    pub fn next_fire(&self) -> Option<Timestamp> {
        self.schedule
            .upcoming(self.tz())
            .next()
            .map(|next| next.timestamp())
    }

    /// How long until the next fire time.
    pub fn until_next(&self) -> Option<StdDuration> {
        self.schedule.upcoming(self.tz()).next().map(|next_zoned| {
            Zoned::now()
                .with_time_zone(self.tz())
                .duration_until(&next_zoned)
                .unsigned_abs()
        })
    }

    fn tz(&self) -> TimeZone {
        self.timezone.to_owned()
    }
}

impl fmt::Display for ZonedSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.cron_expr(), self.iana_name())
    }
}

impl FromStr for ZonedSchedule {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if !s.ends_with(']') {
            return Self::utc(s);
        }

        let open_bracket_pos = s
            .find('[')
            .ok_or_else(|| TriggerError::Parse("Missing opening '['".to_string()))?;

        let cron_expr = &s[..open_bracket_pos];
        let time_zone_name = &s[open_bracket_pos + 1..s.len() - 1];

        Self::new(cron_expr, time_zone_name)
    }
}

const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

// The cron parser always wants a seconds field, and numbers its weekdays
// 1 (Sunday) through 7 (Saturday). Five-field expressions use the standard
// 0-7 weekdays, where both 0 and 7 are Sunday.
fn with_seconds(cron_expr: &str) -> Result<Cow<'_, str>, TriggerError> {
    let fields = cron_expr.split_whitespace().collect::<Vec<_>>();
    let [minute, hour, day, month, weekday] = fields[..] else {
        return Ok(Cow::Borrowed(cron_expr));
    };

    let weekday = cron_weekdays(weekday)?;
    Ok(Cow::Owned(format!("0 {minute} {hour} {day} {month} {weekday}")))
}

fn cron_weekdays(field: &str) -> Result<String, TriggerError> {
    let mut days = [false; 7];

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(step)?)),
            None => (item, None),
        };

        let (first, last) = match range {
            "*" | "?" => (0, 6),
            _ => match range.split_once('-') {
                Some((first, last)) => (weekday_number(first)?, weekday_number(last)?),
                None if step.is_some() => (weekday_number(range)?, 6),
                None => {
                    let day = weekday_number(range)?;
                    (day, day)
                }
            },
        };

        if first > last {
            return Err(TriggerError::Parse(format!("Weekday range `{range}` runs backwards")));
        }

        for day in (first..=last).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    if days.iter().all(|&set| set) {
        return Ok("*".to_string());
    }

    let ordinals = days
        .iter()
        .enumerate()
        .filter(|&(_, &set)| set)
        .map(|(day, _)| (day + 1).to_string())
        .collect::<Vec<_>>();

    Ok(ordinals.join(","))
}

fn weekday_number(value: &str) -> Result<usize, TriggerError> {
    if let Ok(day) = value.parse::<usize>() {
        return if day <= 7 {
            Ok(day)
        } else {
            Err(TriggerError::Parse(format!("Weekday `{day}` is out of range 0-7")))
        };
    }

    let name = value.to_ascii_lowercase();
    WEEKDAYS
        .iter()
        .position(|&weekday| name == weekday)
        .ok_or_else(|| TriggerError::Parse(format!("Unknown weekday `{value}`")))
}

fn parse_step(step: &str) -> Result<usize, TriggerError> {
    match step.parse::<usize>() {
        Ok(step) if step > 0 => Ok(step),
        _ => Err(TriggerError::Parse(format!("Invalid weekday step `{step}`"))),
    }
}

#[cfg(test)]
mod tests {
    use jiff::{civil::Weekday, ToSpan};

    use super::*;

    #[test]
    fn five_fields_gain_a_seconds_field() -> Result<(), TriggerError> {
        let schedule: ZonedSchedule = "*/5 * * * *".parse()?;
        assert_eq!(schedule.iana_name(), "UTC");

        let next = schedule.next_fire().expect("cron should fire");
        let zoned = next.to_zoned(TimeZone::UTC);
        assert_eq!(zoned.second(), 0);
        assert_eq!(zoned.minute() % 5, 0);

        Ok(())
    }

    #[test]
    fn six_fields_pass_through() -> Result<(), TriggerError> {
        let every_second: Trigger = "* * * * * *".parse()?;
        let next = every_second.next_fire().expect("cron should fire");

        let now = Timestamp::now();
        assert!(next > now.checked_sub(1.second())?);
        assert!(next <= now.checked_add(2.seconds())?);

        Ok(())
    }

    #[test]
    fn macros_pass_through() -> Result<(), TriggerError> {
        let daily: Trigger = "@daily".parse()?;
        let next = daily.next_fire().expect("cron should fire");

        let zoned = next.to_zoned(TimeZone::UTC);
        assert_eq!((zoned.hour(), zoned.minute(), zoned.second()), (0, 0, 0));

        Ok(())
    }

    #[test]
    fn never_sentinel() -> Result<(), TriggerError> {
        let trigger: Trigger = " @never ".parse()?;

        assert!(trigger.is_never());
        assert_eq!(trigger.next_fire(), None);
        assert_eq!(trigger.to_string(), NEVER);

        Ok(())
    }

    #[test]
    fn next_fire_is_in_the_future() -> Result<(), TriggerError> {
        let hourly: Trigger = "0 * * * *".parse()?;
        let now = Timestamp::now();
        let next = hourly.next_fire().expect("cron should fire");

        assert!(next > now);
        assert!(next <= now.checked_add(1.hour())?);

        Ok(())
    }

    #[test]
    fn until_next_is_bounded_by_period() -> Result<(), TriggerError> {
        let schedule: ZonedSchedule = "* * * * *".parse()?;
        let until = schedule.until_next().expect("cron should fire");
        assert!(until <= StdDuration::from_secs(60));

        Ok(())
    }

    #[test]
    fn standard_weekdays_become_cron_ordinals() -> Result<(), TriggerError> {
        assert_eq!(with_seconds("0 9 * * 1-5")?, "0 0 9 * * 2,3,4,5,6");
        assert_eq!(with_seconds("* * * * 0")?, "0 * * * * 1");
        assert_eq!(with_seconds("* * * * 7")?, "0 * * * * 1");
        assert_eq!(with_seconds("0 0 * * 5-7")?, "0 0 0 * * 1,6,7");
        assert_eq!(with_seconds("0 0 * * mon,WED")?, "0 0 0 * * 2,4");
        assert_eq!(with_seconds("* * * * */2")?, "0 * * * * 1,3,5,7");
        assert_eq!(with_seconds("* * * * 0-7")?, "0 * * * * *");
        assert_eq!(with_seconds("*/5 * * * *")?, "0 */5 * * * *");

        // Expressions with seconds are already in the parser's numbering.
        assert_eq!(with_seconds("0 0 0 * * 1")?, "0 0 0 * * 1");

        Ok(())
    }

    #[test]
    fn zero_and_seven_are_sunday() -> Result<(), TriggerError> {
        for expr in ["0 0 * * 0", "0 0 * * 7", "0 0 * * sun"] {
            let trigger: Trigger = expr.parse()?;
            let next = trigger.next_fire().expect("cron should fire");
            assert_eq!(next.to_zoned(TimeZone::UTC).weekday(), Weekday::Sunday, "{expr}");
        }

        Ok(())
    }

    #[test]
    fn weekday_range_skips_the_weekend() -> Result<(), TriggerError> {
        let schedule: ZonedSchedule = "0 9 * * 1-5".parse()?;

        let fires = schedule
            .schedule
            .upcoming(TimeZone::UTC)
            .take(7)
            .collect::<Vec<_>>();

        assert!(fires.iter().all(|fire| fire.hour() == 9));
        assert!(fires
            .iter()
            .all(|fire| !matches!(fire.weekday(), Weekday::Saturday | Weekday::Sunday)));
        assert!(fires.iter().any(|fire| fire.weekday() == Weekday::Monday));
        assert!(fires.iter().any(|fire| fire.weekday() == Weekday::Friday));

        Ok(())
    }

    #[test]
    fn five_fields_with_zone() -> Result<(), TriggerError> {
        let schedule: ZonedSchedule = "0 9 * * 1-5[America/New_York]".parse()?;
        assert_eq!(schedule.iana_name(), "America/New_York");

        let next = schedule.next_fire().expect("cron should fire");
        let local = next.to_zoned(schedule.tz());
        assert_eq!((local.hour(), local.minute()), (9, 0));
        assert!(!matches!(local.weekday(), Weekday::Saturday | Weekday::Sunday));

        Ok(())
    }

    #[test]
    fn invalid_weekdays_are_rejected() {
        for expr in ["* * * * 8", "* * * * 5-1", "* * * * */0", "* * * * funday"] {
            assert!(
                matches!(expr.parse::<Trigger>(), Err(TriggerError::Parse(_))),
                "{expr}"
            );
        }
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        assert!("not a cron".parse::<Trigger>().is_err());
        assert!("* * *".parse::<Trigger>().is_err());
        assert!(matches!(
            "* * * * *]".parse::<Trigger>(),
            Err(TriggerError::Parse(_))
        ));
        assert!("* * * * *[Not/AZone]".parse::<Trigger>().is_err());
    }
}
