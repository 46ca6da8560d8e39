//! Deterministic cron -> systemd `OnCalendar` conversion for the `cron`
//! dispatcher verb. The rules are fixed and literal, not an
//! attempt at fully general cron semantics:
//!
//! - minute/hour/day-of-month are zero-padded when numeric.
//! - `*/N` on minute or hour becomes a systemd step expression (`0/N`).
//! - `*/N` on day-of-month becomes a minute-field interval instead (the
//!   source's own stated, deliberately simplified behavior — systemd's
//!   calendar grammar has no native "every N days" primitive, so the
//!   day-of-month step count is folded into the minute field rather than
//!   approximated some other way; see DESIGN.md).
//! - day-of-week numbers map `0 -> Sun ... 6 -> Sat`; ranges `a-b` become
//!   `X..Y`; lists pass through comma-joined.

use crate::errors::{Error, Result};

const DOW_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    /// Minute field, as originally written.
    pub minute: String,
    /// Hour field, as originally written.
    pub hour: String,
    /// Day-of-month field, as originally written.
    pub dom: String,
    /// Month field, as originally written (passed through verbatim; the
    /// source only specifies deterministic conversion for
    /// minute/hour/day-of-month/day-of-week).
    pub month: String,
    /// Day-of-week field, as originally written.
    pub dow: String,
}

impl CronSpec {
    /// Parse a `m h dom mon dow` cron string.
    pub fn parse(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::InvalidInput(format!(
                "cron expression must have 5 fields, got {}: '{s}'",
                fields.len()
            )));
        }
        Ok(CronSpec {
            minute: fields[0].to_string(),
            hour: fields[1].to_string(),
            dom: fields[2].to_string(),
            month: fields[3].to_string(),
            dow: fields[4].to_string(),
        })
    }
}

fn pad2(n: &str) -> Result<String> {
    let v: u32 = n
        .parse()
        .map_err(|_| Error::InvalidInput(format!("not a number: '{n}'")))?;
    Ok(format!("{v:02}"))
}

fn convert_minute_or_hour(field: &str) -> Result<String> {
    if field == "*" {
        return Ok("*".to_string());
    }
    if let Some(step) = field.strip_prefix("*/") {
        let step: u32 = step
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad step field: '{field}'")))?;
        return Ok(format!("0/{step}"));
    }
    if field.contains(',') {
        let parts: Result<Vec<String>> = field.split(',').map(pad2).collect();
        return Ok(parts?.join(","));
    }
    pad2(field)
}

fn convert_dow_token(token: &str) -> Result<String> {
    if let Some((a, b)) = token.split_once('-') {
        let a: usize = a
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad dow range: '{token}'")))?;
        let b: usize = b
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad dow range: '{token}'")))?;
        let a_name = DOW_NAMES
            .get(a % 7)
            .ok_or_else(|| Error::InvalidInput(format!("bad dow: '{a}'")))?;
        let b_name = DOW_NAMES
            .get(b % 7)
            .ok_or_else(|| Error::InvalidInput(format!("bad dow: '{b}'")))?;
        return Ok(format!("{a_name}..{b_name}"));
    }
    let n: usize = token
        .parse()
        .map_err(|_| Error::InvalidInput(format!("bad dow: '{token}'")))?;
    DOW_NAMES
        .get(n % 7)
        .map(|s| s.to_string())
        .ok_or_else(|| Error::InvalidInput(format!("bad dow: '{token}'")))
}

fn convert_dow(field: &str) -> Result<Option<String>> {
    if field == "*" {
        return Ok(None);
    }
    let parts: Result<Vec<String>> = field.split(',').map(convert_dow_token).collect();
    Ok(Some(parts?.join(",")))
}

/// Convert a parsed cron spec into a systemd `OnCalendar=` value.
pub fn to_on_calendar(spec: &CronSpec) -> Result<String> {
    let dow_prefix = convert_dow(&spec.dow)?
        .map(|d| format!("{d} "))
        .unwrap_or_default();

    if let Some(step) = spec.dom.strip_prefix("*/") {
        // `*/N` on day-of-month becomes a minute-field interval: the day
        // and month fields collapse to `*`, and the step count is folded
        // into the minute field alongside whatever hour was requested.
        let step: u32 = step
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad day-of-month step: '{}'", spec.dom)))?;
        let hour = convert_minute_or_hour(&spec.hour)?;
        return Ok(format!("{dow_prefix}*-*-* {hour}:0/{step}:00"));
    }

    let day = if spec.dom == "*" {
        "*".to_string()
    } else {
        pad2(&spec.dom)?
    };
    let month = if spec.month == "*" {
        "*".to_string()
    } else {
        pad2(&spec.month)?
    };
    let minute = convert_minute_or_hour(&spec.minute)?;
    let hour = convert_minute_or_hour(&spec.hour)?;

    Ok(format!("{dow_prefix}*-{month}-{day} {hour}:{minute}:00"))
}

/// Convenience: parse and convert in one step.
pub fn cron_to_on_calendar(cron: &str) -> Result<String> {
    to_on_calendar(&CronSpec::parse(cron)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_at_time() {
        assert_eq!(
            cron_to_on_calendar("30 2 * * *").unwrap(),
            "*-*-* 02:30:00"
        );
    }

    #[test]
    fn weekday_range() {
        assert_eq!(
            cron_to_on_calendar("0 9 * * 1-5").unwrap(),
            "Mon..Fri *-*-* 09:00:00"
        );
    }

    #[test]
    fn dow_list() {
        assert_eq!(
            cron_to_on_calendar("0 0 * * 0,6").unwrap(),
            "Sun,Sat *-*-* 00:00:00"
        );
    }

    #[test]
    fn every_15_minutes() {
        assert_eq!(
            cron_to_on_calendar("*/15 * * * *").unwrap(),
            "*-*-* *:0/15:00"
        );
    }

    #[test]
    fn day_of_month_step_folds_into_minute() {
        assert_eq!(
            cron_to_on_calendar("0 3 */2 * *").unwrap(),
            "*-*-* 03:0/2:00"
        );
    }

    #[test]
    fn specific_day_of_month() {
        assert_eq!(
            cron_to_on_calendar("0 0 15 6 *").unwrap(),
            "*-06-15 00:00:00"
        );
    }

    #[test]
    fn rejects_malformed_expression() {
        assert!(CronSpec::parse("0 0 * *").is_err());
    }
}
