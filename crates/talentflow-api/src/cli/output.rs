//! Shared argument parsing and rendering helpers.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use serde_json::Value;
use talentflow_types::instance::{InstanceStatus, WorkStatus};
use uuid::Uuid;

pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a `--flag JSON` argument. Missing means `{}`.
pub fn parse_json_arg(flag: &str, raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(Value::Object(Default::default())),
        Some(s) => serde_json::from_str(s).with_context(|| format!("--{flag} is not valid JSON")),
    }
}

pub fn parse_id(what: &str, raw: &str) -> Result<Uuid> {
    raw.trim()
        .parse()
        .with_context(|| format!("invalid {what} ID: '{raw}'"))
}

/// RFC 3339 timestamp or a plain `YYYY-MM-DD` date (midnight UTC).
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") else {
        bail!("invalid date '{raw}': expected RFC 3339 or YYYY-MM-DD");
    };
    match date.and_hms_opt(0, 0, 0) {
        Some(midnight) => Ok(midnight.and_utc()),
        None => bail!("invalid date '{raw}'"),
    }
}

pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M").to_string()
}

pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    let mut header: Vec<Cell> = headers.iter().map(|h| Cell::new(h)).collect();
    if let Some(first) = header.first_mut() {
        *first = Cell::new(headers[0]).fg(Color::Cyan);
    }
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn status_cell(status: InstanceStatus) -> Cell {
    let color = match status {
        InstanceStatus::Active => Color::Cyan,
        InstanceStatus::Suspended => Color::Yellow,
        InstanceStatus::Completed => Color::Green,
        InstanceStatus::Cancelled => Color::DarkGrey,
        InstanceStatus::Failed => Color::Red,
    };
    Cell::new(status).fg(color)
}

pub fn work_status_cell(status: WorkStatus) -> Cell {
    let color = match status {
        WorkStatus::Pending => Color::Yellow,
        WorkStatus::Completed | WorkStatus::Approved => Color::Green,
        WorkStatus::Rejected => Color::Red,
        WorkStatus::Expired => Color::DarkGrey,
    };
    Cell::new(status).fg(color)
}

/// Compact single-line JSON, truncated for table cells.
pub fn preview(value: &Value, max: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= max {
        return text;
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
