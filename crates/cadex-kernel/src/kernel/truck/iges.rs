//! IGES copious-data reader
//!
//! Only planar polylines (entity 106) are transferred. Each becomes one
//! polygon face.

use std::collections::BTreeMap;

use glam::DVec3;

use super::status_for;
use crate::kernel::ReadStatus;

const COPIOUS_DATA: i64 = 106;

/// Columns 1-72 of a fixed-format record
const RECORD_DATA: usize = 72;
/// Columns 1-64 of a parameter record
const PARAMETER_DATA: usize = 64;

#[derive(Debug)]
pub(super) struct IgesContents {
    pub status: ReadStatus,
    pub polylines: Vec<Vec<DVec3>>,
    pub messages: Vec<String>,
}

/// Parse a number, accepting Fortran `D` exponents
fn number(token: &str) -> Option<f64> {
    let token = token.trim().replace(['D', 'd'], "E");
    if token.is_empty() {
        return None;
    }
    token.parse().ok()
}

/// Delimiters declared at the start of the global section
fn delimiters(global: &str) -> (char, char) {
    let mut param = ',';
    let mut record = ';';
    let mut rest = global.trim_start();
    if let Some(tail) = rest.strip_prefix("1H") {
        let mut chars = tail.chars();
        if let Some(c) = chars.next() {
            param = c;
        }
        rest = chars.as_str();
    } else if let Some(tail) = rest.strip_prefix(param) {
        rest = tail;
    }
    rest = rest.strip_prefix(param).unwrap_or(rest);
    if let Some(tail) = rest.strip_prefix("1H") {
        if let Some(c) = tail.chars().next() {
            record = c;
        }
    }
    (param, record)
}

fn polyline(values: &[f64]) -> Result<Vec<DVec3>, String> {
    let (&ip, rest) = values.split_first().ok_or("missing data type flag")?;
    let (&count, rest) = rest.split_first().ok_or("missing point count")?;
    let count = count as usize;
    let points: Vec<DVec3> = match ip as i64 {
        1 => {
            let (&z, coords) = rest.split_first().ok_or("missing common z")?;
            coords
                .chunks_exact(2)
                .take(count)
                .map(|c| DVec3::new(c[0], c[1], z))
                .collect()
        }
        2 => rest
            .chunks_exact(3)
            .take(count)
            .map(|c| DVec3::new(c[0], c[1], c[2]))
            .collect(),
        3 => rest
            .chunks_exact(6)
            .take(count)
            .map(|c| DVec3::new(c[0], c[1], c[2]))
            .collect(),
        other => return Err(format!("unsupported data type {other}")),
    };
    if points.len() < count {
        return Err(format!("expected {count} points, found {}", points.len()));
    }
    Ok(points)
}

/// Parse an IGES file and collect its copious-data polylines
pub(super) fn read(text: &str) -> IgesContents {
    let mut global = String::new();
    let mut entries: BTreeMap<usize, String> = BTreeMap::new();
    let mut has_directory = false;
    let mut sections = 0usize;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let Some(section) = line.chars().nth(RECORD_DATA) else {
            continue;
        };
        let data: String = line.chars().take(RECORD_DATA).collect();
        match section {
            'S' => sections |= 1,
            'G' => {
                sections |= 2;
                global.push_str(&data);
            }
            'D' => has_directory = true,
            'P' => {
                let body: String = data.chars().take(PARAMETER_DATA).collect();
                let pointer = data
                    .chars()
                    .skip(PARAMETER_DATA)
                    .collect::<String>()
                    .trim()
                    .parse::<usize>()
                    .unwrap_or(0);
                entries.entry(pointer).or_default().push_str(&body);
            }
            _ => {}
        }
    }

    if sections != 3 || !has_directory {
        return IgesContents {
            status: ReadStatus::Error,
            polylines: Vec::new(),
            messages: vec!["not an IGES file: missing start, global or directory section".into()],
        };
    }

    let (param_delim, record_delim) = delimiters(&global);
    let mut polylines = Vec::new();
    let mut messages = Vec::new();
    let mut skipped = 0usize;

    for (pointer, body) in &entries {
        let record = body.split(record_delim).next().unwrap_or_default();
        let mut fields = record.split(param_delim);
        let entity_type = fields.next().and_then(number).map(|v| v as i64);
        if entity_type != Some(COPIOUS_DATA) {
            skipped += 1;
            continue;
        }

        let values: Option<Vec<f64>> = fields
            .filter(|f| !f.trim().is_empty())
            .map(number)
            .collect();
        let Some(values) = values else {
            messages.push(format!("entity at DE {pointer}: malformed number"));
            continue;
        };
        match polyline(&values) {
            Ok(points) => polylines.push(points),
            Err(e) => messages.push(format!("entity at DE {pointer}: {e}")),
        }
    }
    if skipped > 0 {
        messages.push(format!("{skipped} unsupported entities skipped"));
    }

    IgesContents {
        status: status_for(entries.len()),
        polylines,
        messages,
    }
}
