//! Merges the per-client-group JSON result files of one definition run into
//! a single record.
//!
//! Counters are summed, fields named `*_time` are averaged over the records
//! that carried them, per-host statistic lists are merged entry by entry and
//! anything non-numeric is taken from the first record that has it.

use crate::error::ExpError;
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub type Record = Map<String, Value>;

/// Prefix of the files written by client groups.
pub const CLIENT_OUTPUT_PREFIX: &str = "output_app_";
/// Name of the file `aggregate_dir` writes.
pub const AGGREGATE_FILE: &str = "aggregate_output_app.json";

const TIME_SUFFIX: &str = "_time";

/// Aggregates the records stored in `files`. Fails on the first file that
/// cannot be read or parsed.
pub fn aggregate<P: AsRef<Path>>(files: &[P]) -> Result<Record, Report> {
    let mut records = Vec::with_capacity(files.len());
    for file in files {
        records.push(read_record(file.as_ref())?);
    }
    Ok(aggregate_records(records))
}

/// Parses a single result file.
pub fn read_record(path: &Path) -> Result<Record, Report> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read result file {}", path.display()))?;
    parse_record(path, &content)
}

fn parse_record(path: &Path, content: &str) -> Result<Record, Report> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| ExpError::MalformedResult {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let record = match value {
        Value::Object(record) => record,
        other => {
            return Err(ExpError::MalformedResult {
                path: path.to_path_buf(),
                reason: format!(
                    "top-level value should be an object, got {}",
                    kind(&other)
                ),
            }
            .into())
        }
    };
    // a client that ran writes at least one counter
    if !record.values().any(Value::is_number) {
        return Err(ExpError::MalformedResult {
            path: path.to_path_buf(),
            reason: "no numeric counter at the top level".to_string(),
        }
        .into());
    }
    Ok(record)
}

/// Aggregates already parsed records.
pub fn aggregate_records(records: Vec<Record>) -> Record {
    let mut output = Record::new();
    // number of records in which each time field showed up
    let mut time_counts: HashMap<String, usize> = HashMap::new();

    for record in records {
        for (key, value) in record {
            if is_time_field(&key) && value.is_number() {
                *time_counts.entry(key.clone()).or_default() += 1;
            }
            match output.get_mut(&key) {
                Some(current) => merge_value(current, value),
                None => {
                    output.insert(key, value);
                }
            }
        }
    }

    for (key, count) in time_counts {
        if count <= 1 {
            // a single sample is already its own mean
            continue;
        }
        if let Some(value) = output.get_mut(&key) {
            if let Some(total) = value.as_f64() {
                if let Some(mean) = Number::from_f64(total / count as f64) {
                    *value = Value::Number(mean);
                }
            }
        }
    }
    output
}

/// Aggregates every `output_app_*.json` file in `dir` and writes the result
/// to `aggregate_output_app.json`. Files that are missing, empty or
/// malformed are logged and skipped; `None` is returned if nothing could be
/// aggregated.
pub fn aggregate_dir(dir: impl AsRef<Path>) -> Result<Option<Record>, Report> {
    let dir = dir.as_ref();
    let files = client_output_files(dir)?;

    let mut records = Vec::with_capacity(files.len());
    for file in &files {
        match read_record(file) {
            Ok(record) => records.push(record),
            Err(e) => {
                let file = file.display();
                tracing::warn!("skipping result file {}: {:?}", file, e);
            }
        }
    }
    if records.is_empty() {
        tracing::warn!("no usable result files in {}", dir.display());
        return Ok(None);
    }
    tracing::info!(
        "aggregating {} of {} result file(s) in {}",
        records.len(),
        files.len(),
        dir.display()
    );

    let output = aggregate_records(records);
    let content = serde_json::to_string_pretty(&output)
        .wrap_err("serialize aggregate")?;
    let path = dir.join(AGGREGATE_FILE);
    std::fs::write(&path, content)
        .wrap_err_with(|| format!("write {}", path.display()))?;
    Ok(Some(output))
}

/// Lists the client output files in `dir`, sorted by name.
pub fn client_output_files(dir: &Path) -> Result<Vec<PathBuf>, Report> {
    let pattern = format!(
        "{}/{}*.json",
        glob::Pattern::escape(&dir.to_string_lossy()),
        CLIENT_OUTPUT_PREFIX
    );
    let entries = glob::glob(&pattern)
        .wrap_err_with(|| format!("bad result pattern {}", pattern))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.wrap_err("list result files")?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn is_time_field(key: &str) -> bool {
    key.ends_with(TIME_SUFFIX)
}

fn merge_value(current: &mut Value, other: Value) {
    match (current, other) {
        (Value::Number(a), Value::Number(b)) => {
            *a = add_numbers(a, &b);
        }
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in b {
                match a.get_mut(&key) {
                    Some(current) => merge_value(current, value),
                    None => {
                        a.insert(key, value);
                    }
                }
            }
        }
        // per-host statistic lists: merge entries at the same position
        (Value::Array(a), Value::Array(b))
            if is_stat_list(a) && is_stat_list(&b) =>
        {
            for (index, value) in b.into_iter().enumerate() {
                match a.get_mut(index) {
                    Some(current) => merge_value(current, value),
                    None => a.push(value),
                }
            }
        }
        // anything else keeps the first value seen
        _ => {}
    }
}

fn is_stat_list(values: &[Value]) -> bool {
    values.iter().all(Value::is_object)
}

fn add_numbers(a: &Number, b: &Number) -> Number {
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = a.checked_add(b) {
            return Number::from(sum);
        }
    }
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Number::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).unwrap_or_else(|| a.clone())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
