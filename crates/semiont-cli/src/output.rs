use clap::ValueEnum;
use semiont_core::commands::{Progress, ProgressReporter};
use semiont_core::results::{CommandResults, ServiceResult};
use semiont_core::types::{Command, Platform};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Summary,
    Json,
    Yaml,
    Table,
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_yaml<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(value)?;
    print!("{}", yaml);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  ").trim_end());

    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

// ---------------------------------------------------------------------------
// Command results
// ---------------------------------------------------------------------------

pub fn render<D: Serialize>(results: &CommandResults<D>, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(results),
        OutputFormat::Yaml => print_yaml(results),
        OutputFormat::Table => {
            print_table(&["SERVICE", "PLATFORM", "STATUS", "DETAILS"], table_rows(results)?);
            println!();
            println!("{}", summary_line(results));
            Ok(())
        }
        OutputFormat::Summary => {
            for result in &results.results {
                println!("{}", status_line(result)?);
                for warning in &result.warnings {
                    println!("    warning: {warning}");
                }
            }
            if let Some(error) = &results.error {
                println!("error: {error}");
            }
            println!("{}", summary_line(results));
            Ok(())
        }
    }
}

fn status_line<D: Serialize>(result: &ServiceResult<D>) -> anyhow::Result<String> {
    let mut line = format!(
        "  {:<7} {} ({})",
        if result.success { "ok" } else { "FAILED" },
        result.entity,
        result.platform
    );
    if let Some(error) = &result.error {
        line.push_str(&format!(": {error}"));
    } else {
        let fields = detail_fields(result)?;
        if !fields.is_empty() {
            line.push_str(&format!("  {}", fields.join(" ")));
        }
    }
    Ok(line)
}

fn summary_line<D>(results: &CommandResults<D>) -> String {
    let s = &results.summary;
    let mut line = format!(
        "{} [{}]: {} succeeded, {} failed ({} total) in {}ms",
        results.command, results.environment, s.succeeded, s.failed, s.total, results.duration
    );
    if s.warnings > 0 {
        line.push_str(&format!(", {} with warnings", s.warnings));
    }
    if results.execution_context.dry_run {
        line.push_str(" [dry run]");
    }
    line
}

fn table_rows<D: Serialize>(results: &CommandResults<D>) -> anyhow::Result<Vec<Vec<String>>> {
    results
        .results
        .iter()
        .map(|r| {
            let details = match &r.error {
                Some(error) => error.clone(),
                None => detail_fields(r)?.join(" "),
            };
            Ok(vec![
                r.entity.clone(),
                r.platform.to_string(),
                if r.success { "ok" } else { "failed" }.to_string(),
                details,
            ])
        })
        .collect()
}

const ENVELOPE_KEYS: [&str; 7] = [
    "entity", "platform", "success", "timestamp", "error", "warnings", "metadata",
];

/// The operation-specific fields of a result as `key=value` pairs, in
/// declaration order. Nested values are rendered as compact JSON.
fn detail_fields<D: Serialize>(result: &ServiceResult<D>) -> anyhow::Result<Vec<String>> {
    let Value::Object(map) = serde_json::to_value(result)? else {
        return Ok(Vec::new());
    };
    Ok(map
        .iter()
        .filter(|(k, _)| !ENVELOPE_KEYS.contains(&k.as_str()))
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Per-service progress on stderr, so stdout stays clean for `--output json`.
pub struct StderrProgress {
    pub enabled: bool,
}

impl ProgressReporter for StderrProgress {
    fn service_started(&self, command: Command, service: &str, platform: Platform) {
        if self.enabled {
            eprintln!("{command} {service} ({platform})...");
        }
    }

    fn service_finished(&self, progress: Progress<'_>) {
        if !self.enabled {
            return;
        }
        match (progress.success, progress.error) {
            (true, _) => eprintln!("{} {}: done", progress.command, progress.entity),
            (false, Some(error)) => eprintln!("{} {}: {error}", progress.command, progress.entity),
            (false, None) => eprintln!("{} {}: failed", progress.command, progress.entity),
        }
    }
}
