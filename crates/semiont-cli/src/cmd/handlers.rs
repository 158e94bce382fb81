use crate::output::{print_json, print_table, print_yaml, OutputFormat};
use anyhow::Context;
use semiont_core::platforms::Platforms;
use semiont_core::registry::HandlerRegistry;
use semiont_core::types::Platform;
use serde::Serialize;

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct HandlerRow {
    platform: Platform,
    operation: String,
    requires_discovery: bool,
}

/// Print the registered handlers, optionally for one platform only.
pub fn run(platform: Option<Platform>, output: OutputFormat) -> anyhow::Result<bool> {
    let platforms = Platforms::system().context("failed to build platform strategies")?;
    let rows = collect(platforms.registry(), platform);

    match output {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Yaml => print_yaml(&rows)?,
        OutputFormat::Summary | OutputFormat::Table => {
            if rows.is_empty() {
                println!("No handlers registered.");
                return Ok(true);
            }
            let table = rows
                .iter()
                .map(|r| {
                    vec![
                        r.platform.to_string(),
                        r.operation.clone(),
                        if r.requires_discovery { "yes" } else { "" }.to_string(),
                    ]
                })
                .collect();
            print_table(&["PLATFORM", "OPERATION", "DISCOVERY"], table);
        }
    }
    Ok(true)
}

fn collect(registry: &HandlerRegistry, only: Option<Platform>) -> Vec<HandlerRow> {
    let platforms = match only {
        Some(p) => vec![p],
        None => registry.platforms(),
    };
    let mut rows: Vec<HandlerRow> = platforms
        .into_iter()
        .flat_map(|p| {
            registry.descriptors(p).map(move |d| HandlerRow {
                platform: p,
                operation: d.key().to_string(),
                requires_discovery: d.requires_discovery,
            })
        })
        .collect();
    rows.sort_by(|a, b| (a.platform, &a.operation).cmp(&(b.platform, &b.operation)));
    rows
}
