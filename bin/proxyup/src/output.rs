//! Human and JSON rendering of command results.

use anyhow::{Context, Result};
use comfy_table::{Table, presets::UTF8_FULL};
use proxyup_deploy::{ProxyRecord, Reconciliation, StatusReport};

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

pub fn print_record(record: &ProxyRecord) {
    let mut summary = Table::new();
    summary.load_preset(UTF8_FULL);
    summary.add_row(vec!["Module", record.logical_name.as_str()]);
    summary.add_row(vec!["Proxy".to_string(), record.proxy_address.to_string()]);
    summary.add_row(vec!["Admin".to_string(), record.admin_address.to_string()]);
    summary.add_row(vec![
        "Implementation".to_string(),
        record.current_implementation_address.to_string(),
    ]);
    summary.add_row(vec!["Version".to_string(), record.current_version.to_string()]);
    if let Some(pending) = &record.pending {
        summary.add_row(vec![
            "Pending".to_string(),
            format!("{} at {}", pending.version, pending.implementation_address),
        ]);
    }
    println!("{summary}");

    let mut history = Table::new();
    history.load_preset(UTF8_FULL);
    history.set_header(vec!["#", "Version", "Implementation", "Activation tx", "Activated at"]);
    for (index, entry) in record.history.iter().enumerate() {
        history.add_row(vec![
            (index + 1).to_string(),
            entry.version.to_string(),
            entry.implementation_address.to_string(),
            entry
                .activation_receipt_hash
                .map(|hash| hash.to_string())
                .unwrap_or_else(|| "(reconciled)".to_string()),
            format_timestamp(entry.activated_at),
        ]);
    }
    println!("{history}");
}

pub fn print_status(report: &StatusReport) {
    match &report.reconciliation {
        Some(Reconciliation::Unchanged) => println!("Registry matches the ledger."),
        Some(Reconciliation::PromotedPending { version }) => {
            println!("Registry repaired: pending version {version} is live.")
        }
        Some(Reconciliation::RestoredPrevious { version }) => {
            println!("Registry repaired: proxy was moved back to version {version}.")
        }
        None => println!("Offline: registry contents only, not checked against the ledger."),
    }
    print_record(&report.record);
}
