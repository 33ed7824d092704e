use std::path::Path;

use anyhow::{Context, Result};
use chatbridge_runtime::{
    load_audience_policy_for_state_dir, load_connection_snapshot, ConnectionSnapshot,
    CredentialStore, JsonModeStore, ModeStore,
};
use serde_json::{json, Value};

/// Everything `chatbridge status` reports about one state directory.
#[derive(Debug, Clone)]
pub(crate) struct StatusReport {
    pub snapshot: Option<ConnectionSnapshot>,
    pub credentials_present: bool,
    pub groups_ai_enabled: bool,
    pub individual_ai_enabled: bool,
    pub non_ai_contacts: usize,
}

pub(crate) async fn collect_status_report(state_dir: &Path) -> Result<StatusReport> {
    let snapshot = load_connection_snapshot(state_dir)?;
    let credentials_present = CredentialStore::for_state_dir(state_dir)
        .load()
        .context("failed to inspect stored credentials")?
        .is_some();
    let policy = load_audience_policy_for_state_dir(state_dir)?;
    let non_ai_contacts = JsonModeStore::for_state_dir(state_dir)
        .get_all_human_states()
        .await?
        .len();
    Ok(StatusReport {
        snapshot,
        credentials_present,
        groups_ai_enabled: policy.groups_ai_enabled,
        individual_ai_enabled: policy.individual_ai_enabled,
        non_ai_contacts,
    })
}

pub(crate) fn render_status_json(report: &StatusReport) -> Value {
    json!({
        "connection": report.snapshot,
        "credentials_present": report.credentials_present,
        "groups_ai_enabled": report.groups_ai_enabled,
        "individual_ai_enabled": report.individual_ai_enabled,
        "non_ai_contacts": report.non_ai_contacts,
    })
}

pub(crate) fn render_status_text(report: &StatusReport) -> String {
    let mut lines = Vec::new();
    match &report.snapshot {
        Some(snapshot) => {
            let status = &snapshot.status;
            lines.push(format!(
                "connection: state={} reconnect_counter={} updated_unix_ms={}",
                status.state.as_str(),
                status.reconnect_counter,
                snapshot.updated_unix_ms
            ));
            if let Some(identity) = &status.own_identity {
                lines.push(format!("own_identity: {identity}"));
            }
            if let Some(code) = status.last_close_code {
                lines.push(format!(
                    "last_close: code={} reason={}",
                    code,
                    status.last_close_reason.as_deref().unwrap_or("none")
                ));
            }
            if status.pairing_challenge.is_some() {
                lines.push("pairing: waiting for device link".to_string());
            }
        }
        None => lines.push("connection: never started".to_string()),
    }
    lines.push(format!(
        "credentials: {}",
        if report.credentials_present {
            "present"
        } else {
            "absent"
        }
    ));
    lines.push(format!(
        "audience: groups_ai_enabled={} individual_ai_enabled={}",
        report.groups_ai_enabled, report.individual_ai_enabled
    ));
    lines.push(format!("non_ai_contacts: {}", report.non_ai_contacts));
    lines.join("\n")
}

pub(crate) async fn execute_status_command(state_dir: &Path, json_output: bool) -> Result<()> {
    let report = collect_status_report(state_dir).await?;
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&render_status_json(&report))
                .context("failed to render status json")?
        );
    } else {
        println!("{}", render_status_text(&report));
    }
    Ok(())
}
