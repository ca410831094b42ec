//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::ProbeResult;
use crate::controller::{Outcome, ProvisionReport};
use crate::store::{ClusterRecord, Environment, RecordField};

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    // Calculate column widths
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    output.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    }

    output
}

fn status_cell(record: &ClusterRecord) -> String {
    if record.status.as_str().is_empty() {
        "-".to_string()
    } else {
        record.status.to_string()
    }
}

// ============================================================================
// Cluster records
// ============================================================================

pub fn format_record_list(records: &[ClusterRecord]) -> String {
    let headers = &["NAME", "ID", "PROVIDER", "REGION", "STATUS", "IN PROGRESS"];
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                r.cluster_name.clone(),
                r.id.clone(),
                r.cloud_provider.clone(),
                r.cloud_region.clone(),
                status_cell(r),
                r.in_progress.to_string(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

/// One record with its checkpoint markers
pub fn format_record_detail(record: &ClusterRecord) -> String {
    let mut output = String::new();

    output.push_str(&format!("Name:        {}\n", record.cluster_name));
    output.push_str(&format!("ID:          {}\n", record.id));
    output.push_str(&format!("Domain:      {}\n", record.domain_name));
    output.push_str(&format!(
        "Provider:    {} ({})\n",
        record.cloud_provider, record.cloud_region
    ));
    output.push_str(&format!(
        "Git:         {}/{}\n",
        record.git_provider, record.git_owner
    ));
    output.push_str(&format!("Status:      {}\n", status_cell(record)));
    output.push_str(&format!("In progress: {}\n", record.in_progress));
    output.push_str(&format!("Telemetry:   {}\n", record.use_telemetry));
    output.push_str(&format!(
        "Created:     {}\n",
        record.creation_timestamp.to_rfc3339()
    ));

    if let Some(details) = &record.state_store_details {
        output.push_str(&format!(
            "State store: {} ({})\n",
            details.name, details.hostname
        ));
    }
    if let Some(lease) = &record.lease {
        output.push_str(&format!(
            "Lease:       {} until {}\n",
            lease.holder,
            lease.expires_at.to_rfc3339()
        ));
    }

    output.push_str("\nCheckpoints:\n");
    for field in RecordField::ALL.iter().filter(|f| f.is_marker()) {
        let done = record.flag(*field).unwrap_or(false);
        output.push_str(&format!(
            "  [{}] {}\n",
            if done { "x" } else { " " },
            field.as_str()
        ));
    }

    output
}

// ============================================================================
// Environments
// ============================================================================

pub fn format_environment_list(environments: &[Environment]) -> String {
    let headers = &["NAME", "ID", "COLOR", "DESCRIPTION"];
    let rows: Vec<Vec<String>> = environments
        .iter()
        .map(|e| {
            vec![
                e.name.clone(),
                e.id.clone(),
                or_dash(&e.color),
                or_dash(&e.description),
            ]
        })
        .collect();

    format_table(headers, rows)
}

pub fn format_environment_detail(environment: &Environment) -> String {
    format!(
        "Name:        {}\nID:          {}\nColor:       {}\nDescription: {}\nCreated:     {}\n",
        environment.name,
        environment.id,
        or_dash(&environment.color),
        or_dash(&environment.description),
        environment.creation_timestamp.to_rfc3339()
    )
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

// ============================================================================
// Provisioning
// ============================================================================

pub fn format_report(report: &ProvisionReport) -> String {
    let headers = &["STAGE", "OUTCOME", "DURATION"];
    let rows: Vec<Vec<String>> = report
        .stages
        .iter()
        .map(|s| {
            vec![
                s.stage.to_string(),
                match s.outcome {
                    Outcome::Completed => "completed",
                    Outcome::Skipped => "skipped",
                }
                .to_string(),
                format!("{:.1}s", s.duration.as_secs_f64()),
            ]
        })
        .collect();

    let mut output = format_table(headers, rows);
    output.push_str(&format!(
        "\nCluster {} provisioned: {} stages completed, {} skipped in {:.1}s\n",
        report.cluster_name,
        report.completed(),
        report.skipped(),
        report.total_duration().as_secs_f64()
    ));
    output
}

// ============================================================================
// Provider capabilities
// ============================================================================

/// Single-column listing (domains, regions, instance types)
pub fn format_string_list(header: &str, items: &[String]) -> String {
    let rows: Vec<Vec<String>> = items.iter().map(|i| vec![i.clone()]).collect();
    format_table(&[header], rows)
}

pub fn format_probe_result(result: &ProbeResult) -> String {
    let mut output = format!(
        "Domain {} is {}\n",
        result.domain,
        if result.live { "live" } else { "not live" }
    );
    if let Some(serving) = result.apex_content {
        output.push_str(&format!(
            "Apex {} content\n",
            if serving { "already serves" } else { "does not serve" }
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterDefinition;
    use crate::controller::{StageId, StageOutcome};
    use std::time::Duration;

    fn record() -> ClusterRecord {
        let def = ClusterDefinition::from_str(
            r#"
cluster_name: mgmt
domain_name: example.com
admin_email: ops@example.com
git_provider: github
git_owner: acme
git_token: token
region: ewr
node_type: vc2-4c-8gb
provider:
  type: vultr
  api_key: key
"#,
        )
        .unwrap();
        ClusterRecord::new(&def)
    }

    #[test]
    fn test_format_table() {
        let headers = &["NAME", "AGE"];
        let rows = vec![
            vec!["Alice".to_string(), "30".to_string()],
            vec!["Bob".to_string(), "25".to_string()],
        ];

        let output = format_table(headers, rows);
        assert!(output.contains("NAME"));
        assert!(output.contains("Alice"));
        assert!(output.contains("Bob"));
    }

    #[test]
    fn test_format_table_empty() {
        let headers = &["NAME"];
        let rows: Vec<Vec<String>> = vec![];

        let output = format_table(headers, rows);
        assert!(output.contains("No resources found"));
    }

    #[test]
    fn test_format_record_list() {
        let r = record();
        let output = format_record_list(std::slice::from_ref(&r));
        assert!(output.contains("mgmt"));
        assert!(output.contains(&r.id));
        assert!(output.contains("vultr"));
        assert!(output.starts_with("NAME"));
    }

    #[test]
    fn test_format_record_detail_marks_checkpoints() {
        let mut r = record();
        r.install_tools_check = true;
        let output = format_record_detail(&r);
        assert!(output.contains("[x] install_tools_check"));
        assert!(output.contains("[ ] domain_liveness_check"));
        assert!(!output.contains("in_progress\n"));
        assert!(!output.contains("Lease:"));
    }

    #[test]
    fn test_format_report_summary() {
        let mut report = ProvisionReport::new("mgmt");
        report.stages.push(StageOutcome {
            stage: StageId::DownloadTools,
            outcome: Outcome::Skipped,
            duration: Duration::from_millis(5),
        });
        report.stages.push(StageOutcome {
            stage: StageId::CreateCluster,
            outcome: Outcome::Completed,
            duration: Duration::from_secs(90),
        });

        let output = format_report(&report);
        assert!(output.contains("download-tools"));
        assert!(output.contains("skipped"));
        assert!(output.contains("1 stages completed, 1 skipped"));
    }

    #[test]
    fn test_format_environments() {
        let env = Environment::new("staging", "yellow", "").unwrap();
        let list = format_environment_list(std::slice::from_ref(&env));
        assert!(list.starts_with("NAME"));
        assert!(list.contains("yellow"));

        let detail = format_environment_detail(&env);
        assert!(detail.contains(&env.id));
        assert!(detail.contains("Description: -\n"));
    }

    #[test]
    fn test_format_probe_result() {
        let output = format_probe_result(&ProbeResult {
            domain: "example.com".to_string(),
            live: false,
            apex_content: Some(true),
        });
        assert!(output.contains("not live"));
        assert!(output.contains("already serves"));
    }
}
