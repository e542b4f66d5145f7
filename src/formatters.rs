use anyhow::Result;
use chrono::SecondsFormat;
use prettytable::{Cell, Row, Table, format};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::campaign::{CampaignReport, Feature, FeatureReport, Outcome};
use crate::inventory::HardwareSnapshot;
use crate::models::OutputFormat;

/// A feature as `argus list` shows it
#[derive(Debug, Clone, Serialize)]
pub struct FeatureListing {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// `phase: step` in execution order
    pub steps: Vec<String>,
}

impl From<&Feature> for FeatureListing {
    fn from(feature: &Feature) -> Self {
        Self {
            name: feature.name().to_string(),
            labels: feature.labels().clone(),
            steps: feature
                .outline()
                .into_iter()
                .map(|(phase, step)| format!("{phase}: {step}"))
                .collect(),
        }
    }
}

pub trait ReportFormatter {
    fn format_report(&self, report: &CampaignReport) -> Result<String>;
    fn format_inventory(&self, snapshot: &HardwareSnapshot) -> Result<String>;
    fn format_features(&self, features: &[FeatureListing]) -> Result<String>;
}

pub struct TextFormatter;
pub struct TableFormatter;
pub struct JsonFormatter;
pub struct YamlFormatter;

impl ReportFormatter for JsonFormatter {
    fn format_report(&self, report: &CampaignReport) -> Result<String> {
        Ok(serde_json::to_string_pretty(report)?)
    }

    fn format_inventory(&self, snapshot: &HardwareSnapshot) -> Result<String> {
        Ok(serde_json::to_string_pretty(snapshot)?)
    }

    fn format_features(&self, features: &[FeatureListing]) -> Result<String> {
        Ok(serde_json::to_string_pretty(features)?)
    }
}

impl ReportFormatter for YamlFormatter {
    fn format_report(&self, report: &CampaignReport) -> Result<String> {
        Ok(serde_yaml::to_string(report)?)
    }

    fn format_inventory(&self, snapshot: &HardwareSnapshot) -> Result<String> {
        Ok(serde_yaml::to_string(snapshot)?)
    }

    fn format_features(&self, features: &[FeatureListing]) -> Result<String> {
        Ok(serde_yaml::to_string(features)?)
    }
}

fn labels_of(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn totals_line(report: &CampaignReport) -> String {
    format!(
        "{} feature(s): {} passed, {} failed, {} skipped, {} interrupted",
        report.features.len(),
        report.count(Outcome::Passed),
        report.count(Outcome::Failed),
        report.count(Outcome::Skipped),
        report.count(Outcome::Interrupted)
    )
}

impl ReportFormatter for TextFormatter {
    fn format_report(&self, report: &CampaignReport) -> Result<String> {
        let mut output = format!(
            "Campaign {} (started {})\n",
            report.name,
            report.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        for failure in &report.prerequisite_failures {
            output.push_str(&format!(
                "prerequisite {} failed [{}]: {}\n",
                failure.step, failure.kind, failure.message
            ));
        }
        for feature in &report.features {
            output.push_str(&feature.summary_line());
            output.push('\n');
            for failure in &feature.failures {
                output.push_str(&format!(
                    "    {} \"{}\" [{}]: {}\n",
                    failure.phase, failure.step, failure.kind, failure.message
                ));
            }
            for warning in &feature.warnings {
                output.push_str(&format!("    warning: {warning}\n"));
            }
        }
        for warning in &report.warnings {
            output.push_str(&format!("warning: {warning}\n"));
        }
        output.push_str(&totals_line(report));
        if report.interrupted {
            output.push_str(" (campaign interrupted)");
        }
        output.push('\n');
        Ok(output)
    }

    fn format_inventory(&self, snapshot: &HardwareSnapshot) -> Result<String> {
        let mut output = format!(
            "{} node(s) of {}\n",
            snapshot.node_count, snapshot.instance_type
        );
        for (resource, per_node) in &snapshot.per_node {
            output.push_str(&format!(
                "  {resource}: {per_node} per node, {} total\n",
                snapshot.total(resource)
            ));
        }
        Ok(output)
    }

    fn format_features(&self, features: &[FeatureListing]) -> Result<String> {
        let mut output = String::new();
        for feature in features {
            output.push_str(&format!("{}  [{}]\n", feature.name, labels_of(&feature.labels)));
            for step in &feature.steps {
                output.push_str(&format!("    {step}\n"));
            }
        }
        Ok(output)
    }
}

impl ReportFormatter for TableFormatter {
    fn format_report(&self, report: &CampaignReport) -> Result<String> {
        let mut output = format!("Campaign {}\n", report.name);
        output.push_str(&format!("{}\n", self.create_feature_table(&report.features)));

        if let Some(failures) = self.create_failure_table(report) {
            output.push_str("\nFailures:\n");
            output.push_str(&format!("{}\n", failures));
        }
        for warning in &report.warnings {
            output.push_str(&format!("warning: {warning}\n"));
        }
        output.push_str(&totals_line(report));
        output.push('\n');
        Ok(output)
    }

    fn format_inventory(&self, snapshot: &HardwareSnapshot) -> Result<String> {
        let resources: Vec<&String> = snapshot.per_node.keys().collect();
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);

        let mut titles = vec![Cell::new("Node").style_spec("Fb")];
        titles.extend(resources.iter().map(|r| Cell::new(r).style_spec("Fb")));
        table.set_titles(Row::new(titles));

        for node in &snapshot.nodes {
            let mut row = vec![Cell::new(&node.name)];
            row.extend(resources.iter().map(|r| {
                let count = node.capacity.get(*r).copied().unwrap_or(0);
                Cell::new(&count.to_string()).style_spec("r")
            }));
            table.add_row(Row::new(row));
        }

        let mut total = vec![Cell::new("TOTAL").style_spec("b")];
        total.extend(
            resources
                .iter()
                .map(|r| Cell::new(&snapshot.total(r).to_string()).style_spec("br")),
        );
        table.add_row(Row::new(total));

        Ok(format!("Instance type: {}\n{}\n", snapshot.instance_type, table))
    }

    fn format_features(&self, features: &[FeatureListing]) -> Result<String> {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.set_titles(Row::new(vec![
            Cell::new("Feature").style_spec("Fb"),
            Cell::new("Labels").style_spec("Fb"),
            Cell::new("Steps").style_spec("Fb"),
        ]));
        for feature in features {
            table.add_row(Row::new(vec![
                Cell::new(&feature.name),
                Cell::new(&labels_of(&feature.labels)),
                Cell::new(&feature.steps.join("\n")),
            ]));
        }
        Ok(format!("{}\n", table))
    }
}

impl TableFormatter {
    fn create_feature_table(&self, features: &[FeatureReport]) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.set_titles(Row::new(vec![
            Cell::new("Feature").style_spec("Fb"),
            Cell::new("Labels").style_spec("Fb"),
            Cell::new("Outcome").style_spec("Fb"),
            Cell::new("Duration").style_spec("Fb"),
        ]));
        for feature in features {
            let style = match feature.outcome {
                Outcome::Passed => "Fg",
                Outcome::Failed => "Fr",
                Outcome::Skipped | Outcome::Interrupted => "Fy",
            };
            table.add_row(Row::new(vec![
                Cell::new(&feature.name),
                Cell::new(&labels_of(&feature.labels)),
                Cell::new(feature.outcome.tag()).style_spec(style),
                Cell::new(&format!("{:.1}s", feature.duration.as_secs_f64())).style_spec("r"),
            ]));
        }
        table
    }

    fn create_failure_table(&self, report: &CampaignReport) -> Option<Table> {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.set_titles(Row::new(vec![
            Cell::new("Feature").style_spec("Fb"),
            Cell::new("Phase").style_spec("Fb"),
            Cell::new("Step").style_spec("Fb"),
            Cell::new("Kind").style_spec("Fb"),
            Cell::new("Message").style_spec("Fb"),
        ]));
        let prerequisites = report
            .prerequisite_failures
            .iter()
            .map(|f| ("(prerequisites)", f));
        let features = report
            .features
            .iter()
            .flat_map(|feature| feature.failures.iter().map(move |f| (feature.name.as_str(), f)));
        let mut rows = 0;
        for (owner, failure) in prerequisites.chain(features) {
            rows += 1;
            table.add_row(Row::new(vec![
                Cell::new(owner),
                Cell::new(&failure.phase.to_string()),
                Cell::new(&failure.step),
                Cell::new(&failure.kind).style_spec("Fr"),
                Cell::new(&failure.message),
            ]));
        }
        (rows > 0).then_some(table)
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn ReportFormatter> {
    match format {
        OutputFormat::Json => Box::new(JsonFormatter),
        OutputFormat::Yaml => Box::new(YamlFormatter),
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Text => Box::new(TextFormatter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{Phase, StepFailure};
    use crate::inventory::NodeCapacity;
    use chrono::TimeZone;
    use insta::assert_snapshot;
    use std::time::Duration;

    fn feature(name: &str, outcome: Outcome, secs: f64) -> FeatureReport {
        FeatureReport {
            name: name.to_string(),
            labels: BTreeMap::from([("suite".to_string(), "jobs".to_string())]),
            outcome,
            duration: Duration::from_secs_f64(secs),
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn report() -> CampaignReport {
        let mut failed = feature("job-echo", Outcome::Failed, 3.0);
        failed.failures.push(StepFailure {
            phase: Phase::Assess,
            step: "job succeeds".to_string(),
            kind: "cluster-terminal".to_string(),
            message: "Job default/job-echo failed: BackoffLimitExceeded".to_string(),
        });
        failed
            .warnings
            .push("collect logs: no pods found".to_string());
        CampaignReport {
            name: "argus-0a1b2c3d".to_string(),
            started_at: chrono::Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            prerequisite_failures: Vec::new(),
            features: vec![
                feature("cronjob-echo", Outcome::Passed, 1.3),
                failed,
                feature("job-pi", Outcome::Skipped, 0.0),
            ],
            warnings: vec!["Job default/job-pi was already gone".to_string()],
            interrupted: false,
        }
    }

    #[test]
    fn test_text_report() {
        assert_snapshot!(TextFormatter.format_report(&report()).unwrap(), @r#"
        Campaign argus-0a1b2c3d (started 2026-03-01T12:00:00Z)
        PASS  cronjob-echo  [suite=jobs]  1.3s
        FAIL  job-echo  [suite=jobs]  3.0s
            assess "job succeeds" [cluster-terminal]: Job default/job-echo failed: BackoffLimitExceeded
            warning: collect logs: no pods found
        SKIP  job-pi  [suite=jobs]  0.0s
        warning: Job default/job-pi was already gone
        3 feature(s): 1 passed, 1 failed, 1 skipped, 0 interrupted
        "#);
    }

    #[test]
    fn test_json_report_durations_in_seconds() {
        let json = JsonFormatter.format_report(&report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["features"][0]["duration"], 1.3);
        assert_eq!(value["features"][1]["outcome"], "failed");
        assert_eq!(value["features"][1]["failures"][0]["phase"], "assess");
    }

    #[test]
    fn test_table_report_lists_failures() {
        let table = TableFormatter.format_report(&report()).unwrap();
        assert!(table.contains("Failures:"));
        assert!(table.contains("BackoffLimitExceeded"));
        assert!(table.ends_with("3 feature(s): 1 passed, 1 failed, 1 skipped, 0 interrupted\n"));

        let mut clean = report();
        clean.features.truncate(1);
        assert!(!TableFormatter.format_report(&clean).unwrap().contains("Failures:"));
    }

    #[test]
    fn test_inventory_text_and_table() {
        let per_node = BTreeMap::from([
            ("aws.amazon.com/neuron".to_string(), 16),
            ("aws.amazon.com/neuroncore".to_string(), 32),
        ]);
        let snapshot = HardwareSnapshot {
            instance_type: "trn1.32xlarge".to_string(),
            node_count: 2,
            nodes: (0..2)
                .map(|i| NodeCapacity {
                    name: format!("ip-10-0-0-{i}"),
                    capacity: per_node.clone(),
                })
                .collect(),
            totals: per_node.iter().map(|(k, v)| (k.clone(), v * 2)).collect(),
            per_node,
        };
        assert_snapshot!(TextFormatter.format_inventory(&snapshot).unwrap(), @r"
        2 node(s) of trn1.32xlarge
          aws.amazon.com/neuron: 16 per node, 32 total
          aws.amazon.com/neuroncore: 32 per node, 64 total
        ");
        let table = TableFormatter.format_inventory(&snapshot).unwrap();
        assert!(table.starts_with("Instance type: trn1.32xlarge\n"));
        assert!(table.contains("ip-10-0-0-1"));
        assert!(table.contains("TOTAL"));
    }

    #[test]
    fn test_feature_listing() {
        let feature = Feature::new("job-pi")
            .label("suite", "jobs")
            .setup(crate::campaign::Step::new("create job", |ctx| async move { Ok(ctx) }))
            .assess(crate::campaign::Step::new("job succeeds", |ctx| async move { Ok(ctx) }));
        let listing = vec![FeatureListing::from(&feature)];
        assert_snapshot!(TextFormatter.format_features(&listing).unwrap(), @r"
        job-pi  [suite=jobs]
            setup: create job
            assess: job succeeds
        ");
    }
}
