use std::time::Duration;

use semver::{Version, VersionReq};

use super::*;

const STACK: &str = r#"
[defaults]
health_timeout_secs = 30
max_attempts = 2

[[components]]
name = "node_exporter"
role = "exporter"
target_version = "1.9.1"
service = "node_exporter.service"
binary_path = "/usr/local/bin/node_exporter"
health_url = "http://127.0.0.1:9100/metrics"

[[components]]
name = "prometheus"
role = "metrics-collector"
target_version = "3.1.0"
service = "prometheus.service"
binary_path = "/usr/local/bin/prometheus"
config_paths = ["/etc/prometheus"]
service_unit_path = "/etc/systemd/system/prometheus.service"
artifact_dir = "/var/cache/stackup/prometheus/{version}"
health_url = "http://127.0.0.1:9090/-/ready"
health_timeout_secs = 120
version_source = { http = { url = "http://127.0.0.1:9090/api/v1/status/buildinfo", pointer = "/data/version" } }

[[components.incompatible]]
boundary = "3.0.0"
intermediate = "2.55.1"

[components.depends_on]
alertmanager = ">=0.25"

[components.checksums]
"3.1.0" = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
"#;

#[test]
fn parse_stack_config() {
    let config = StackConfig::from_toml_str(STACK).expect("config should parse");
    assert_eq!(config.components.len(), 2);
    assert_eq!(config.defaults.health_timeout_secs, 30);
    assert_eq!(config.defaults.max_attempts, 2);
    assert_eq!(config.defaults.required_consecutive_passes, 2);

    let prometheus = config.component("prometheus").expect("prometheus declared");
    assert_eq!(prometheus.role, ComponentRole::MetricsCollector);
    assert_eq!(prometheus.target_version, Version::new(3, 1, 0));
    assert_eq!(
        prometheus.incompatible,
        vec![IncompatibleBoundary {
            boundary: Version::new(3, 0, 0),
            intermediate: Version::new(2, 55, 1),
        }]
    );
    assert_eq!(
        prometheus.depends_on.get("alertmanager"),
        Some(&VersionReq::parse(">=0.25").expect("valid req"))
    );
    assert_eq!(
        prometheus.version_source(),
        VersionSource::Http {
            url: "http://127.0.0.1:9090/api/v1/status/buildinfo".to_string(),
            pointer: Some("/data/version".to_string()),
        }
    );
    assert_eq!(
        prometheus
            .artifact_dir_for(&Version::new(3, 1, 0))
            .expect("artifact dir declared")
            .display()
            .to_string(),
        "/var/cache/stackup/prometheus/3.1.0"
    );
    assert!(prometheus.expected_checksum(&Version::new(3, 1, 0)).is_some());
    assert!(prometheus.expected_checksum(&Version::new(2, 55, 1)).is_none());
}

#[test]
fn component_probe_settings_prefer_component_overrides() {
    let config = StackConfig::from_toml_str(STACK).expect("config should parse");

    let exporter = config.component("node_exporter").expect("declared");
    let settings = exporter.probe_settings(&config.defaults);
    assert_eq!(settings.timeout, Duration::from_secs(30));
    assert_eq!(settings.interval, Duration::from_millis(2000));
    assert_eq!(settings.required_consecutive, 2);

    let prometheus = config.component("prometheus").expect("declared");
    assert_eq!(
        prometheus.probe_settings(&config.defaults).timeout,
        Duration::from_secs(120)
    );
    assert_eq!(prometheus.max_attempts(&config.defaults), 2);
}

#[test]
fn default_version_source_runs_binary_with_version_flag() {
    let config = StackConfig::from_toml_str(STACK).expect("config should parse");
    let exporter = config.component("node_exporter").expect("declared");
    assert_eq!(
        exporter.version_source(),
        VersionSource::Command(vec![
            "/usr/local/bin/node_exporter".to_string(),
            "--version".to_string()
        ])
    );
}

#[test]
fn reject_duplicate_components() {
    let content = r#"
[[components]]
name = "grafana"
role = "visualization"
target_version = "11.0.0"
service = "grafana-server.service"
binary_path = "/usr/sbin/grafana-server"
health_url = "http://127.0.0.1:3000/api/health"

[[components]]
name = "grafana"
role = "visualization"
target_version = "11.1.0"
service = "grafana-server.service"
binary_path = "/usr/sbin/grafana-server"
health_url = "http://127.0.0.1:3000/api/health"
"#;
    let err = StackConfig::from_toml_str(content).expect_err("duplicate must fail");
    assert!(err.to_string().contains("duplicate component 'grafana'"));
}

#[test]
fn reject_intermediate_at_or_above_boundary() {
    let content = r#"
[[components]]
name = "prometheus"
role = "metrics-collector"
target_version = "3.1.0"
service = "prometheus.service"
binary_path = "/usr/local/bin/prometheus"
health_url = "http://127.0.0.1:9090/-/ready"

[[components.incompatible]]
boundary = "3.0.0"
intermediate = "3.0.0"
"#;
    let err = StackConfig::from_toml_str(content).expect_err("bad boundary must fail");
    assert!(err.to_string().contains("must be below boundary"));
}

#[test]
fn reject_single_pass_health_policy() {
    let content = r#"
[defaults]
required_consecutive_passes = 1
"#;
    let err = StackConfig::from_toml_str(content).expect_err("flapping guard must hold");
    assert!(err.to_string().contains("required_consecutive_passes"));
}

#[test]
fn reject_malformed_checksum() {
    let content = r#"
[[components]]
name = "loki"
role = "log-aggregator"
target_version = "3.3.0"
service = "loki.service"
binary_path = "/usr/local/bin/loki"
health_url = "http://127.0.0.1:3100/ready"

[components.checksums]
"3.3.0" = "abc"
"#;
    let err = StackConfig::from_toml_str(content).expect_err("short digest must fail");
    assert!(err.to_string().contains("not a sha256 hex digest"));
}

#[test]
fn upgrade_mode_parse_accepts_dry_run_spellings() {
    assert_eq!(UpgradeMode::parse("dry-run").expect("parse"), UpgradeMode::DryRun);
    assert_eq!(UpgradeMode::parse("dry_run").expect("parse"), UpgradeMode::DryRun);
    assert_eq!(UpgradeMode::parse("fast").expect("parse"), UpgradeMode::Fast);
    assert!(UpgradeMode::parse("reckless").is_err());
    assert!(!UpgradeMode::Fast.runs_corroboration_checks());
    assert!(UpgradeMode::Safe.confirms_between_phases());
}

#[test]
fn stage_transitions_follow_state_machine() {
    let mut upgrade = ComponentUpgrade::new("u1", "node_exporter", 0, Some("1.7.0".into()), "1.9.1");
    upgrade.enter(UpgradeStage::Validating, 10).expect("pending -> validating");
    assert_eq!(upgrade.status, ComponentStatus::Pending);
    assert_eq!(upgrade.started_at_unix, Some(10));

    let err = upgrade
        .enter(UpgradeStage::Installing, 11)
        .expect_err("validating cannot skip the backup");
    assert!(err.to_string().contains("validating -> installing"));

    upgrade.enter(UpgradeStage::BackingUp, 11).expect("backing up");
    assert_eq!(upgrade.status, ComponentStatus::Pending);
    upgrade.enter(UpgradeStage::Installing, 12).expect("installing");
    assert_eq!(upgrade.status, ComponentStatus::InProgress);
    assert_eq!(upgrade.started_at_unix, Some(10));
    upgrade.enter(UpgradeStage::Starting, 13).expect("starting");
    upgrade.enter(UpgradeStage::HealthChecking, 14).expect("health");
    upgrade.enter(UpgradeStage::RollingBack, 15).expect("rolling back");
    upgrade.mark_failed("health check failed", 16).expect("failed");

    assert_eq!(upgrade.status, ComponentStatus::Failed);
    assert_eq!(upgrade.finished_at_unix, Some(16));
    assert!(upgrade.is_terminal());
    assert!(upgrade.enter(UpgradeStage::Validating, 17).is_err());
}

#[test]
fn skipped_entries_are_terminal_and_unblock_dependents() {
    let mut upgrade = ComponentUpgrade::new("u1", "loki", 0, Some("3.3.0".into()), "3.3.0");
    upgrade.enter(UpgradeStage::Validating, 1).expect("validating");
    upgrade.mark_skipped("already at target", 2).expect("skip");
    assert_eq!(upgrade.stage, UpgradeStage::Completed);
    assert_eq!(upgrade.status, ComponentStatus::Skipped);
    assert!(upgrade.unblocks_dependents());
}

fn sample_run() -> UpgradeRun {
    let mut run = UpgradeRun::new("run-1", RunKind::Upgrade, UpgradeMode::Standard, 100);
    run.phases = vec!["exporters".to_string(), "metrics".to_string()];
    run.upgrades.push(ComponentUpgrade::new(
        "run-1-1",
        "node_exporter",
        0,
        Some("1.7.0".into()),
        "1.9.1",
    ));
    run.upgrades.push(ComponentUpgrade::new(
        "run-1-2",
        "prometheus",
        1,
        Some("2.45.0".into()),
        "2.55.1",
    ));
    run
}

#[test]
fn run_validate_accepts_consistent_run() {
    let run = sample_run();
    run.validate().expect("sample run is consistent");
    assert_eq!(run.phase_indices(1), vec![1]);
    assert_eq!(
        run.first_non_terminal().map(|upgrade| upgrade.id.as_str()),
        Some("run-1-1")
    );
}

#[test]
fn run_validate_rejects_mutating_stage_without_backup() {
    let mut run = sample_run();
    run.upgrades[0].stage = UpgradeStage::Installing;
    run.upgrades[0].status = ComponentStatus::InProgress;
    let err = run.validate().expect_err("install without backup is corrupt");
    assert!(err.to_string().contains("without a backup"));
}

#[test]
fn run_validate_rejects_in_progress_entry_without_backup() {
    let mut run = sample_run();
    run.upgrades[0].stage = UpgradeStage::BackingUp;
    run.upgrades[0].status = ComponentStatus::InProgress;
    let err = run
        .validate()
        .expect_err("in_progress without a restore point is corrupt");
    assert!(err.to_string().contains("without a backup"));
}

#[test]
fn run_validate_rejects_dangling_checkpoint() {
    let mut run = sample_run();
    run.checkpoints.push(Checkpoint {
        upgrade_id: "run-1-1".to_string(),
        backup_id: "missing".to_string(),
        stage: UpgradeStage::BackingUp,
        recorded_at_unix: 1,
    });
    let err = run.validate().expect_err("dangling checkpoint is corrupt");
    assert!(err.to_string().contains("unknown backup 'missing'"));
}

#[test]
fn run_validate_rejects_terminal_run_with_open_entries() {
    let mut run = sample_run();
    run.status = RunStatus::Completed;
    let err = run.validate().expect_err("open entries in a completed run");
    assert!(err.to_string().contains("still pending"));
}

#[test]
fn run_error_captures_kind_and_component() {
    let err = UpgradeError::HealthCheck {
        component: "prometheus".to_string(),
        signal: "503 Service Unavailable".to_string(),
    };
    let recorded = RunError::from_error(&err, Some("run-1-2"), 42);
    assert_eq!(recorded.kind, ErrorKind::HealthCheck);
    assert_eq!(recorded.component.as_deref(), Some("prometheus"));
    assert_eq!(recorded.upgrade_id.as_deref(), Some("run-1-2"));
    assert!(recorded.message.contains("503"));
    assert!(!err.is_escalation());
    assert!(UpgradeError::rollback("prometheus", "restore failed").is_escalation());
}
