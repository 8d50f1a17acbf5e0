use std::cell::RefCell;
use std::collections::BTreeMap;

use semver::Version;
use stackup_core::{ErrorKind, RunFilter, StackConfig};

use super::*;

const STACK: &str = r#"
[[components]]
name = "prometheus"
role = "metrics-collector"
target_version = "3.1.0"
service = "prometheus.service"
binary_path = "/usr/local/bin/prometheus"
health_url = "http://127.0.0.1:9090/-/ready"

[[components.incompatible]]
boundary = "3.0.0"
intermediate = "2.55.1"

[[components]]
name = "promtail"
role = "log-shipper"
target_version = "3.3.0"
service = "promtail.service"
binary_path = "/usr/local/bin/promtail"
health_url = "http://127.0.0.1:9080/ready"

[[components]]
name = "loki"
role = "log-aggregator"
target_version = "3.3.0"
service = "loki.service"
binary_path = "/usr/local/bin/loki"
health_url = "http://127.0.0.1:3100/ready"

[[components]]
name = "node_exporter"
role = "exporter"
target_version = "1.9.1"
service = "node_exporter.service"
binary_path = "/usr/local/bin/node_exporter"
health_url = "http://127.0.0.1:9100/metrics"

[[components]]
name = "blackbox_exporter"
role = "exporter"
target_version = "0.25.0"
service = "blackbox_exporter.service"
binary_path = "/usr/local/bin/blackbox_exporter"
health_url = "http://127.0.0.1:9115/metrics"

[[components]]
name = "grafana"
role = "visualization"
target_version = "11.3.0"
service = "grafana-server.service"
binary_path = "/usr/sbin/grafana-server"
health_url = "http://127.0.0.1:3000/api/health"

[[components]]
name = "alertmanager"
role = "alert-router"
target_version = "0.27.0"
service = "alertmanager.service"
binary_path = "/usr/local/bin/alertmanager"
health_url = "http://127.0.0.1:9093/-/ready"

[components.depends_on]
prometheus = ">=2.50"
"#;

fn config() -> StackConfig {
    StackConfig::from_toml_str(STACK).expect("stack must parse")
}

fn installed(entries: &[(&str, &str)]) -> BTreeMap<String, InstalledVersion> {
    entries
        .iter()
        .map(|(name, version)| {
            (
                name.to_string(),
                InstalledVersion::Installed(Version::parse(version).expect("valid version")),
            )
        })
        .collect()
}

fn full_install() -> BTreeMap<String, InstalledVersion> {
    installed(&[
        ("node_exporter", "1.7.0"),
        ("blackbox_exporter", "0.24.0"),
        ("prometheus", "2.45.0"),
        ("loki", "3.2.0"),
        ("promtail", "3.2.0"),
        ("alertmanager", "0.26.0"),
        ("grafana", "11.1.0"),
    ])
}

#[test]
fn parse_reported_version_handles_component_output_shapes() {
    let cases = [
        (
            "node_exporter, version 1.7.0 (branch: HEAD, revision: 7333465a)",
            "1.7.0",
        ),
        ("prometheus, version 2.45.0 (branch: HEAD)\n  go version: go1.21.5", "2.45.0"),
        ("Version 11.1.0 (commit: 5b85c4c2fc, branch: HEAD)", "11.1.0"),
        ("v3.3.0", "3.3.0"),
        ("loki, version 3.2", "3.2.0"),
        ("3.0.0-rc.1", "3.0.0-rc.1"),
    ];
    for (raw, expected) in cases {
        assert_eq!(
            parse_reported_version(raw).map(|version| version.to_string()),
            Some(expected.to_string()),
            "input: {raw}"
        );
    }
}

#[test]
fn parse_reported_version_rejects_text_without_version() {
    assert_eq!(parse_reported_version("command not recognized"), None);
    assert_eq!(parse_reported_version("go1.21.5"), None);
    assert_eq!(parse_reported_version(""), None);
}

struct ScriptedReporter {
    answers: RefCell<Vec<anyhow::Result<VersionReport>>>,
    calls: RefCell<usize>,
}

impl ScriptedReporter {
    fn new(answers: Vec<anyhow::Result<VersionReport>>) -> Self {
        Self {
            answers: RefCell::new(answers),
            calls: RefCell::new(0),
        }
    }
}

impl VersionReporter for ScriptedReporter {
    fn report(&self, _component: &stackup_core::ComponentSpec) -> anyhow::Result<VersionReport> {
        *self.calls.borrow_mut() += 1;
        self.answers.borrow_mut().remove(0)
    }
}

#[test]
fn resolver_distinguishes_not_installed_from_unparsable() {
    let config = config();
    let loki = config.component("loki").expect("declared");
    let reporter = ScriptedReporter::new(vec![
        Ok(VersionReport::NotInstalled),
        Ok(VersionReport::Reported("garbage output".to_string())),
        Err(anyhow::anyhow!("connection reset")),
    ]);
    let resolver = VersionResolver::new(&reporter);

    let resolved = resolver.resolve(loki).expect("not installed is not an error");
    assert_eq!(resolved.installed, InstalledVersion::NotInstalled);
    assert!(!resolved.at_target());

    let err = resolver.resolve(loki).expect_err("unparsable is fatal");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("unparsable version string"));

    let err = resolver.resolve(loki).expect_err("query failure is surfaced");
    assert!(err.to_string().contains("connection reset"));
}

#[test]
fn resolver_queries_the_component_every_time() {
    let config = config();
    let loki = config.component("loki").expect("declared");
    let reporter = ScriptedReporter::new(vec![
        Ok(VersionReport::Reported("loki, version 3.2.0".to_string())),
        Ok(VersionReport::Reported("loki, version 3.3.0".to_string())),
    ]);
    let resolver = VersionResolver::new(&reporter);

    assert!(!resolver.resolve(loki).expect("resolves").at_target());
    assert!(resolver.resolve(loki).expect("resolves").at_target());
    assert_eq!(*reporter.calls.borrow(), 2);
}

#[test]
fn plan_orders_phases_by_blast_radius() {
    let plan = plan_upgrades(&config(), &full_install(), &RunFilter::default())
        .expect("plan must build");

    let names = plan
        .phases
        .iter()
        .map(|phase| phase.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["exporters", "metrics", "logs", "frontends"]);

    let order = plan
        .phases
        .iter()
        .flat_map(|phase| phase.steps.iter().map(|step| step.component.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        order,
        vec![
            "blackbox_exporter",
            "node_exporter",
            "prometheus",
            "prometheus",
            "loki",
            "promtail",
            "alertmanager",
            "grafana",
        ]
    );
}

#[test]
fn plan_splits_major_jump_across_incompatible_boundary() {
    let plan = plan_upgrades(&config(), &full_install(), &RunFilter::default())
        .expect("plan must build");
    let metrics = &plan.phases[1];
    assert_eq!(metrics.steps.len(), 2);

    let first = &metrics.steps[0];
    assert_eq!(first.from, Some(Version::new(2, 45, 0)));
    assert_eq!(first.to, Version::new(2, 55, 1));
    assert_eq!(first.step_label().as_deref(), Some("1/2"));
    assert_eq!(first.after, None);

    let second = &metrics.steps[1];
    assert_eq!(second.from, Some(Version::new(2, 55, 1)));
    assert_eq!(second.to, Version::new(3, 1, 0));
    assert_eq!(second.step_label().as_deref(), Some("2/2"));
    assert_eq!(second.after, Some(0));
}

#[test]
fn plan_does_not_split_from_intermediate_or_beyond_boundary() {
    let config = config();
    let prometheus = config.component("prometheus").expect("declared");

    let from_intermediate =
        split_at_boundaries(Some(&Version::new(2, 55, 1)), &Version::new(3, 1, 0), prometheus);
    assert_eq!(from_intermediate.len(), 1);

    let within_major =
        split_at_boundaries(Some(&Version::new(3, 0, 1)), &Version::new(3, 1, 0), prometheus);
    assert_eq!(within_major.len(), 1);

    let below_boundary =
        split_at_boundaries(Some(&Version::new(2, 40, 0)), &Version::new(2, 50, 0), prometheus);
    assert_eq!(below_boundary.len(), 1);

    let not_installed = split_at_boundaries(None, &Version::new(3, 1, 0), prometheus);
    assert_eq!(not_installed, vec![(None, Version::new(3, 1, 0))]);
}

#[test]
fn plan_chains_multiple_boundaries() {
    let content = r#"
[[components]]
name = "prometheus"
role = "metrics-collector"
target_version = "4.0.0"
service = "prometheus.service"
binary_path = "/usr/local/bin/prometheus"
health_url = "http://127.0.0.1:9090/-/ready"

[[components.incompatible]]
boundary = "4.0.0"
intermediate = "3.9.0"

[[components.incompatible]]
boundary = "3.0.0"
intermediate = "2.55.1"
"#;
    let config = StackConfig::from_toml_str(content).expect("stack must parse");
    let prometheus = config.component("prometheus").expect("declared");
    let hops = split_at_boundaries(Some(&Version::new(2, 1, 0)), &Version::new(4, 0, 0), prometheus);
    let targets = hops.iter().map(|(_, to)| to.to_string()).collect::<Vec<_>>();
    assert_eq!(targets, vec!["2.55.1", "3.9.0", "4.0.0"]);
}

#[test]
fn plan_log_shipper_follows_aggregator() {
    let plan = plan_upgrades(&config(), &full_install(), &RunFilter::default())
        .expect("plan must build");
    let logs = &plan.phases[2];
    assert_eq!(logs.steps[0].component, "loki");
    assert_eq!(logs.steps[1].component, "promtail");
    assert_eq!(logs.steps[1].after, Some(0));
}

#[test]
fn plan_keeps_not_installed_components_for_the_validating_gate() {
    let mut versions = full_install();
    versions.insert("grafana".to_string(), InstalledVersion::NotInstalled);
    let plan = plan_upgrades(&config(), &versions, &RunFilter::default())
        .expect("plan must build");
    let frontends = &plan.phases[3];
    let grafana = frontends
        .steps
        .iter()
        .find(|step| step.component == "grafana")
        .expect("grafana planned");
    assert_eq!(grafana.from, None);
}

#[test]
fn plan_respects_phase_and_component_filters() {
    let by_phase = plan_upgrades(
        &config(),
        &full_install(),
        &RunFilter {
            phase: Some("logs".to_string()),
            components: Vec::new(),
        },
    )
    .expect("plan must build");
    assert_eq!(by_phase.phases.len(), 1);
    assert_eq!(by_phase.phases[0].name, "logs");

    let by_index = plan_upgrades(
        &config(),
        &full_install(),
        &RunFilter {
            phase: Some("1".to_string()),
            components: vec!["node_exporter".to_string()],
        },
    )
    .expect("plan must build");
    assert_eq!(by_index.step_count(), 1);
    assert_eq!(by_index.phases[0].steps[0].component, "node_exporter");
}

#[test]
fn plan_rejects_unknown_filters() {
    let err = plan_upgrades(
        &config(),
        &full_install(),
        &RunFilter {
            phase: None,
            components: vec!["mimir".to_string()],
        },
    )
    .expect_err("unknown component must fail");
    assert!(err.to_string().contains("unknown component in filter: mimir"));

    assert!(parse_phase_selector("5").is_err());
    assert!(parse_phase_selector("storage").is_err());
    assert_eq!(parse_phase_selector("Metrics").expect("case-insensitive"), 1);
}

#[test]
fn unmet_dependencies_reports_version_and_absence() {
    let config = config();
    let alertmanager = config.component("alertmanager").expect("declared");

    assert!(unmet_dependencies(alertmanager, &installed(&[("prometheus", "3.1.0")])).is_empty());

    let too_old = unmet_dependencies(alertmanager, &installed(&[("prometheus", "2.45.0")]));
    assert_eq!(too_old, vec!["prometheus >=2.50 (installed 2.45.0)"]);

    let missing = unmet_dependencies(alertmanager, &BTreeMap::new());
    assert_eq!(missing, vec!["prometheus >=2.50 (not installed)"]);
}

#[test]
fn select_components_orders_by_role_then_name() {
    let config = config();
    let selected = select_components(
        &config,
        &RunFilter {
            phase: Some("frontends".to_string()),
            components: Vec::new(),
        },
    )
    .expect("selection must succeed");
    let names = selected
        .iter()
        .map(|component| component.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["alertmanager", "grafana"]);
}
