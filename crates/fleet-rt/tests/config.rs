mod common;

use common::{init_logging, noop_executor, NoopExecutor};
use fleet_rt::{FleetConfig, FleetError, WorkerFleet};
use std::io::Write;

#[test]
fn test_load_config_from_file() {
    init_logging();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
numa_nodes = 2
monitor_interval_ms = 250

[[cores]]
core_id = 0
numa_node = 0
enable_simd = true

[[cores]]
core_id = 1
numa_node = 1

[recovery]
max_attempts = 5
"#
    )
    .unwrap();

    let config = FleetConfig::from_file(file.path()).unwrap();
    assert_eq!(config.cores.len(), 2);
    assert_eq!(config.numa_nodes, 2);
    assert!(config.cores[0].enable_simd);
    assert_eq!(config.cores[1].numa_node, 1);
    assert_eq!(config.recovery.max_attempts, 5);
    assert_eq!(config.overload_threshold, 0.8);

    let fleet = WorkerFleet::new(config, noop_executor as NoopExecutor).unwrap();
    assert_eq!(fleet.core_ids(), vec![0, 1]);
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.toml");
    match FleetConfig::from_file(&path) {
        Err(FleetError::Io { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected an io error, got {other:?}"),
    }
}

#[test]
fn test_malformed_toml_is_rejected() {
    assert!(matches!(
        FleetConfig::from_toml_str("cores = 3"),
        Err(FleetError::ConfigParse(_))
    ));
}

#[test]
fn test_numa_node_out_of_range_is_rejected() {
    let source = r#"
[[cores]]
core_id = 0
numa_node = 4
"#;
    assert!(matches!(
        FleetConfig::from_toml_str(source),
        Err(FleetError::Configuration {
            core_id: Some(0),
            ..
        })
    ));
}

#[test]
fn test_duplicate_core_fails_build() {
    let mut config = FleetConfig::with_cores(2);
    config.cores[1].core_id = 0;
    assert!(matches!(
        WorkerFleet::new(config, noop_executor as NoopExecutor),
        Err(FleetError::Configuration { .. })
    ));
}
