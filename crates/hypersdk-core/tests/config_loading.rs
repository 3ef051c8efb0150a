//! Exercises `CoreConfig::load` against a real file on disk, including
//! the validation failure path for a config with an out-of-range value.

use std::io::Write;

use hypersdk_core::config::CoreConfig;

#[test]
fn loads_and_validates_a_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [job_manager]
        worker_count = 6
        queue_capacity = 128

        [pool]
        max_connections = 4
        "#
    )
    .unwrap();

    let cfg = CoreConfig::load(file.path().to_str().unwrap()).unwrap();
    assert_eq!(cfg.job_manager.worker_count, 6);
    assert_eq!(cfg.job_manager.queue_capacity, 128);
    assert_eq!(cfg.pool.max_connections, 4);
}

#[test]
fn rejects_a_file_with_zero_worker_count() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [job_manager]
        worker_count = 0
        "#
    )
    .unwrap();

    let result = CoreConfig::load(file.path().to_str().unwrap());
    assert!(result.is_err());
}

#[test]
fn missing_file_is_a_config_error_not_a_panic() {
    let result = CoreConfig::load("/nonexistent/path/to/core.toml");
    assert!(result.is_err());
}
