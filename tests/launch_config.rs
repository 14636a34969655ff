//! Launch preparation against real directories.

use skein::config::cli::LaunchArgs;
use skein::config::schema::DbEngine;
use skein::config::{ConfigError, Network};
use skein::lifecycle::startup::prepare_launch;
use skein::LaunchError;

mod common;

#[test]
fn test_no_root_and_no_home_is_ambiguous() {
    let err = prepare_launch(LaunchArgs::default(), &|_| None).unwrap_err();
    assert!(matches!(err, ConfigError::AmbiguousFileSystem));
    assert!(LaunchError::from(err).is_usage_error());
}

#[test]
fn test_data_dir_outside_root_must_exist() {
    let root = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let missing = elsewhere.path().join("node");

    let args = LaunchArgs {
        data_dir: Some(missing.clone()),
        ..LaunchArgs::default()
    };
    let err = prepare_launch(args, &common::env_with_root(root.path())).unwrap_err();
    match &err {
        ConfigError::MissingPath { path } => assert_eq!(path, &missing),
        other => panic!("expected MissingPath, got {:?}", other),
    }
    assert!(err.to_string().contains("does not exist"));
    assert!(!missing.exists());
}

#[test]
fn test_existing_data_dir_outside_root_is_initialized() {
    let root = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();

    let args = LaunchArgs {
        network_id: 3,
        data_dir: Some(elsewhere.path().to_path_buf()),
        ..LaunchArgs::default()
    };
    let plan = prepare_launch(args, &common::env_with_root(root.path())).unwrap();
    assert_eq!(plan.config.network, Network::Ropsten);
    assert!(plan.config.database_dir().is_dir());
    assert!(plan.config.engine_marker_path().is_file());
}

#[test]
fn test_engine_switch_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let env = common::env_with_root(root.path());
    prepare_launch(LaunchArgs::default(), &env).unwrap();

    let args = LaunchArgs {
        db_engine: DbEngine::RocksDb,
        ..LaunchArgs::default()
    };
    let err = prepare_launch(args, &env).unwrap_err();
    match &err {
        ConfigError::EngineMismatch {
            configured,
            on_disk,
            ..
        } => {
            assert_eq!(*configured, DbEngine::RocksDb);
            assert_eq!(*on_disk, DbEngine::LevelDb);
        }
        other => panic!("expected EngineMismatch, got {:?}", other),
    }
    assert!(err.to_string().contains("leveldb"));
}

#[test]
fn test_stderr_level_set_twice_is_ambiguous() {
    let root = tempfile::tempdir().unwrap();
    let args = LaunchArgs {
        log_levels: vec!["debug".parse().unwrap()],
        stderr_log_level: Some("info".parse().unwrap()),
        ..LaunchArgs::default()
    };
    let err = prepare_launch(args, &common::env_with_root(root.path())).unwrap_err();
    assert!(matches!(err, ConfigError::AmbiguousLogging));
    assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
}
