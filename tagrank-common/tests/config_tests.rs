//! Configuration resolution tests
//!
//! Tests that touch TAGRANK_CONFIG or TAGRANK_DATABASE are marked #[serial]
//! so environment changes never race.

use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use tagrank_common::config::{TomlConfig, CONFIG_ENV_VAR, DATABASE_ENV_VAR};
use tagrank_common::Error;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_cli_path_wins_over_environment() {
    let env_file = write_config("[classifier]\nprimary_relationship_cap = 5\n");
    let cli_file = write_config("[classifier]\nprimary_relationship_cap = 2\n");
    env::set_var(CONFIG_ENV_VAR, env_file.path());

    let config = TomlConfig::resolve(Some(cli_file.path())).unwrap();
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.classifier.primary_relationship_cap, 2);
}

#[test]
#[serial]
fn test_environment_path_is_used_without_cli() {
    let env_file = write_config("[batch]\nbatch_size = 250\n");
    env::set_var(CONFIG_ENV_VAR, env_file.path());

    let config = TomlConfig::resolve(None).unwrap();
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.batch.batch_size, 250);
    assert_eq!(config.batch.max_error_rate, 0.05);
}

#[test]
#[serial]
fn test_explicit_missing_file_is_an_error() {
    let result = TomlConfig::resolve(Some(Path::new("/nonexistent/tagrank/config.toml")));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_invalid_toml_is_rejected() {
    let file = write_config("[ranking\nengagement_weight = ");
    assert!(matches!(TomlConfig::load(file.path()), Err(Error::Config(_))));
}

#[test]
fn test_negative_weight_fails_validation() {
    let err = TomlConfig::from_toml_str("[ranking]\ncomment_weight = -0.5\n").unwrap_err();
    assert!(err.to_string().contains("ranking weights"));
}

#[test]
#[serial]
fn test_database_path_priority() {
    let config = TomlConfig::from_toml_str("database_path = \"/srv/tagrank/from_file.db\"\n").unwrap();

    env::set_var(DATABASE_ENV_VAR, "/tmp/from_env.db");
    assert_eq!(
        config.resolve_database_path(Some(Path::new("/tmp/from_cli.db"))),
        PathBuf::from("/tmp/from_cli.db")
    );
    assert_eq!(config.resolve_database_path(None), PathBuf::from("/tmp/from_env.db"));

    env::remove_var(DATABASE_ENV_VAR);
    assert_eq!(
        config.resolve_database_path(None),
        PathBuf::from("/srv/tagrank/from_file.db")
    );

    let defaults = TomlConfig::default();
    assert!(defaults
        .resolve_database_path(None)
        .ends_with("tagrank.db"));
}
