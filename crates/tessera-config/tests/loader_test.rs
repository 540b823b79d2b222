//! Loading settings from files in every supported format.

use std::io::Write;

use tempfile::NamedTempFile;
use tessera_config::{BackendSettings, ConfigError, StoreConfig};
use test_case::test_case;

fn write_config(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_toml_mysql_settings() {
    let config = StoreConfig::from_toml_str(
        r#"
        log_queries = true

        [backend]
        backend = "mysql"
        host = "db.internal"
        database = "app"
        charset = "utf8mb4"
        "#,
    )
    .unwrap();

    assert!(config.log_queries);
    match config.backend {
        BackendSettings::Mysql(settings) => {
            assert_eq!(settings.host, "db.internal");
            assert_eq!(settings.port, 3306);
            assert_eq!(settings.charset, "utf8mb4");
            assert_eq!(settings.collation, "utf8_unicode_ci");
        }
        other => panic!("unexpected backend: {other:?}"),
    }
}

#[test]
fn test_yaml_keyvalue_alias() {
    let config = StoreConfig::from_yaml_str(
        r#"
backend:
  backend: redis
  database: 3
"#,
    )
    .unwrap();

    match config.backend {
        BackendSettings::Keyvalue(settings) => {
            assert_eq!(settings.database, 3);
            assert_eq!(settings.port, 6379);
        }
        other => panic!("unexpected backend: {other:?}"),
    }
}

#[test]
fn test_missing_database_is_rejected() {
    let err = StoreConfig::from_json_str(r#"{"backend": {"backend": "postgresql"}}"#).unwrap_err();

    assert!(matches!(err, ConfigError::MissingField { .. }));
}

#[test_case(".toml", "[backend]\nbackend = \"sqlite\"\npath = \"app.db\"\n" ; "toml file")]
#[test_case(".yaml", "backend:\n  backend: sqlite\n  path: app.db\n" ; "yaml file")]
#[test_case(".json", r#"{"backend": {"backend": "sqlite", "path": "app.db"}}"# ; "json file")]
fn test_load_by_extension(suffix: &str, content: &str) {
    let file = write_config(suffix, content);

    let config = StoreConfig::load(file.path()).unwrap();

    match config.backend {
        BackendSettings::Sqlite(settings) => {
            assert_eq!(settings.path.to_str(), Some("app.db"));
            assert!(settings.foreign_keys);
        }
        other => panic!("unexpected backend: {other:?}"),
    }
}

#[test]
fn test_unknown_extension() {
    let file = write_config(".ini", "backend=sqlite");

    let err = StoreConfig::load(file.path()).unwrap_err();

    assert!(matches!(err, ConfigError::UnsupportedFormat(ext) if ext == "ini"));
}
