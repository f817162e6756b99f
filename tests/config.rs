#![cfg(target_os = "linux")]

use std::fs;

use serial_test::serial;
use tempfile::TempDir;
use unisync::config::{Config, ConfigError, ConfigOverrides, expand_tilde, resolve_config_path};

mod util;
use util::EnvGuard;

#[test]
#[serial]
fn default_location_comes_from_xdg_config_home() {
    let tmp = TempDir::new().unwrap();
    let _xdg = EnvGuard::set("XDG_CONFIG_HOME", tmp.path());

    let err = resolve_config_path(None).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound(_)));

    let dir = tmp.path().join("unisync");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config.toml"), "").unwrap();
    assert_eq!(resolve_config_path(None).unwrap(), dir.join("config.toml"));

    // A missing explicit path falls back to the default file.
    let missing = tmp.path().join("missing.toml");
    assert_eq!(
        resolve_config_path(Some(&missing)).unwrap(),
        dir.join("config.toml")
    );
}

#[test]
#[serial]
fn home_relative_paths_are_expanded() {
    let tmp = TempDir::new().unwrap();
    let _home = EnvGuard::set("HOME", tmp.path());

    let config = tmp.path().join("config.toml");
    fs::write(
        &config,
        r#"user = "alice"
hostname = "files.example.org"
local = "~/files"
remote = "files"

[Other]
cache_dir = "~/state/unisync"
"#,
    )
    .unwrap();

    let loaded = Config::load(&config, &ConfigOverrides::default()).unwrap();
    assert_eq!(loaded.roots.local(), tmp.path().join("files"));
    assert_eq!(loaded.cache.dir, tmp.path().join("state/unisync"));
    assert_eq!(expand_tilde("~"), tmp.path());
    assert_eq!(expand_tilde("~bob/x"), std::path::PathBuf::from("~bob/x"));
}
