#![cfg(unix)]

use std::fs;
use std::time::{Duration, Instant};

use serial_test::serial;
use tempfile::TempDir;
use unisync::cli::Cli;

mod util;
use util::{fake_tool, read_log};

struct Session {
    tmp: TempDir,
    ssh_log: std::path::PathBuf,
    unison_log: std::path::PathBuf,
}

/// Fake tools plus a config file; unison logs its arguments and then runs `unison_body`.
fn session(unison_body: &str, cached: &str) -> Session {
    let tmp = TempDir::new().unwrap();
    let bin = tmp.path().join("bin");
    let local = tmp.path().join("local");
    let cache = tmp.path().join("cache");
    for dir in [&bin, &local, &cache] {
        fs::create_dir_all(dir).unwrap();
    }
    fs::write(cache.join("paths"), cached).unwrap();

    let ssh_log = tmp.path().join("ssh.log");
    let unison_log = tmp.path().join("unison.log");
    let ssh = fake_tool(&bin, "ssh", &format!("echo \"$*\" >> {}", ssh_log.display()));
    let unison = fake_tool(
        &bin,
        "unison",
        &format!("echo \"$*\" >> {}\n{unison_body}", unison_log.display()),
    );

    fs::write(
        tmp.path().join("config.toml"),
        format!(
            r#"user = "alice"
hostname = "files.example.org"
local = "{local}"
remote = "r"

[Other]
cache_dir = "{cache}"
control_path = "{control}"

[Tools]
ssh = "{ssh}"
unison = "{unison}"
"#,
            local = local.display(),
            cache = cache.display(),
            control = tmp.path().join("cm_%C").display(),
            ssh = ssh.display(),
            unison = unison.display(),
        ),
    )
    .unwrap();

    Session {
        tmp,
        ssh_log,
        unison_log,
    }
}

fn cli(s: &Session) -> Cli {
    Cli {
        config: Some(s.tmp.path().join("config.toml")),
        ..Cli::default()
    }
}

#[tokio::test]
#[serial]
async fn cancel_during_data_sync_skips_links_and_closes() {
    let s = session("exec sleep 30", "a\n");

    let start = Instant::now();
    let err = unisync::run_until(cli(&s), tokio::time::sleep(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("interrupted"), "{err:#}");
    assert!(start.elapsed() < Duration::from_secs(10));

    let unison = read_log(&s.unison_log);
    assert_eq!(unison.len(), 1, "{unison:?}");
    assert!(unison[0].contains("ssh://alice@files.example.org/r/.data "));

    let ssh = read_log(&s.ssh_log);
    assert_eq!(ssh.len(), 2, "{ssh:?}");
    assert!(ssh[1].contains("-O exit alice@files.example.org -p 22"));
}

#[tokio::test]
#[serial]
async fn uncancelled_session_runs_both_syncs() {
    let s = session("exit 0", "a\n");

    let code = unisync::run_until(cli(&s), std::future::pending::<()>())
        .await
        .unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_log(&s.unison_log).len(), 2);
    assert_eq!(read_log(&s.ssh_log).len(), 2);
}
