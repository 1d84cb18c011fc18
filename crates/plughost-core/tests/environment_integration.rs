#![cfg(unix)]

use plughost_core::api::MemoryHostApi;
use plughost_core::environment::{Environment, PluginStatus};
use plughost_core::error::PluginError;
use plughost_core::settings::PluginSettings;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

fn write_bundle(root: &Path, dir: &str, manifest: &str) {
    let path = root.join(dir);
    fs::create_dir_all(&path).expect("bundle dir");
    fs::write(path.join("plugin.json"), manifest).expect("manifest");
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
}

fn script_bundle(root: &Path, id: &str, body: &str) {
    write_bundle(
        root,
        id,
        &format!(r#"{{"id":"{id}","server":{{"executable":"run.sh"}}}}"#),
    );
    write_script(&root.join(id).join("run.sh"), body);
}

fn environment(root: &Path, start_timeout_ms: u64) -> Environment {
    let settings = PluginSettings {
        start_timeout_ms,
        ..PluginSettings::default()
    };
    Environment::new(root, settings, Arc::new(MemoryHostApi::new()))
}

fn process_exists(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes();
    system.process(Pid::from_u32(pid)).is_some()
}

#[test]
fn executable_outside_bundle_is_rejected_without_spawning() {
    let root = tempfile::tempdir().expect("tempdir");
    write_bundle(
        root.path(),
        "foo",
        r#"{"id":"foo","server":{"executable":"/foo/../../backend.exe"}}"#,
    );
    let env = environment(root.path(), 2_000);

    let err = env.activate("foo").unwrap_err();
    assert!(matches!(err, PluginError::PathValidation { .. }), "got {err:?}");
    assert!(env.supervisor("foo").is_none());
    assert!(!env.is_active("foo"));
}

#[test]
fn relative_escape_to_existing_file_never_runs_it() {
    let root = tempfile::tempdir().expect("tempdir");
    let marker = root.path().join("escaped");
    write_script(
        &root.path().join("outside.sh"),
        &format!("touch '{}'", marker.display()),
    );
    write_bundle(
        root.path(),
        "sneaky",
        r#"{"id":"com.example.sneaky","server":{"executable":"../outside.sh"}}"#,
    );
    let env = environment(root.path(), 2_000);

    let err = env.activate("com.example.sneaky").unwrap_err();
    assert!(matches!(err, PluginError::PathValidation { .. }), "got {err:?}");
    thread::sleep(Duration::from_millis(100));
    assert!(!marker.exists());
}

#[test]
fn missing_executable_fails_before_handshake() {
    let root = tempfile::tempdir().expect("tempdir");
    write_bundle(
        root.path(),
        "ghost",
        r#"{"id":"com.example.ghost","server":{"executable":"bin/missing"}}"#,
    );
    let env = environment(root.path(), 10_000);

    let started = Instant::now();
    let err = env.activate("com.example.ghost").unwrap_err();
    assert!(matches!(err, PluginError::PathValidation { .. }), "got {err:?}");
    assert!(err.to_string().contains("does not exist"), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    let status = &env.statuses()[0];
    assert_eq!(status.status, PluginStatus::FailedToStart);
    assert!(status.last_error.is_some());
}

#[test]
fn non_executable_file_is_rejected() {
    let root = tempfile::tempdir().expect("tempdir");
    write_bundle(
        root.path(),
        "plain",
        r#"{"id":"com.example.plain","server":{"executable":"run.sh"}}"#,
    );
    fs::write(root.path().join("plain").join("run.sh"), "#!/bin/sh\n").expect("script");
    fs::set_permissions(
        root.path().join("plain").join("run.sh"),
        fs::Permissions::from_mode(0o644),
    )
    .expect("chmod");
    let env = environment(root.path(), 2_000);

    let err = env.activate("com.example.plain").unwrap_err();
    assert!(matches!(err, PluginError::PathValidation { .. }), "got {err:?}");
}

#[test]
fn silent_plugin_times_out_and_is_not_left_running() {
    let root = tempfile::tempdir().expect("tempdir");
    script_bundle(root.path(), "com.example.silent", "echo $$ > pid\nexec sleep 60");
    let env = environment(root.path(), 400);

    let started = Instant::now();
    let err = env.activate("com.example.silent").unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, PluginError::HandshakeTimeout { .. }), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    assert!(env.supervisor("com.example.silent").is_none());

    let pid = fs::read_to_string(root.path().join("com.example.silent").join("pid"))
        .expect("pid file")
        .trim()
        .parse::<u32>()
        .expect("pid");
    assert!(!process_exists(pid), "plugin process {pid} is still running");
}

#[test]
fn malformed_handshake_fails_without_waiting_for_timeout() {
    let root = tempfile::tempdir().expect("tempdir");
    script_bundle(
        root.path(),
        "com.example.garbage",
        "echo 'definitely not a handshake'\nexec sleep 60",
    );
    let env = environment(root.path(), 10_000);

    let started = Instant::now();
    let err = env.activate("com.example.garbage").unwrap_err();
    assert!(matches!(err, PluginError::Handshake { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn unsupported_protocol_version_is_refused() {
    let root = tempfile::tempdir().expect("tempdir");
    script_bundle(
        root.path(),
        "com.example.future",
        "echo '99|tcp|127.0.0.1:9'\nexec sleep 60",
    );
    let env = environment(root.path(), 10_000);

    let err = env.activate("com.example.future").unwrap_err();
    assert!(
        matches!(&err, PluginError::Handshake { reason, .. } if reason.contains("unsupported protocol version 99")),
        "got {err:?}"
    );
}

#[test]
fn process_exiting_before_handshake_fails_activation() {
    let root = tempfile::tempdir().expect("tempdir");
    script_bundle(root.path(), "com.example.quitter", "echo bye >&2\nexit 3");
    let env = environment(root.path(), 10_000);

    let err = env.activate("com.example.quitter").unwrap_err();
    assert!(matches!(err, PluginError::Handshake { .. }), "got {err:?}");
    assert!(!env.is_active("com.example.quitter"));
}

#[test]
fn hanging_plugins_time_out_independently() {
    let root = tempfile::tempdir().expect("tempdir");
    script_bundle(root.path(), "com.example.one", "exec sleep 60");
    script_bundle(root.path(), "com.example.two", "exec sleep 60");
    let env = environment(root.path(), 1_000);

    let started = Instant::now();
    thread::scope(|scope| {
        let one = scope.spawn(|| env.activate("com.example.one"));
        let two = scope.spawn(|| env.activate("com.example.two"));
        assert!(matches!(
            one.join().expect("thread one"),
            Err(PluginError::HandshakeTimeout { .. })
        ));
        assert!(matches!(
            two.join().expect("thread two"),
            Err(PluginError::HandshakeTimeout { .. })
        ));
    });
    // Serialized activations would need two full timeouts.
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(1_900), "took {elapsed:?}");
}

#[test]
fn bad_bundles_do_not_hide_good_ones() {
    let root = tempfile::tempdir().expect("tempdir");
    write_bundle(root.path(), "b-good", r#"{"id":"com.example.good"}"#);
    write_bundle(root.path(), "a-empty", "");
    write_bundle(root.path(), "c-invalid-id", r#"{"id":"../etc"}"#);
    fs::create_dir_all(root.path().join("d-no-manifest")).expect("dir");
    let env = environment(root.path(), 1_000);

    let ids = env
        .available()
        .iter()
        .map(|b| b.id().to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["com.example.good"]);
    assert_eq!(env.rescan().skipped.len(), 3);
}
