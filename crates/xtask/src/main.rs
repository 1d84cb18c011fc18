use anyhow::{bail, Context as _, Result};
use plughost_core::api::MemoryHostApi;
use plughost_core::discovery::scan_bundles;
use plughost_core::environment::Environment;
use plughost_core::logging::init_logging;
use plughost_core::settings::{load_effective_settings, PluginSettings};
use plughost_core::watch::{BundleChange, BundleWatcher};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "gen-bundles" => cmd_gen_bundles(args.collect()),
        "smoke" => cmd_smoke(args.collect()),
        "watch" => cmd_watch(args.collect()),
        "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            print_help();
            bail!("unknown xtask command: {other}");
        }
    }
}

fn print_help() {
    eprintln!(
        r#"xtask (plughost)

Commands:
  gen-bundles  Generate plugin bundles wrapping a plugin binary
  smoke        Activate every bundle, drive hooks, report timings and shut down
  watch        Print bundle changes under a plugin directory as they happen

Examples:
  cargo build -p plughost-plugin
  cargo run -p xtask -- gen-bundles --path ./plugins --count 8 --plugin target/debug/plughost-demo-plugin --clean
  cargo run -p xtask -- smoke --path ./plugins --events 1000 --transport unix
  cargo run -p xtask -- watch --path ./plugins
"#
    );
}

struct GenBundlesArgs {
    path: PathBuf,
    count: usize,
    plugin: PathBuf,
    clean: bool,
}

fn cmd_gen_bundles(args: Vec<String>) -> Result<()> {
    let args = parse_gen_bundles_args(args)?;
    let plugin = args
        .plugin
        .canonicalize()
        .with_context(|| format!("plugin binary not found: {}", args.plugin.display()))?;

    if args.clean && args.path.exists() {
        fs::remove_dir_all(&args.path)
            .with_context(|| format!("remove_dir_all: {}", args.path.display()))?;
    }
    fs::create_dir_all(&args.path)
        .with_context(|| format!("create_dir_all: {}", args.path.display()))?;

    for ix in 0..args.count {
        let id = format!("com.example.demo{ix:03}");
        let dir = args.path.join(&id);
        fs::create_dir_all(&dir).with_context(|| format!("create_dir_all: {}", dir.display()))?;
        let executable = write_launcher(&dir, &plugin)?;

        let manifest = json!({
            "id": id,
            "name": format!("Demo plugin {ix}"),
            "version": "0.1.0",
            "server": { "executable": executable },
            "settings_schema": {
                "settings": [{ "key": "Greeting", "type": "text", "default": "hello" }]
            },
            "capabilities": ["lookup_user", "lookup_channel", "send_notification", "kv_store", "log"],
        });
        let manifest_path = dir.join("plugin.json");
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .with_context(|| format!("write: {}", manifest_path.display()))?;
    }

    eprintln!(
        "gen-bundles: done\n  path: {}\n  bundles: {}\n  plugin: {}",
        args.path.display(),
        args.count,
        plugin.display()
    );
    Ok(())
}

/// Executables must live inside the bundle, so unix bundles get a wrapper
/// script and other platforms a copy of the binary.
#[cfg(unix)]
fn write_launcher(dir: &Path, plugin: &Path) -> Result<String> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("run.sh");
    fs::write(&path, format!("#!/bin/sh\nexec '{}'\n", plugin.display()))
        .with_context(|| format!("write: {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod: {}", path.display()))?;
    Ok("run.sh".to_string())
}

#[cfg(not(unix))]
fn write_launcher(dir: &Path, plugin: &Path) -> Result<String> {
    let name = plugin
        .file_name()
        .context("plugin path has no file name")?
        .to_string_lossy()
        .to_string();
    fs::copy(plugin, dir.join(&name)).with_context(|| format!("copy plugin into {}", dir.display()))?;
    Ok(name)
}

fn parse_gen_bundles_args(args: Vec<String>) -> Result<GenBundlesArgs> {
    let mut path: Option<PathBuf> = None;
    let mut count: usize = 4;
    let mut plugin: Option<PathBuf> = None;
    let mut clean = false;

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--path" => path = Some(PathBuf::from(it.next().context("--path requires a value")?)),
            "--count" => count = it.next().context("--count requires a value")?.parse()?,
            "--plugin" => {
                plugin = Some(PathBuf::from(it.next().context("--plugin requires a value")?))
            }
            "--clean" => clean = true,
            other => bail!("unknown gen-bundles arg: {other}"),
        }
    }

    Ok(GenBundlesArgs {
        path: path.unwrap_or_else(|| PathBuf::from("plugins")),
        count,
        plugin: plugin.context("--plugin is required")?,
        clean,
    })
}

struct SmokeArgs {
    path: PathBuf,
    config_dir: Option<PathBuf>,
    events: usize,
    transport: Option<String>,
}

fn cmd_smoke(args: Vec<String>) -> Result<()> {
    let args = parse_smoke_args(args)?;

    let mut settings = match &args.config_dir {
        Some(dir) => {
            let cwd = std::env::current_dir().context("resolve current directory")?;
            let host = load_effective_settings(dir, Some(cwd.as_path()))?;
            init_logging(&host.log_level);
            host.plugin_settings
        }
        None => {
            init_logging("warn");
            PluginSettings::default()
        }
    };
    if let Some(transport) = &args.transport {
        settings.transport = transport.clone();
    }

    let api = Arc::new(MemoryHostApi::new());
    api.add_user("alice", json!({ "id": "u1", "username": "alice" }));
    let env = Environment::new(&args.path, settings.clone(), api);
    let scan = env.rescan();
    if !scan.skipped.is_empty() {
        for (dir, err) in &scan.skipped {
            eprintln!("smoke: skipped {}: {err}", dir.display());
        }
    }
    if scan.bundles.is_empty() {
        bail!("no plugin bundles under {}", args.path.display());
    }

    let mut activate_ms = Vec::new();
    let mut pids = Vec::new();
    for bundle in &scan.bundles {
        let started = Instant::now();
        env.activate(bundle.id())
            .with_context(|| format!("activate {}", bundle.id()))?;
        activate_ms.push(started.elapsed().as_millis());
        if let Some(supervisor) = env.supervisor(bundle.id()) {
            pids.push(supervisor.pid());
        }
    }

    let dispatcher = env.dispatcher().with_timeout(Duration::from_secs(30));
    let notify_start = Instant::now();
    for ix in 0..args.events {
        dispatcher.message_has_been_posted(json!({ "id": format!("p{ix}"), "message": "smoke" }))?;
    }
    let notify_ms = notify_start.elapsed().as_millis();

    let mut pipeline_ms = Vec::with_capacity(args.events.min(100));
    for ix in 0..args.events.min(100) {
        let started = Instant::now();
        let outcome =
            dispatcher.message_will_be_posted(json!({ "id": format!("w{ix}"), "message": "smoke" }));
        pipeline_ms.push(started.elapsed().as_millis());
        if let Some((plugin_id, err)) = outcome.errors.first() {
            bail!("pipeline failed in {plugin_id}: {err}");
        }
    }

    let broadcast_start = Instant::now();
    let report = env.broadcast_configuration(settings);
    let broadcast_ms = broadcast_start.elapsed().as_millis();
    for (plugin_id, err) in &report.failed {
        eprintln!("smoke: configuration change failed for {plugin_id}: {err}");
    }

    let health = env.check_health();
    let memory = current_process_memory_kb();

    let shutdown_start = Instant::now();
    env.shutdown();
    let shutdown_ms = shutdown_start.elapsed().as_millis();
    let survivors = surviving_processes(&pids);

    println!("plugins: {}", scan.bundles.len());
    println!(
        "activate_ms: p50={} p95={} max={}",
        percentile_ms(&activate_ms, 50.0),
        percentile_ms(&activate_ms, 95.0),
        activate_ms.iter().max().copied().unwrap_or(0)
    );
    println!("notify_ms: {notify_ms} ({} events)", args.events);
    println!(
        "pipeline_ms: p50={} p95={}",
        percentile_ms(&pipeline_ms, 50.0),
        percentile_ms(&pipeline_ms, 95.0)
    );
    println!(
        "broadcast_ms: {broadcast_ms} (delivered={}, failed={})",
        report.delivered.len(),
        report.failed.len()
    );
    println!(
        "health: healthy={} restarted={} suppressed={}",
        health.healthy.len(),
        health.restarted.len(),
        health.suppressed.len()
    );
    println!("shutdown_ms: {shutdown_ms}");
    if let Some((rss_kb, virt_kb)) = memory {
        println!("host_memory_kb: rss={rss_kb} virtual={virt_kb}");
    }

    if !survivors.is_empty() {
        bail!("plugin processes survived shutdown: {survivors:?}");
    }
    eprintln!("smoke: OK");
    Ok(())
}

fn parse_smoke_args(args: Vec<String>) -> Result<SmokeArgs> {
    let mut path: Option<PathBuf> = None;
    let mut config_dir: Option<PathBuf> = None;
    let mut events: usize = 200;
    let mut transport: Option<String> = None;

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--path" => path = Some(PathBuf::from(it.next().context("--path requires a value")?)),
            "--config-dir" => {
                config_dir = Some(PathBuf::from(
                    it.next().context("--config-dir requires a value")?,
                ))
            }
            "--events" => {
                let raw = it.next().context("--events requires a value")?;
                events = raw
                    .parse::<usize>()
                    .with_context(|| format!("invalid --events: {raw}"))?;
            }
            "--transport" => transport = Some(it.next().context("--transport requires a value")?),
            other => bail!("unknown smoke arg: {other}"),
        }
    }

    Ok(SmokeArgs {
        path: path.unwrap_or_else(|| PathBuf::from("plugins")),
        config_dir,
        events: events.max(1),
        transport,
    })
}

fn cmd_watch(args: Vec<String>) -> Result<()> {
    let mut path = PathBuf::from("plugins");
    let mut debounce_ms: u64 = 200;
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--path" => path = PathBuf::from(it.next().context("--path requires a value")?),
            "--debounce-ms" => {
                debounce_ms = it.next().context("--debounce-ms requires a value")?.parse()?
            }
            other => bail!("unknown watch arg: {other}"),
        }
    }
    init_logging("info");

    let watcher = BundleWatcher::new(&path)
        .with_context(|| format!("watch {}", path.display()))?;
    eprintln!("watch: {} (ctrl-c to stop)", watcher.root().display());
    loop {
        let changes = watcher.recv_batch(Duration::from_millis(debounce_ms), 1_024)?;
        if changes.is_empty() {
            continue;
        }
        for change in &changes {
            match change {
                BundleChange::Touched { dir } => println!("touched: {dir}"),
                BundleChange::RescanRequired => println!("rescan required"),
            }
        }
        let scan = scan_bundles(&path);
        println!(
            "bundles: {} valid, {} skipped: {}",
            scan.bundles.len(),
            scan.skipped.len(),
            scan.ids().join(", ")
        );
    }
}

fn percentile_ms(samples: &[u128], percentile: f64) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();

    let rank = ((percentile / 100.0) * ((sorted.len() - 1) as f64)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn surviving_processes(pids: &[u32]) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();
    pids.iter()
        .copied()
        .filter(|pid| system.process(Pid::from_u32(*pid)).is_some())
        .collect()
}

fn current_process_memory_kb() -> Option<(u64, u64)> {
    let mut system = System::new();
    system.refresh_processes();
    let pid = Pid::from_u32(std::process::id());
    let process = system.process(pid)?;
    Some((process.memory(), process.virtual_memory()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_picks_nearest_rank() {
        assert_eq!(percentile_ms(&[], 50.0), 0);
        assert_eq!(percentile_ms(&[5, 1, 3], 50.0), 3);
        assert_eq!(percentile_ms(&[5, 1, 3], 100.0), 5);
    }

    #[test]
    fn gen_bundles_requires_a_plugin() {
        let err = parse_gen_bundles_args(vec!["--count".into(), "2".into()])
            .err()
            .expect("missing --plugin");
        assert!(err.to_string().contains("--plugin"));
    }
}
