//! Demo plugin driven by `PLUGHOST_DEMO_*` environment variables. Integration
//! tests and `xtask smoke` use it to exercise every host path.

use plughost_core::handshake::TransportKind;
use plughost_core::hooks::{Hook, PostDecision};
use plughost_core::logging::init_stderr_logging;
use plughost_plugin::{serve_with, HookTable, PluginApi, ServeOptions};
use serde_json::{json, Value};
use std::io::Write;
use std::thread;
use std::time::Duration;

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Appends `item` to the JSON array stored under `key`.
fn append(api: &PluginApi, key: &str, item: Value) -> Result<Value, String> {
    let mut items = match api.kv_get(key).map_err(|e| e.to_string())? {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    items.push(item);
    api.kv_set(key, Value::Array(items))
        .map_err(|e| e.to_string())?;
    Ok(Value::Null)
}

fn build_table() -> HookTable {
    let fail_activate = env_flag("PLUGHOST_DEMO_FAIL_ACTIVATE");
    let fail_config = env_flag("PLUGHOST_DEMO_FAIL_CONFIG");
    let tag = env_string("PLUGHOST_DEMO_TAG");
    let reject_word = env_string("PLUGHOST_DEMO_REJECT_WORD");
    let crash_after_ms = env_string("PLUGHOST_DEMO_CRASH_AFTER_MS").and_then(|v| v.parse::<u64>().ok());

    let mut table = HookTable::new()
        .on(Hook::OnActivate, move |api, _| {
            if fail_activate {
                return Err("activation refused by demo plugin".to_string());
            }
            if let Some(delay) = crash_after_ms {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(delay));
                    std::process::exit(17);
                });
            }
            let _ = api.log("info", "demo plugin activated");
            Ok(Value::Null)
        })
        .on(Hook::OnDeactivate, |api, _| {
            let _ = api.log("info", "demo plugin deactivating");
            Ok(Value::Null)
        })
        .on(Hook::OnConfigurationChange, move |api, _| {
            let config = api.load_configuration().map_err(|e| e.to_string())?;
            api.kv_set("config", Value::Object(config))
                .map_err(|e| e.to_string())?;
            if fail_config {
                return Err("configuration rejected by demo plugin".to_string());
            }
            Ok(Value::Null)
        })
        .on(Hook::ExecuteCommand, |api, args| {
            let command = args.first().cloned().unwrap_or(Value::Null);
            let name = command["command"].as_str().unwrap_or_default();
            match name {
                "/whoami" => {
                    let username = command["username"].as_str().unwrap_or_default();
                    let user = api.get_user_by_username(username).map_err(|e| e.to_string())?;
                    Ok(json!({ "text": format!("you are {}", user["id"].as_str().unwrap_or("?")) }))
                }
                "/announce" => {
                    let channel = api
                        .get_channel_by_name(
                            command["team"].as_str().unwrap_or_default(),
                            command["channel"].as_str().unwrap_or_default(),
                        )
                        .map_err(|e| e.to_string())?;
                    let channel_id = channel["id"].as_str().unwrap_or_default();
                    api.send_notification(channel_id, "announcement")
                        .map_err(|e| e.to_string())
                }
                "/config" => api
                    .load_configuration()
                    .map(Value::Object)
                    .map_err(|e| e.to_string()),
                "/sleep" => {
                    let ms = command["ms"].as_u64().unwrap_or(0);
                    thread::sleep(Duration::from_millis(ms));
                    Ok(json!({ "text": format!("slept {ms}ms") }))
                }
                other => Err(format!("unknown command: {other}")),
            }
        })
        .on(Hook::MessageWillBePosted, move |_, args| {
            let post = args.into_iter().next().unwrap_or(Value::Null);
            Ok(review_post(post, tag.as_deref(), reject_word.as_deref()).to_value())
        })
        .on(Hook::MessageHasBeenPosted, |api, args| {
            let id = args.first().map(|post| post["id"].clone()).unwrap_or(Value::Null);
            append(api, "posted", id)
        })
        .on(Hook::UserHasLoggedIn, |api, args| {
            let user = args.first().map(|u| u["id"].clone()).unwrap_or(Value::Null);
            append(api, "logins", user)
        });

    if let Some(only) = env_string("PLUGHOST_DEMO_HOOKS") {
        let keep = only
            .split(',')
            .filter_map(Hook::from_tag)
            .collect::<Vec<_>>();
        table = table.retain(|hook| keep.contains(&hook));
    }
    table
}

fn review_post(post: Value, tag: Option<&str>, reject_word: Option<&str>) -> PostDecision {
    let message = post["message"].as_str().unwrap_or_default().to_string();
    if let Some(word) = reject_word {
        if message.contains(word) {
            return PostDecision::reject(format!("message contains '{word}'"));
        }
    }
    match tag {
        Some(tag) if post.is_object() => {
            let mut post = post;
            post["message"] = json!(format!("{message} {tag}"));
            PostDecision::replace(post)
        }
        _ => PostDecision::keep(),
    }
}

fn main() {
    init_stderr_logging("info");

    match env_string("PLUGHOST_DEMO_MODE").as_deref() {
        Some("hang") => loop {
            thread::sleep(Duration::from_secs(60));
        },
        Some("exit") => std::process::exit(3),
        Some("garbage") => {
            let mut stdout = std::io::stdout();
            let _ = writeln!(stdout, "hello from a confused plugin");
            let _ = stdout.flush();
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
        _ => {}
    }

    let options = ServeOptions {
        protocol_version: env_string("PLUGHOST_DEMO_PROTOCOL").and_then(|v| v.parse().ok()),
        transport: env_string("PLUGHOST_DEMO_TRANSPORT").and_then(|v| TransportKind::from_tag(&v)),
    };

    if let Err(err) = serve_with(build_table(), options) {
        eprintln!("plughost-demo-plugin: {err}");
        std::process::exit(1);
    }
}
