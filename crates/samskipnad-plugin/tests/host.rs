//! End-to-end tests driving real guest processes built from this package.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use samskipnad_plugin::{
    CapabilityGrants, CoreServices, EventBus, PluginConfig, PluginError, PluginHost, PluginState,
    Service, Value, ValueMap,
};

fn echo_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_echo-plugin"))
}

fn calculator_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_calculator-plugin"))
}

fn fault_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fault-plugin"))
}

fn host_with(max_plugins: usize, timeout_secs: u64) -> PluginHost {
    PluginHost::new(PluginConfig {
        max_plugins,
        plugin_timeout_secs: timeout_secs,
        ..Default::default()
    })
    .unwrap()
}

fn params(pairs: &[(&str, Value)]) -> ValueMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn fault(mode: &str) -> ValueMap {
    params(&[("mode", mode.into())])
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_round_trip() {
    let host = host_with(10, 10);
    host.load_plugin("echo", echo_bin()).await.unwrap();
    assert_eq!(host.get_loaded_plugins(), vec!["echo".to_string()]);

    let info = host.plugin_info("echo").unwrap();
    assert_eq!(info.state, PluginState::Ready);
    assert_eq!(info.guest_name, "echo");
    assert_eq!(info.guest_version, "1.0.0");
    assert!(info.pid.is_some());

    let reply = host
        .execute_plugin("echo", params(&[("message", "hi".into())]))
        .await
        .unwrap();
    assert_eq!(reply.get("echo").and_then(Value::as_str), Some("hi"));
    assert_eq!(reply.get("status").and_then(Value::as_str), Some("success"));
    assert_eq!(reply.get("params_count").and_then(Value::as_f64), Some(1.0));

    let reply = host.execute_plugin("echo", ValueMap::new()).await.unwrap();
    assert_eq!(
        reply.get("echo").and_then(Value::as_str),
        Some("Hello from Echo Plugin!")
    );

    host.unload_plugin("echo").await.unwrap();
    assert!(host.get_loaded_plugins().is_empty());
    assert!(host.plugin_info("echo").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_calculator_errors_keep_plugin_loaded() {
    let host = host_with(10, 10);
    host.load_plugin("calc", calculator_bin()).await.unwrap();

    let err = host
        .execute_plugin(
            "calc",
            params(&[
                ("operation", "divide".into()),
                ("a", 1.0.into()),
                ("b", 0.0.into()),
            ]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "execution error: plugin calc: division by zero");
    assert_eq!(host.plugin_info("calc").unwrap().state, PluginState::Ready);

    let reply = host
        .execute_plugin(
            "calc",
            params(&[
                ("operation", "multiply".into()),
                ("a", 6.0.into()),
                ("b", 7.0.into()),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(reply.get("result").and_then(Value::as_f64), Some(42.0));
    assert_eq!(
        reply.get("message").and_then(Value::as_str),
        Some("6.00 multiply 7.00 = 42.00")
    );

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_double_load_is_rejected() {
    let host = host_with(10, 10);
    host.load_plugin("echo", echo_bin()).await.unwrap();

    let err = host.load_plugin("echo", echo_bin()).await.unwrap_err();
    assert!(matches!(err, PluginError::AlreadyLoaded(ref n) if n == "echo"));

    // The original registration is untouched.
    assert!(host.execute_plugin("echo", ValueMap::new()).await.is_ok());
    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capacity_limit() {
    let host = host_with(2, 10);
    host.load_plugin("a", echo_bin()).await.unwrap();
    host.load_plugin("b", echo_bin()).await.unwrap();

    let err = host.load_plugin("c", echo_bin()).await.unwrap_err();
    assert!(matches!(err, PluginError::CapacityExceeded { max: 2 }));

    host.unload_plugin("a").await.unwrap();
    host.load_plugin("c", echo_bin()).await.unwrap();
    assert_eq!(host.get_loaded_plugins(), vec!["b", "c"]);
    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unload_then_reload() {
    let host = host_with(10, 10);
    host.load_plugin("echo", echo_bin()).await.unwrap();
    let first = host.plugin_info("echo").unwrap();
    host.unload_plugin("echo").await.unwrap();

    assert!(matches!(
        host.unload_plugin("echo").await,
        Err(PluginError::NotFound(_))
    ));
    assert!(matches!(
        host.execute_plugin("echo", ValueMap::new()).await,
        Err(PluginError::NotFound(_))
    ));

    host.load_plugin("echo", echo_bin()).await.unwrap();
    let second = host.plugin_info("echo").unwrap();
    assert_ne!(first.id, second.id);
    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_binary() {
    let host = host_with(10, 10);
    let err = host
        .load_plugin("nothing", "/no/such/plugin/binary")
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::BinaryMissing(_)));
    assert!(host.get_loaded_plugins().is_empty());
}

#[test]
fn test_guest_refuses_to_run_standalone() {
    let output = std::process::Command::new(echo_bin())
        .env_remove("SAMSKIPNAD_PLUGIN")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("must be launched by the plugin host"), "{stderr}");
}

// ── Fault isolation ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_hung_plugin_is_killed() {
    let host = host_with(10, 1);
    host.load_plugin("fault", fault_bin()).await.unwrap();
    host.load_plugin("echo", echo_bin()).await.unwrap();

    let err = host.execute_plugin("fault", fault("hang")).await.unwrap_err();
    assert!(matches!(
        err,
        PluginError::ExecutionTimeout { ref name, timeout_secs: 1 } if name == "fault"
    ));
    assert_eq!(host.get_loaded_plugins(), vec!["echo"]);
    assert!(matches!(
        host.execute_plugin("fault", fault("echo")).await,
        Err(PluginError::NotFound(_))
    ));

    // Other plugins are unaffected and the name is free again.
    assert!(host.execute_plugin("echo", ValueMap::new()).await.is_ok());
    host.load_plugin("fault", fault_bin()).await.unwrap();
    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crashing_plugin_is_unregistered() {
    let host = host_with(10, 10);
    host.load_plugin("fault", fault_bin()).await.unwrap();

    let err = host
        .execute_plugin("fault", params(&[("mode", "exit".into()), ("code", 7.0.into())]))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Execution(_)), "got {err}");
    assert!(host.get_loaded_plugins().is_empty());
    assert!(matches!(
        host.unload_plugin("fault").await,
        Err(PluginError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_guest_error_is_reported() {
    let host = host_with(10, 10);
    host.load_plugin("fault", fault_bin()).await.unwrap();

    let err = host
        .execute_plugin(
            "fault",
            params(&[("mode", "fail".into()), ("message", "bad input".into())]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "execution error: plugin fault: bad input");

    let reply = host
        .execute_plugin("fault", params(&[("mode", "echo".into()), ("x", 1.0.into())]))
        .await
        .unwrap();
    assert_eq!(reply.get("x").and_then(Value::as_f64), Some(1.0));
    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stubborn_plugin_is_killed_on_unload() {
    let host = host_with(10, 1);
    host.load_plugin("fault", fault_bin()).await.unwrap();
    host.execute_plugin("fault", fault("stubborn")).await.unwrap();

    let started = std::time::Instant::now();
    host.unload_plugin("fault").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(host.get_loaded_plugins().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_unloads_everything() {
    let host = host_with(10, 1);
    host.load_plugin("echo", echo_bin()).await.unwrap();
    host.load_plugin("calc", calculator_bin()).await.unwrap();
    host.load_plugin("fault", fault_bin()).await.unwrap();
    host.execute_plugin("fault", fault("stubborn")).await.unwrap();

    host.shutdown().await;
    assert!(host.get_loaded_plugins().is_empty());
    assert!(host.list_plugins().is_empty());

    let err = host.load_plugin("echo", echo_bin()).await.unwrap_err();
    assert!(matches!(err, PluginError::ShuttingDown));
}

// ── Capabilities ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_event_bus_capability() {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let host = PluginHost::builder(PluginConfig::default())
        .services(CoreServices::new().with(Service::EventBus, Arc::new(bus.clone())))
        .build()
        .unwrap();
    host.load_plugin("fault", fault_bin()).await.unwrap();

    let mut payload = ValueMap::new();
    payload.insert("item_id".into(), "42".into());
    let reply = host
        .execute_plugin(
            "fault",
            params(&[
                ("mode", "publish".into()),
                ("event", "item_created".into()),
                ("payload", Value::Map(payload.clone())),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(reply.get("delivered").and_then(Value::as_f64), Some(1.0));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.source, "fault");
    assert_eq!(event.name, "item_created");
    assert_eq!(event.payload, Value::Map(payload));
    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_grants_restrict_capabilities() {
    let host = PluginHost::builder(PluginConfig::default())
        .services(CoreServices::new().with(Service::EventBus, Arc::new(EventBus::default())))
        .build()
        .unwrap();
    host.load_plugin_with_grants(
        "limited",
        fault_bin(),
        CapabilityGrants::only([Service::UserProfile]),
    )
    .await
    .unwrap();
    host.load_plugin_with_grants("sealed", fault_bin(), CapabilityGrants::none())
        .await
        .unwrap();

    let reply = host
        .execute_plugin("limited", fault("capabilities"))
        .await
        .unwrap();
    assert_eq!(
        reply.get("granted"),
        Some(&Value::List(vec!["user_profile".into()]))
    );
    assert_eq!(
        host.plugin_info("limited").unwrap().services,
        vec![Service::UserProfile]
    );

    let err = host
        .execute_plugin("sealed", fault("publish"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("event_bus capability not granted"));
    host.shutdown().await;
}

// ── Concurrency ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_of_one_name() {
    let host = host_with(10, 10);
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..6 {
        let host = host.clone();
        tasks.spawn(async move { host.load_plugin("dup", echo_bin()).await });
    }

    let mut loaded = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(()) => loaded += 1,
            Err(PluginError::AlreadyLoaded(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(loaded, 1);
    assert_eq!(host.get_loaded_plugins(), vec!["dup"]);
    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executes_are_serialized() {
    let host = host_with(10, 10);
    host.load_plugin("fault", fault_bin()).await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..20 {
        let host = host.clone();
        tasks.spawn(async move {
            let call = params(&[
                ("mode", "sleep".into()),
                ("ms", 5.0.into()),
                ("i", (i as f64).into()),
            ]);
            let reply = host.execute_plugin("fault", call).await.unwrap();
            assert_eq!(reply.get("i").and_then(Value::as_f64), Some(i as f64));
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
    assert_eq!(host.plugin_info("fault").unwrap().state, PluginState::Ready);
    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unload_during_execute() {
    let host = host_with(10, 10);
    host.load_plugin("fault", fault_bin()).await.unwrap();

    let busy = {
        let host = host.clone();
        tokio::spawn(async move {
            host.execute_plugin("fault", params(&[("mode", "sleep".into()), ("ms", 300.0.into())]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    host.unload_plugin("fault").await.unwrap();
    assert!(busy.await.unwrap().is_ok());
    assert!(matches!(
        host.execute_plugin("fault", ValueMap::new()).await,
        Err(PluginError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_plugins_at_once() {
    let host = host_with(8, 10);
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let host = host.clone();
        tasks.spawn(async move {
            let name = format!("echo-{i}");
            host.load_plugin(&name, echo_bin()).await.unwrap();
            let reply = host
                .execute_plugin(&name, params(&[("message", name.as_str().into())]))
                .await
                .unwrap();
            assert_eq!(reply.get("echo").and_then(Value::as_str), Some(name.as_str()));
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
    assert_eq!(host.get_loaded_plugins().len(), 8);
    assert!(matches!(
        host.load_plugin("overflow", echo_bin()).await,
        Err(PluginError::CapacityExceeded { max: 8 })
    ));
    host.shutdown().await;
    assert!(host.get_loaded_plugins().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queued_execute_is_bounded_by_timeout() {
    let host = host_with(10, 1);
    host.load_plugin("fault", fault_bin()).await.unwrap();

    let hung = {
        let host = host.clone();
        tokio::spawn(async move { host.execute_plugin("fault", fault("hang")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let err = host.execute_plugin("fault", fault("echo")).await.unwrap_err();
    assert!(
        matches!(
            err,
            PluginError::ExecutionTimeout { .. } | PluginError::NotFound(_)
        ),
        "got {err}"
    );
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(
        hung.await.unwrap(),
        Err(PluginError::ExecutionTimeout { .. })
    ));
    assert!(host.get_loaded_plugins().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_execute_settles() {
    let host = host_with(10, 10);
    host.load_plugin("fault", fault_bin()).await.unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        host.execute_plugin("fault", params(&[("mode", "sleep".into()), ("ms", 500.0.into())])),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(host.plugin_info("fault").unwrap().state, PluginState::Ready);
    let reply = host
        .execute_plugin("fault", params(&[("mode", "echo".into()), ("x", 2.0.into())]))
        .await
        .unwrap();
    assert_eq!(reply.get("x").and_then(Value::as_f64), Some(2.0));
    assert!(matches!(
        host.load_plugin("fault", fault_bin()).await,
        Err(PluginError::AlreadyLoaded(_))
    ));

    host.shutdown().await;
    assert!(host.get_loaded_plugins().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_unload_still_completes() {
    let host = host_with(10, 1);
    host.load_plugin("fault", fault_bin()).await.unwrap();
    host.execute_plugin("fault", fault("stubborn")).await.unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(200), host.unload_plugin("fault")).await;
    assert!(abandoned.is_err());

    // Teardown keeps going without the caller: the name frees up and
    // shutdown does not wait on a stranded registration.
    let shutdown = tokio::time::timeout(Duration::from_secs(10), host.shutdown()).await;
    assert!(shutdown.is_ok(), "shutdown did not complete");
    assert!(host.get_loaded_plugins().is_empty());
    assert!(host.plugin_info("fault").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_unload_frees_name() {
    let host = host_with(10, 1);
    host.load_plugin("fault", fault_bin()).await.unwrap();
    host.execute_plugin("fault", fault("stubborn")).await.unwrap();

    let _ = tokio::time::timeout(Duration::from_millis(200), host.unload_plugin("fault")).await;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while host.plugin_info("fault").is_some() {
        assert!(std::time::Instant::now() < deadline, "unload never finished");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    host.load_plugin("fault", fault_bin()).await.unwrap();
    assert!(host.execute_plugin("fault", fault("echo")).await.is_ok());
    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_operations_on_shared_names() {
    const NAMES: [&str; 3] = ["alpha", "beta", "gamma"];
    let host = host_with(2, 10);

    let mut tasks = tokio::task::JoinSet::new();
    for worker in 0..12usize {
        let host = host.clone();
        tasks.spawn(async move {
            for step in 0..10usize {
                let name = NAMES[(worker + step) % NAMES.len()];
                let result = match (worker * 7 + step * 3) % 3 {
                    0 => host.load_plugin(name, fault_bin()).await,
                    1 => host
                        .execute_plugin(name, params(&[("mode", "sleep".into()), ("ms", 5.0.into())]))
                        .await
                        .map(|_| ()),
                    _ => host.unload_plugin(name).await,
                };
                match result {
                    Ok(())
                    | Err(PluginError::AlreadyLoaded(_))
                    | Err(PluginError::NotFound(_))
                    | Err(PluginError::CapacityExceeded { max: 2 }) => {}
                    Err(e) => panic!("unexpected error for {name}: {e}"),
                }
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    let loaded = host.get_loaded_plugins();
    let mut unique = loaded.clone();
    unique.dedup();
    assert_eq!(loaded, unique);
    assert!(loaded.len() <= 2);
    let listed: Vec<String> = host.list_plugins().into_iter().map(|p| p.name).collect();
    assert_eq!(loaded, listed);
    for name in &loaded {
        assert_eq!(host.plugin_info(name).unwrap().state, PluginState::Ready);
        assert!(host.execute_plugin(name, fault("echo")).await.is_ok());
    }

    host.shutdown().await;
    assert!(host.get_loaded_plugins().is_empty());
    assert!(host.list_plugins().is_empty());
}

// ── Misbehaving binaries ─────────────────────────────────────────────

#[cfg(unix)]
mod scripts {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str, mode: u32) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_garbage_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "noisy", "echo 'Starting plugin...'\nexec sleep 30", 0o755);

        let host = host_with(10, 10);
        let err = host.load_plugin("noisy", &path).await.unwrap_err();
        assert!(matches!(err, PluginError::Handshake(_)), "got {err}");
        assert!(host.get_loaded_plugins().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_protocol_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "old", "echo '1|2|tcp|127.0.0.1:9|json'\nexec sleep 30", 0o755);

        let host = host_with(10, 10);
        let err = host.load_plugin("old", &path).await.unwrap_err();
        assert!(err.to_string().contains("unsupported plugin protocol version 2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_guest_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "silent", "exec sleep 30", 0o755);

        let host = host_with(10, 1);
        let started = std::time::Instant::now();
        let err = host.load_plugin("silent", &path).await.unwrap_err();
        assert!(matches!(err, PluginError::Handshake(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(host.get_loaded_plugins().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_exiting_before_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "quitter", "exit 1", 0o755);

        let host = host_with(10, 10);
        let err = host.load_plugin("quitter", &path).await.unwrap_err();
        assert!(err.to_string().contains("before completing the handshake"), "got {err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "plain", "exit 0", 0o644);

        let host = host_with(10, 10);
        let err = host.load_plugin("plain", &path).await.unwrap_err();
        assert!(matches!(err, PluginError::BinaryMissing(_)));
    }
}
