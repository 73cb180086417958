//! End-to-end tests for the bridge service against stand-in executables.
//!
//! `sh` plays the part of `dotnet` for command execution; catalog queries use
//! a small script that records each invocation.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use dotnet_bridge::config::ResolvedConfig;
use dotnet_bridge::error_taxonomy::{CANCELLED_EXIT_CODE, CommandResponse, ErrorCategory};
use dotnet_bridge::guard::OperationKind;
use dotnet_bridge::process::{NOT_FOUND_EXIT_CODE, TRUNCATION_MARKER};
use dotnet_bridge::serve;
use dotnet_bridge::service::{BridgeService, OperationRequest};

fn shell_service() -> BridgeService {
    BridgeService::new(ResolvedConfig {
        dotnet_path: "sh".to_string(),
        stop_grace_period: Duration::from_secs(2),
        ..ResolvedConfig::default()
    })
}

fn script(kind: OperationKind, body: &str) -> OperationRequest {
    OperationRequest::new(kind, ["-c", body])
}

/// Write a fake `dotnet` that appends its first argument to `calls.log`.
fn fake_dotnet(dir: &Path) -> (PathBuf, PathBuf) {
    let calls = dir.join("calls.log");
    let path = dir.join("dotnet");
    let body = format!(
        "#!/bin/sh\n\
         echo \"$1\" >> '{calls}'\n\
         case \"$1\" in\n\
           --list-sdks) echo '8.0.100 [/opt/dotnet/sdk]'; echo '9.0.100 [/opt/dotnet/sdk]' ;;\n\
           --list-runtimes) echo 'Microsoft.NETCore.App 9.0.0 [/opt/dotnet/shared/Microsoft.NETCore.App]' ;;\n\
           --version) echo '9.0.100' ;;\n\
           *) echo \"unexpected $1\" >&2; exit 2 ;;\n\
         esac\n",
        calls = calls.display()
    );
    fs::write(&path, body).expect("write fake dotnet");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake dotnet");
    (path, calls)
}

fn call_count(calls: &Path) -> usize {
    fs::read_to_string(calls)
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

fn success_output(response: &CommandResponse) -> &str {
    match response {
        CommandResponse::Success { output, .. } => output,
        other => panic!("expected success, got {other:#?}"),
    }
}

#[tokio::test]
async fn successful_command_returns_stdout() {
    let service = shell_service();
    let response = service
        .execute(
            script(OperationKind::Info, "echo hello; echo noise >&2"),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(success_output(&response), "hello\n");
    assert_eq!(response.exit_code(), 0);
}

#[tokio::test]
async fn compiler_errors_are_classified() {
    let service = shell_service();
    let response = service
        .execute(
            script(
                OperationKind::Build,
                "echo 'Program.cs(12,5): error CS1002: ; expected [/src/App.csproj]'; exit 1",
            ),
            &CancellationToken::new(),
        )
        .await;

    assert!(!response.is_success());
    assert_eq!(response.exit_code(), 1);
    let error = &response.errors()[0];
    assert_eq!(error.code, "CS1002");
    assert_eq!(error.category, ErrorCategory::Compilation);
    assert_eq!(error.file.as_deref(), Some("Program.cs"));
    assert_eq!(error.line, Some(12));
    assert_eq!(error.column, Some(5));
}

#[tokio::test]
async fn background_session_blocks_conflicting_build_until_stopped() {
    let tmp = TempDir::new().expect("tempdir");
    let service = shell_service();

    let started = service
        .start_background(script(OperationKind::Watch, "echo watching; sleep 30").cwd(tmp.path()))
        .expect("watch starts");
    assert!(started.pid.is_some());
    assert_eq!(service.sessions().len(), 1);

    let blocked = service
        .execute(
            script(OperationKind::Build, "echo built").cwd(tmp.path()),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(blocked.primary_category(), Some(ErrorCategory::Concurrency));
    assert!(blocked.errors()[0].message.contains("watch"));

    // Read-only kinds never wait on the guard.
    let info = service
        .execute(
            script(OperationKind::Info, "echo info").cwd(tmp.path()),
            &CancellationToken::new(),
        )
        .await;
    assert!(info.is_success());

    let stopped = service.stop_session(&started.session_id).await;
    assert!(stopped.is_success(), "stop failed: {stopped:#?}");
    let again = service.stop_session(&started.session_id).await;
    assert_eq!(again.primary_category(), Some(ErrorCategory::Validation));

    let built = service
        .execute(
            script(OperationKind::Build, "echo built").cwd(tmp.path()),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(success_output(&built), "built\n");
}

#[tokio::test]
async fn cancellation_keeps_partial_output() {
    let service = shell_service();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let response = service
        .execute(
            script(OperationKind::Test, "echo partial; sleep 30"),
            &cancel,
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(response.exit_code(), CANCELLED_EXIT_CODE);
    let error = &response.errors()[0];
    assert_eq!(error.category, ErrorCategory::Cancellation);
    assert!(
        error
            .raw_output
            .as_deref()
            .is_some_and(|raw| raw.contains("partial")),
        "partial output missing: {error:#?}"
    );

    // The lock was released with the cancelled run.
    let rerun = service
        .execute(script(OperationKind::Test, "echo ok"), &CancellationToken::new())
        .await;
    assert!(rerun.is_success());
}

#[tokio::test]
async fn deadline_token_times_out_long_commands() {
    let service = shell_service();
    let cancel = service.deadline_token(&CancellationToken::new(), Some(Duration::from_millis(300)));
    let response = service
        .execute(script(OperationKind::Run, "sleep 30"), &cancel)
        .await;
    assert_eq!(response.primary_category(), Some(ErrorCategory::Cancellation));
}

#[tokio::test]
async fn large_output_is_truncated_once() {
    let service = BridgeService::new(ResolvedConfig {
        dotnet_path: "sh".to_string(),
        max_output_chars: 200,
        ..ResolvedConfig::default()
    });
    let response = service
        .execute(
            script(
                OperationKind::Info,
                "i=0; while [ $i -lt 500 ]; do echo line-$i; i=$((i+1)); done",
            ),
            &CancellationToken::new(),
        )
        .await;

    let output = success_output(&response);
    assert_eq!(output.matches(TRUNCATION_MARKER).count(), 1);
    assert!(output.starts_with("line-0\n"));
    assert!(output.ends_with(TRUNCATION_MARKER));
    assert!(output.chars().count() <= 200 + TRUNCATION_MARKER.len() + 1);
}

#[tokio::test]
async fn secrets_never_reach_the_response() {
    let service = shell_service();
    let response = service
        .execute(
            script(
                OperationKind::Info,
                "echo 'Server=db;Password=hunter2;Database=app'",
            ),
            &CancellationToken::new(),
        )
        .await;
    let output = success_output(&response);
    assert!(!output.contains("hunter2"), "leaked: {output}");
}

#[tokio::test]
async fn missing_tool_is_a_capability_error_and_not_cached() {
    let service = BridgeService::new(ResolvedConfig {
        dotnet_path: "/definitely/not/installed/dotnet".to_string(),
        ..ResolvedConfig::default()
    });

    for _ in 0..2 {
        let err = service
            .installed_sdks(false, &CancellationToken::new())
            .await
            .expect_err("no dotnet here");
        assert_eq!(err.primary_category(), Some(ErrorCategory::Capability));
        assert_eq!(err.exit_code(), NOT_FOUND_EXIT_CODE);
    }

    let stats = service.cache_stats();
    assert!(!stats.sdks.cached);
    assert_eq!(stats.sdks.metrics.misses, 2);
    assert_eq!(stats.sdks.metrics.hits, 0);

    let response = service
        .execute(
            OperationRequest::new(OperationKind::Build, ["build"]),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(response.primary_category(), Some(ErrorCategory::Capability));
}

#[tokio::test]
async fn catalog_queries_are_cached_until_refreshed() {
    let tmp = TempDir::new().expect("tempdir");
    let (dotnet, calls) = fake_dotnet(tmp.path());
    let service = BridgeService::new(ResolvedConfig {
        dotnet_path: dotnet.to_string_lossy().into_owned(),
        ..ResolvedConfig::default()
    });

    let first = service.installed_sdks(false, &CancellationToken::new()).await.expect("sdks");
    assert!(!first.metadata.from_cache);
    assert_eq!(first.value.len(), 2);
    assert_eq!(first.value[1].version, "9.0.100");

    let second = service.installed_sdks(false, &CancellationToken::new()).await.expect("sdks");
    assert!(second.metadata.from_cache);
    assert_eq!(call_count(&calls), 1);

    let refreshed = service.installed_sdks(true, &CancellationToken::new()).await.expect("sdks");
    assert!(!refreshed.metadata.from_cache);
    assert_eq!(call_count(&calls), 2);

    let version = service.tool_version(false, &CancellationToken::new()).await.expect("version");
    assert_eq!(version.value.as_str(), "9.0.100");
    let runtimes = service.installed_runtimes(false, &CancellationToken::new()).await.expect("runtimes");
    assert_eq!(runtimes.value[0].name, "Microsoft.NETCore.App");

    let stats = service.cache_stats();
    assert_eq!(stats.sdks.metrics.hits, 1);
    assert_eq!(stats.sdks.metrics.misses, 2);

    service.clear_caches();
    let _ = service.installed_sdks(false, &CancellationToken::new()).await.expect("sdks");
    assert_eq!(call_count(&calls), 5);
}

#[tokio::test]
async fn hung_catalog_query_hits_the_default_timeout() {
    let tmp = TempDir::new().expect("tempdir");
    let dotnet = tmp.path().join("dotnet");
    fs::write(&dotnet, "#!/bin/sh\nexec sleep 30\n").expect("write hung dotnet");
    fs::set_permissions(&dotnet, fs::Permissions::from_mode(0o755)).expect("chmod hung dotnet");
    let service = BridgeService::new(ResolvedConfig {
        dotnet_path: dotnet.to_string_lossy().into_owned(),
        default_timeout: Some(Duration::from_secs(1)),
        ..ResolvedConfig::default()
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        service.installed_sdks(false, &CancellationToken::new()),
    )
    .await
    .expect("query gave up before the outer timeout");
    let err = result.expect_err("hung query cannot succeed");
    assert_eq!(err.primary_category(), Some(ErrorCategory::Cancellation));
    assert_eq!(err.exit_code(), CANCELLED_EXIT_CODE);
    assert!(!service.cache_stats().sdks.cached);
}

#[tokio::test]
async fn catalog_query_stops_when_the_caller_cancels() {
    let tmp = TempDir::new().expect("tempdir");
    let dotnet = tmp.path().join("dotnet");
    fs::write(&dotnet, "#!/bin/sh\nexec sleep 30\n").expect("write hung dotnet");
    fs::set_permissions(&dotnet, fs::Permissions::from_mode(0o755)).expect("chmod hung dotnet");
    let service = BridgeService::new(ResolvedConfig {
        dotnet_path: dotnet.to_string_lossy().into_owned(),
        ..ResolvedConfig::default()
    });

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        service.tool_version(false, &shutdown),
    )
    .await
    .expect("query ignored shutdown");
    let err = result.expect_err("cancelled query cannot succeed");
    assert_eq!(err.primary_category(), Some(ErrorCategory::Cancellation));
}

#[tokio::test]
async fn duplicate_session_id_never_starts_a_second_process() {
    let tmp = TempDir::new().expect("tempdir");
    let (dotnet, calls) = fake_dotnet(tmp.path());
    let service = BridgeService::new(ResolvedConfig {
        dotnet_path: dotnet.to_string_lossy().into_owned(),
        ..ResolvedConfig::default()
    });
    let request = || {
        let mut request = OperationRequest::new(OperationKind::Run, ["watch"]).cwd(tmp.path());
        request.operation_id = Some("dup".to_string());
        request
    };

    let started = service.start_background(request()).expect("first start");
    assert_eq!(started.session_id, "dup");

    let rejected = service
        .start_background(request())
        .expect_err("id already in use");
    assert_eq!(rejected.primary_category(), Some(ErrorCategory::Validation));
    assert!(rejected.errors()[0].message.contains("dup"));

    for _ in 0..100 {
        if service.session_info("dup").is_some_and(|details| !details.info.running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(call_count(&calls), 1);
    assert_eq!(service.sessions().len(), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn responses_keep_their_wire_shape() {
    let service = shell_service();
    let ok = service
        .execute(script(OperationKind::Info, "echo hi"), &CancellationToken::new())
        .await;
    let value = serde_json::to_value(&ok).expect("serialize");
    assert_eq!(value["success"], json!(true));
    assert_eq!(value["output"], json!("hi\n"));
    assert_eq!(value["exitCode"], json!(0));
    assert!(value["command"].as_str().is_some_and(|c| c.starts_with("sh -c")));

    let failed = service
        .execute(script(OperationKind::Info, "exit 4"), &CancellationToken::new())
        .await;
    let value = serde_json::to_value(&failed).expect("serialize");
    assert_eq!(value["success"], json!(false));
    assert_eq!(value["exitCode"], json!(4));
    assert_eq!(value["errors"][0]["category"], json!("Unknown"));
    assert!(value["errors"][0]["protocolErrorCode"].is_i64());
}

#[tokio::test]
async fn serve_loop_answers_every_line() {
    let service = std::sync::Arc::new(shell_service());
    let input = concat!(
        r#"{"id":1,"op":"exec","request":{"kind":"info","args":["-c","echo served"]}}"#,
        "\n\n",
        r#"{"id":2,"op":"sessions"}"#,
        "\n",
        "not json\n",
        r#"{"id":"last","op":"cache_stats"}"#,
        "\n",
    );
    let (writer, mut reader) = tokio::io::duplex(1 << 16);

    serve::run(
        service,
        input.as_bytes(),
        writer,
        CancellationToken::new(),
        Duration::from_secs(60),
    )
    .await
    .expect("serve loop");

    let mut raw = String::new();
    reader.read_to_string(&mut raw).await.expect("read replies");
    let replies: Vec<Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).expect("reply line is json"))
        .collect();
    assert_eq!(replies.len(), 4);

    let by_id = |id: Value| {
        replies
            .iter()
            .find(|reply| reply["id"] == id)
            .unwrap_or_else(|| panic!("no reply for {id}"))
    };
    assert_eq!(by_id(json!(1))["response"]["output"], json!("served\n"));
    assert_eq!(by_id(json!(2))["response"]["sessions"], json!([]));
    assert_eq!(by_id(Value::Null)["response"]["success"], json!(false));
    assert!(by_id(json!("last"))["response"]["cacheStats"]["sdks"].is_object());
}
