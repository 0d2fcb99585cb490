/*!
 * Integration tests for command execution, bundles, transfers and
 * idempotent actions against an in-memory node
 */

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hive_proxy::transport::mock::{MockHost, MockOutput};
use hive_proxy::{args, CommandBundle, ProxyError, RunOptions, TransferOptions};

use common::proxy;

#[test]
fn test_command_runs_once_when_connection_drops_after_start() {
    let host = MockHost::new();
    host.on_command("append-line", |ctx, args| {
        ctx.append(&args[0], b"entry\n");
        MockOutput::ok("appended\n")
    });
    host.drop_after("nohup bash");
    let mut proxy = proxy(&host);

    let response = proxy
        .run_command("append-line", &args!["/tmp/journal"])
        .unwrap();

    assert!(response.success());
    assert_eq!(response.output_text(), Some("appended\n"));
    assert_eq!(host.read_text("/tmp/journal").unwrap(), "entry\n");
    assert!(host.list("/var/lib/hive/exec/cmd").is_empty());
}

#[test]
fn test_command_survives_refused_connections() {
    let host = MockHost::new();
    host.refuse_connections(2);
    let mut proxy = proxy(&host);

    let response = proxy.run_command("echo", &args!["up"]).unwrap();
    assert_eq!(response.output_text(), Some("up\n"));
    assert!(proxy.is_ready());
}

#[test]
fn test_fault_stops_further_commands() {
    let host = MockHost::new();
    let mut proxy = proxy(&host);

    let failed = proxy.run_command_with(RunOptions::default().fault_on_error(), "cat", &args!["/missing"]);
    assert!(failed.is_err());
    assert!(proxy.is_faulted());
    let executed = host.exec_count();

    let skipped = proxy.run_command("echo", &args!["never"]).unwrap();
    assert!(skipped.already_faulted());
    assert!(!skipped.success());
    assert_eq!(host.exec_count(), executed);

    let forced = proxy
        .run_command_with(RunOptions::default().run_when_faulted(), "echo", &args!["forced"])
        .unwrap();
    assert_eq!(forced.output_text(), Some("forced\n"));
}

#[test]
fn test_redirection_is_rejected_before_contact() {
    let host = MockHost::new();
    let mut proxy = proxy(&host);

    let err = proxy
        .run_command("echo", &args!["hi", ">", "/etc/passwd"])
        .unwrap_err();
    assert!(matches!(err, ProxyError::InvalidCommand(_)));
    assert_eq!(host.connection_count(), 0);
}

#[test]
fn test_bundle_end_to_end() {
    let host = MockHost::new();
    let mut proxy = proxy(&host);

    let mut bundle = CommandBundle::new("./install.sh", args!["--target", "/opt/app"]);
    bundle.add_file("install.sh", "#!/bin/bash\ncat config/app.conf\n", true);
    bundle.add_file("config/app.conf", "port = 8080\n", false);

    let response = proxy.sudo_bundle(&bundle).unwrap();
    assert!(response.success(), "{}", response.all_text());
    assert_eq!(response.output_text(), Some("port = 8080\n"));
    assert_eq!(response.command_line(), "./install.sh --target /opt/app");

    let leftovers: Vec<_> = host
        .list("/var/lib/hive/exec")
        .into_iter()
        .filter(|path| !path.starts_with("/var/lib/hive/exec/cmd"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[test]
fn test_elevated_transfer_round_trip() {
    let host = MockHost::new();
    host.add_dir("/etc/app");
    let mut proxy = proxy(&host);

    let options = TransferOptions::elevated()
        .with_permissions("640")
        .with_owner("root:root");
    proxy
        .upload_text("/etc/app/app.conf", "a\r\nb\r\n", &options)
        .unwrap();

    assert_eq!(host.read_text("/etc/app/app.conf").unwrap(), "a\nb\n");
    assert_eq!(host.mode("/etc/app/app.conf"), Some(0o640));
    assert_eq!(host.owner("/etc/app/app.conf").as_deref(), Some("root:root"));

    let text = proxy
        .download_text("/etc/app/app.conf", &TransferOptions::elevated())
        .unwrap();
    assert_eq!(text, "a\nb\n");
    assert!(proxy.file_exists("/etc/app/app.conf").unwrap());
    assert!(proxy.directory_exists("/etc/app").unwrap());

    proxy.remove_path("/etc/app").unwrap();
    assert!(!host.exists("/etc/app"));
}

#[test]
fn test_idempotent_action_runs_once() {
    let host = MockHost::new();
    let mut proxy = proxy(&host);
    let runs = AtomicU32::new(0);

    for _ in 0..3 {
        proxy
            .invoke_idempotent("setup/docker/install", |proxy| {
                runs.fetch_add(1, Ordering::SeqCst);
                proxy.sudo_command("mkdir", &args!["-p", "/opt/docker"])?;
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(host.exists("/var/lib/hive/state/setup/docker/install"));
    assert!(host.is_dir("/opt/docker"));
}

#[test]
fn test_idempotent_action_retried_after_fault() {
    let host = MockHost::new();
    let mut proxy = proxy(&host);

    let ran = proxy
        .invoke_idempotent("setup/broken", |proxy| {
            proxy.fault("install failed");
            Ok(())
        })
        .unwrap();
    assert!(ran);
    assert!(!host.exists("/var/lib/hive/state/setup/broken"));
}

#[test]
fn test_docker_transient_failures_retry() {
    let host = MockHost::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    host.on_command("docker", move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            MockOutput::fail(1, "Get https://registry/v2/: context deadline exceeded")
        } else {
            MockOutput::ok("pulled\n")
        }
    });
    let mut proxy = proxy(&host);

    let response = proxy
        .docker_command(RunOptions::default(), &args!["pull", "nginx:latest"])
        .unwrap();
    assert!(response.success());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_operation_log_records_commands() {
    let host = MockHost::new();
    let mut proxy = proxy(&host);

    proxy.run_command("echo", &args!["logged"]).unwrap();
    proxy
        .run_command_with(RunOptions::default().redact(), "echo", &args!["hunter2"])
        .unwrap();

    let log = proxy.operation_log().contents().unwrap();
    assert!(log.contains("echo logged"));
    assert!(!log.contains("hunter2"));
}
