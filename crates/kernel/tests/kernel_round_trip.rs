//! End-to-end tests driving the real worker binary through the
//! subprocess executor: execute round-trips, RPC into host storage,
//! timeouts, and reset.

use cm_domain::config::KernelConfig;
use cm_exec::{Executor, KernelExecutor, ResourceOptions};
use cm_storage::{FileStorage, StorageBackend};

fn kernel_config() -> KernelConfig {
    KernelConfig {
        command: env!("CARGO_BIN_EXE_codemode-kernel").to_string(),
        ..Default::default()
    }
}

async fn started(dir: &std::path::Path) -> KernelExecutor {
    let storage = FileStorage::new(dir);
    let executor = KernelExecutor::new(kernel_config(), ResourceOptions::default());
    executor
        .start(Some(storage.serializable_access()))
        .await
        .expect("kernel failed to start");
    executor
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn variables_persist_and_reset_clears() {
    let dir = tempfile::tempdir().unwrap();
    let executor = started(dir.path()).await;

    let r = executor.run("let x = 42;", Some(10.0)).await.unwrap();
    assert!(r.success(), "{:?}", r.error);

    let r = executor.run("x * 2", Some(10.0)).await.unwrap();
    assert_eq!(r.value, Some(serde_json::json!(84)));

    executor.reset().await.unwrap();
    let r = executor.run("x", Some(10.0)).await.unwrap();
    assert!(r.error.unwrap().contains("x"));

    executor.close().await.unwrap();
    executor.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stdout_streams_back_to_host() {
    let dir = tempfile::tempdir().unwrap();
    let executor = started(dir.path()).await;

    let r = executor
        .run("print(\"hello from the kernel\"); 3", Some(10.0))
        .await
        .unwrap();
    assert_eq!(r.stdout, "hello from the kernel\n");
    assert_eq!(r.value, Some(serde_json::json!(3)));

    executor.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rpc_reaches_host_storage() {
    let dir = tempfile::tempdir().unwrap();
    let executor = started(dir.path()).await;

    // Create a skill over RPC, then invoke it; the skill runs host-side.
    let r = executor
        .run(
            r#"skills.create("triple", "fn run(n) { n * 3 }", "Triple a number")"#,
            Some(10.0),
        )
        .await
        .unwrap();
    assert!(r.success(), "{:?}", r.error);

    let r = executor
        .run(r#"skills.invoke("triple", #{ n: 10 })"#, Some(10.0))
        .await
        .unwrap();
    assert!(r.success(), "{:?}", r.error);
    assert_eq!(r.value, Some(serde_json::json!(30)));

    // The skill landed in the host's store.
    assert!(dir.path().join("skills/triple.rhai").exists());

    // Artifacts round-trip through the same channel.
    let r = executor
        .run(r#"artifacts.save("d.json", #{ k: 1 }, "desc")"#, Some(10.0))
        .await
        .unwrap();
    assert!(r.success(), "{:?}", r.error);
    let r = executor
        .run(r#"artifacts.load("d.json")"#, Some(10.0))
        .await
        .unwrap();
    assert_eq!(r.value, Some(serde_json::json!({"k": 1})));

    executor.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rpc_errors_surface_as_interpreter_errors() {
    let dir = tempfile::tempdir().unwrap();
    let executor = started(dir.path()).await;

    let r = executor
        .run(r#"tools.call("nonexistent", #{})"#, Some(10.0))
        .await
        .unwrap();
    assert!(r.error.unwrap().contains("not found"));

    // The session survives the error.
    let r = executor.run("1 + 1", Some(10.0)).await.unwrap();
    assert_eq!(r.value, Some(serde_json::json!(2)));

    executor.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_produces_error_and_reset_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let executor = started(dir.path()).await;

    let r = executor
        .run("let n = 0; loop { n += 1; }", Some(0.2))
        .await
        .unwrap();
    assert!(r.error.unwrap().contains("timed out"));

    // The kernel is still grinding on the loop; restart stops it.
    executor.reset().await.unwrap();
    let r = executor.run("2 + 2", Some(10.0)).await.unwrap();
    assert_eq!(r.value, Some(serde_json::json!(4)));

    executor.close().await.unwrap();
}
