//! Integration tests for sandbox hosts.

use kiln_artifact::{build_file_tree, Step, StepStatus};
use kiln_sandbox::{HostError, LocalHost, LogStream, SandboxHost};
use tempfile::TempDir;

fn sample_tree() -> Vec<kiln_artifact::FileNode> {
    build_file_tree(&[
        Step::create_file(1, "package.json", r#"{"name":"demo"}"#, StepStatus::Completed),
        Step::create_file(2, "src/main.tsx", "render()", StepStatus::Completed),
        Step::create_file(3, "src/components/Button.tsx", "button", StepStatus::Completed),
    ])
}

#[tokio::test]
async fn test_local_mount_writes_tree() {
    let temp = TempDir::new().unwrap();
    let host = LocalHost::new(temp.path()).unwrap();

    host.mount(&sample_tree()).await.unwrap();

    let manifest = std::fs::read_to_string(temp.path().join("package.json")).unwrap();
    assert_eq!(manifest, r#"{"name":"demo"}"#);
    assert!(temp.path().join("src/components").is_dir());
    assert_eq!(
        std::fs::read_to_string(temp.path().join("src/components/Button.tsx")).unwrap(),
        "button"
    );
}

#[tokio::test]
async fn test_local_mkdir_and_write() {
    let temp = TempDir::new().unwrap();
    let host = LocalHost::new(temp.path().join("sandbox")).unwrap();

    host.mkdir("src/lib", true).await.unwrap();
    host.write_file("src/lib/util.ts", "export {}").await.unwrap();
    host.mkdir("src/lib", false).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(temp.path().join("sandbox/src/lib/util.ts")).unwrap(),
        "export {}"
    );

    let err = host.write_file("../outside.txt", "x").await.unwrap_err();
    assert!(matches!(err, HostError::InvalidPath(_)));
    assert!(!temp.path().join("outside.txt").exists());
}

#[tokio::test]
async fn test_local_spawn_missing_program() {
    let temp = TempDir::new().unwrap();
    let host = LocalHost::new(temp.path()).unwrap();

    let err = host.spawn("kiln-no-such-program", &[]).await.unwrap_err();
    assert!(matches!(err, HostError::SpawnFailed { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_spawn_streams_output_and_exit_code() {
    let temp = TempDir::new().unwrap();
    let host = LocalHost::new(temp.path()).unwrap();
    std::fs::write(temp.path().join("marker.txt"), "here").unwrap();

    let args = vec!["-c".to_string(), "cat marker.txt; echo; echo oops >&2; exit 3".to_string()];
    let process = host.spawn("sh", &args).await.unwrap();

    let mut lines = Vec::new();
    let code = process
        .wait_with_output(|line| lines.push((line.stream, line.message)))
        .await
        .unwrap();

    assert_eq!(code, 3);
    assert!(lines.contains(&(LogStream::Stdout, "here".to_string())));
    assert!(lines.contains(&(LogStream::Stderr, "oops".to_string())));
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_server_ready_from_output() {
    let temp = TempDir::new().unwrap();
    let host = LocalHost::new(temp.path()).unwrap();
    let mut ready = host.subscribe_server_ready();

    let args = vec![
        "-c".to_string(),
        "echo 'VITE ready'; echo '  Local:   http://localhost:5173/'".to_string(),
    ];
    let process = host.spawn("sh", &args).await.unwrap();
    process.wait_with_output(|_| {}).await.unwrap();

    let notice = ready.recv().await.unwrap();
    assert_eq!(notice.url, "http://localhost:5173/");
    assert_eq!(notice.port, Some(5173));
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_kill_long_running_process() {
    let temp = TempDir::new().unwrap();
    let host = LocalHost::new(temp.path()).unwrap();

    let process = host.spawn("sleep", &["30".to_string()]).await.unwrap();
    let handle = process.kill_handle();
    assert!(handle.kill());

    let code = tokio::time::timeout(std::time::Duration::from_secs(5), process.wait_with_output(|_| {}))
        .await
        .expect("process should stop after kill")
        .unwrap();
    assert_ne!(code, 0);
}
