#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/kmux-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn kernelmux() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_kernelmux"));
    command.arg("--log-level").arg("error");
    command
}

struct StubProcess {
    child: Child,
    dir: PathBuf,
    socket: PathBuf,
}

impl StubProcess {
    fn start(tag: &str, extra: &[&str]) -> Self {
        let dir = unique_temp_dir(tag);
        let socket = dir.join("kernel.sock");
        let child = kernelmux()
            .arg("stub-kernel")
            .arg(&socket)
            .args(extra)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("stub-kernel should start");
        wait_for_socket(&socket, Duration::from_secs(5));
        Self { child, dir, socket }
    }
}

impl Drop for StubProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            panic!("socket {} never appeared", path.display());
        }
        thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn probe_against_stub_kernel_reports_ready() {
    let stub = StubProcess::start("probe", &[]);

    let output = kernelmux()
        .arg("--format")
        .arg("json")
        .arg("probe")
        .arg(&stub.socket)
        .arg("--timeout")
        .arg("5s")
        .output()
        .expect("probe should run");

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let record: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("probe should print one json record");
    assert_eq!(record["connection_state"], "ready");
    assert_eq!(record["kernel_id"], "kernel");
}

#[test]
fn execute_prints_messages_until_reply() {
    let stub = StubProcess::start("execute", &[]);

    let output = kernelmux()
        .arg("--format")
        .arg("json")
        .arg("execute")
        .arg(&stub.socket)
        .arg("--code")
        .arg("print('hi')")
        .arg("--cell")
        .arg("c1")
        .output()
        .expect("execute should run");

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let messages: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line should be json"))
        .collect();
    let last = messages.last().expect("at least one message");
    assert_eq!(last["msg_type"], "execute_reply");
    assert_eq!(last["channel"], "shell");
    assert!(messages.iter().all(|m| m["cell_id"] == "c1"));
    assert!(messages
        .iter()
        .any(|m| m["msg_type"] == "stream" && m["content"]["text"] == "print('hi')"));
}

#[test]
fn probe_timeout_against_silent_kernel_returns_124() {
    let stub = StubProcess::start("silent", &["--silent"]);

    let status = kernelmux()
        .arg("probe")
        .arg(&stub.socket)
        .arg("--timeout")
        .arg("300ms")
        .status()
        .expect("probe should run");

    assert_eq!(status.code(), Some(124));
}

#[test]
fn probe_missing_socket_times_out() {
    let dir = unique_temp_dir("missing");
    let status = kernelmux()
        .arg("probe")
        .arg(dir.join("absent.sock"))
        .arg("--timeout")
        .arg("200ms")
        .status()
        .expect("probe should run");

    assert_eq!(status.code(), Some(124));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn execute_rejects_bad_cell_with_usage_code() {
    let stub = StubProcess::start("badcell", &[]);

    let status = kernelmux()
        .arg("execute")
        .arg(&stub.socket)
        .arg("--code")
        .arg("x")
        .arg("--cell")
        .arg("a#b")
        .status()
        .expect("execute should run");

    assert_eq!(status.code(), Some(64));
}

#[test]
fn decode_prints_routing_fields() {
    let output = kernelmux()
        .arg("--format")
        .arg("json")
        .arg("decode")
        .arg("shell:abc#c1")
        .output()
        .expect("decode should run");

    assert!(output.status.success());
    let record: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("decode should print json");
    assert_eq!(record["channel"], "shell");
    assert_eq!(record["base_id"], "abc");
    assert_eq!(record["cell_id"], "c1");
    assert_eq!(record["stripped"], "abc");
    assert_eq!(record["encoded"], true);
}

#[test]
fn bad_config_file_is_a_usage_error() {
    let dir = unique_temp_dir("config");
    let config = dir.join("client.json");
    std::fs::write(&config, r#"{"queue_capacity": 0}"#).expect("config should be writable");

    let status = kernelmux()
        .arg("--config")
        .arg(&config)
        .arg("probe")
        .arg(dir.join("kernel.sock"))
        .status()
        .expect("probe should run");

    assert_eq!(status.code(), Some(64));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_prints_package_version() {
    let output = kernelmux()
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("kernelmux {}", env!("CARGO_PKG_VERSION")));
}
