//! CLI Integration Tests
//!
//! Runs the `peerlink` binary against a server it started itself.

use std::net::TcpListener;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Test Helpers
// ============================================================================

fn peerlink(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_peerlink"))
        .args(args)
        .output()
        .expect("Failed to run peerlink")
}

/// A port nobody listens on right now.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Kills the server process if a test fails before shutting it down.
struct ServerProcess(Child);

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn serve(addr: &str) -> ServerProcess {
    let child = Command::new(env!("CARGO_BIN_EXE_peerlink"))
        .args(["serve", "-b", addr])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start server");
    let server = ServerProcess(child);

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if peerlink(&["ping", addr]).status.success() {
            return server;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Server at {} did not come up", addr);
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_ping_without_server_fails() {
    let addr = format!("127.0.0.1:{}", free_port());
    let output = peerlink(&["ping", &addr, "--timeout", "200"]);
    assert!(!output.status.success());
}

#[test]
fn test_call_without_arguments_is_usage_error() {
    let output = peerlink(&["call"]);
    assert!(!output.status.success());
}

#[test]
fn test_serve_call_shutdown() {
    let addr = format!("127.0.0.1:{}", free_port());
    let mut server = serve(&addr);

    let ping = peerlink(&["ping", &addr]);
    assert_eq!(stdout(&ping), "pong");

    let echo = peerlink(&["call", &addr, "echo", "echo", "-a", "hello"]);
    assert!(echo.status.success(), "{}", String::from_utf8_lossy(&echo.stderr));
    assert_eq!(stdout(&echo), "\"hello\"");

    let reverse = peerlink(&["call", &addr, "echo", "reverse", "-a", "hello"]);
    assert_eq!(stdout(&reverse), "\"olleh\"");

    // Each call opens its own connection, so each sees a fresh object.
    let count = peerlink(&["call", &addr, "echo", "count"]);
    assert_eq!(stdout(&count), "0");

    let missing = peerlink(&["call", &addr, "nothing", "echo", "-a", "x"]);
    assert!(!missing.status.success());

    assert!(peerlink(&["shutdown", &addr]).status.success());
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(status) = server.0.try_wait().unwrap() {
            assert!(status.success());
            break;
        }
        assert!(Instant::now() < deadline, "Server did not exit after shutdown");
        thread::sleep(Duration::from_millis(50));
    }
}
