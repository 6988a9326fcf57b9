// Integration tests for the twoway binary
//
// These tests run the built binary with piped standard streams and verify:
// 1. Data moves through stdio, exec and file addresses and both ends close
// 2. Configuration errors exit non-zero before any transfer
// 3. Diagnostics respect -d / -L and TWOWAY_LOG_FILE
// 4. A termination signal ends the relay with the signal number, also while
//    a line read is waiting for the rest of a line

use std::io::{Read, Write};
use std::net::TcpListener;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn twoway() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_twoway"));
    command.env_remove("TWOWAY_LOG_FILE").env_remove("TWOWAY_BUFSIZE");
    command
}

/// Runs the binary with `input` on stdin and waits for it.
fn run_with_input(command: &mut Command, input: &[u8]) -> Output {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to start twoway");
    let mut stdin = child.stdin.take().unwrap();
    let input = input.to_vec();
    let feeder = thread::spawn(move || {
        let _ = stdin.write_all(&input);
    });
    let output = child.wait_with_output().expect("Failed to wait for twoway");
    feeder.join().unwrap();
    output
}

/// Wait for process to exit with timeout
fn wait_with_timeout(
    child: &mut std::process::Child,
    timeout: Duration,
) -> Option<std::process::ExitStatus> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if start.elapsed() > timeout {
                    return None;
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return None,
        }
    }
}

#[test]
fn test_stdio_through_cat() {
    let output = run_with_input(twoway().args(["-t", "5", "-", "exec:cat"]), b"line one\nline two\n");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, b"line one\nline two\n");
}

#[test]
fn test_system_output_to_stdout() {
    let output = run_with_input(twoway().args(["-u", "system:printf 'a\\nb\\n'", "stdio"]), b"");
    assert!(output.status.success());
    assert_eq!(output.stdout, b"a\nb\n");
}

#[test]
fn test_stdin_into_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("captured");
    let target = format!("open:{},creat,trunc", path.display());

    let output = run_with_input(twoway().args(["-u", "-", &target]), b"saved to disk\n");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(std::fs::read(&path).unwrap(), b"saved to disk\n");
}

#[test]
fn test_file_to_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source");
    std::fs::write(&path, b"from a file\n").unwrap();

    let output = run_with_input(
        twoway().args(["-u", &format!("open:{}", path.display()), "-"]),
        b"",
    );
    assert!(output.status.success());
    assert_eq!(output.stdout, b"from a file\n");
}

#[test]
fn test_stdio_to_tcp_peer() {
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    let peer = thread::spawn(move || {
        let (mut stream, _) = server.accept().unwrap();
        let mut got = Vec::new();
        stream.read_to_end(&mut got).unwrap();
        got
    });

    let output = run_with_input(
        twoway().args(["-u", "-", &format!("tcp:127.0.0.1:{port}")]),
        b"over tcp",
    );
    assert!(output.status.success());
    assert_eq!(peer.join().unwrap(), b"over tcp");
}

#[test]
fn test_unknown_address_exits_non_zero() {
    let output = run_with_input(twoway().args(["-", "bogus:1"]), b"");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(" E "), "stderr: {stderr}");
    assert!(stderr.contains("bogus"), "stderr: {stderr}");
}

#[test]
fn test_inapplicable_option_exits_with_configured_status() {
    let output = run_with_input(twoway().args(["-x", "7", "-", "exec:cat,nodelay"]), b"");
    assert_eq!(output.status.code(), Some(7));
    assert!(String::from_utf8_lossy(&output.stderr).contains("nodelay"));
}

#[test]
fn test_wrong_arity_is_reported() {
    let output = run_with_input(twoway().args(["-", "tcp-connect:localhost"]), b"");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("2 required"));
}

#[test]
fn test_debug_flags_and_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("twoway.log");

    let output = run_with_input(
        twoway().args(["-d", "-d", "-P", "relaytest", "-L"]).arg(&log).args(["-", "exec:cat"]),
        b"ping\n",
    );
    assert!(output.status.success());
    assert!(output.stderr.is_empty());
    let text = std::fs::read_to_string(&log).unwrap();
    assert!(text.contains("relaytest["), "log: {text}");
    assert!(text.contains(" N relaying between"), "log: {text}");
}

#[test]
fn test_log_file_from_environment() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("env.log");

    let output = run_with_input(
        twoway().env("TWOWAY_LOG_FILE", &log).args(["-", "bogus"]),
        b"",
    );
    assert!(!output.status.success());
    assert!(std::fs::read_to_string(&log).unwrap().contains("bogus"));
}

#[test]
fn test_sigterm_exits_with_signal_number() {
    let mut child = twoway()
        .args(["-", "exec:sleep 30"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start twoway");

    thread::sleep(Duration::from_millis(500));
    // SAFETY: signalling our own child.
    unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };

    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    let Some(status) = status else {
        let _ = child.kill();
        panic!("twoway did not exit after SIGTERM");
    };
    assert_eq!(status.code(), Some(libc::SIGTERM));
}

#[test]
fn test_sigterm_during_partial_line_exits_promptly() {
    let mut child = twoway()
        .args(["readline,noprompt", "exec:cat"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start twoway");

    // No newline: the line reader keeps waiting for the rest of the line.
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(b"abc").unwrap();
    stdin.flush().unwrap();
    thread::sleep(Duration::from_millis(500));
    // SAFETY: signalling our own child.
    unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };

    let status = wait_with_timeout(&mut child, Duration::from_secs(3));
    drop(stdin);
    let Some(status) = status else {
        let _ = child.kill();
        panic!("twoway kept waiting for a newline after SIGTERM");
    };
    assert_eq!(status.code(), Some(libc::SIGTERM));
}

#[test]
fn test_out_of_range_timeout_is_a_usage_error() {
    let output = run_with_input(twoway().args(["-t", "1e300", "-", "exec:true"]), b"");
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid number of seconds"));
}

#[test]
fn test_help_lists_addresses_argument() {
    let output = twoway().arg("--help").output().expect("Failed to run --help");
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("ADDRESS1"));
    assert!(help.contains("-u"));
}
