//! Router tests driven through the local shell transport.

use std::time::Duration;

use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, duplex};

use super::*;
use crate::error::ErrorKind;
use crate::resource::Address;

#[fixture]
fn router() -> ExecutionRouter {
    ExecutionRouter::new(ExecConfig {
        output_limit_bytes: 1024,
        cancel_grace_secs: 1,
        ..ExecConfig::default()
    })
    .expect("valid config")
}

fn local(interactive: bool) -> ConnectionParams {
    ConnectionParams {
        machine_id: String::from("fake-machine-1"),
        address: None,
        auth: AuthMethod::Local,
        interactive,
    }
}

async fn drain(mut reader: tokio::io::DuplexStream) -> String {
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .await
        .expect("read captured stream");
    text
}

#[rstest]
#[tokio::test]
async fn batch_requests_capture_output_and_exit_code(router: ExecutionRouter) {
    let result = router
        .execute(
            &local(true),
            ExecutionRequest::batch("echo out; echo err >&2; exit 3"),
        )
        .await
        .expect("batch run");
    let ExecutionResult::Batch { exit_code, output } = result else {
        panic!("batch requests yield batch results");
    };
    assert_eq!(exit_code, 3);
    assert_eq!(output.stdout_lossy(), "out\n");
    assert_eq!(output.stderr_lossy(), "err\n");
}

#[rstest]
#[tokio::test]
async fn batch_output_over_the_bound_fails_without_truncating(router: ExecutionRouter) {
    let err = router
        .execute(
            &local(true),
            ExecutionRequest::batch("head -c 4096 /dev/zero"),
        )
        .await
        .expect_err("too large");
    assert_eq!(err, ExecError::OutputTooLarge { limit: 1024 });
    assert_eq!(err.kind(), ErrorKind::OutputTooLarge);
}

#[rstest]
#[tokio::test]
async fn deadlines_kill_slow_commands(router: ExecutionRouter) {
    let err = router
        .execute(
            &local(true),
            ExecutionRequest::batch("sleep 5").with_timeout(Duration::from_millis(100)),
        )
        .await
        .expect_err("deadline");
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[rstest]
#[tokio::test]
async fn interactive_requests_stream_input_and_output(router: ExecutionRouter) {
    let (out_writer, out_reader) = duplex(64 * 1024);
    let (err_writer, err_reader) = duplex(64 * 1024);
    let request = ExecutionRequest::interactive(
        "tr a-z A-Z",
        Box::new(&b"hello preview\n"[..]),
        Box::new(out_writer),
        Box::new(err_writer),
    );
    let result = router
        .execute(&local(true), request)
        .await
        .expect("interactive run");
    assert_eq!(result, ExecutionResult::Interactive { exit_code: 0 });
    assert_eq!(drain(out_reader).await, "HELLO PREVIEW\n");
    assert_eq!(drain(err_reader).await, "");
}

#[rstest]
#[tokio::test]
async fn cancellation_closes_input_so_the_process_sees_eof(router: ExecutionRouter) {
    let (_held_open, input) = duplex(1024);
    let (out_writer, _out_reader) = duplex(1024);
    let (err_writer, _err_reader) = duplex(1024);
    let cancel = CancellationToken::new();
    let request = ExecutionRequest::Interactive(InteractiveExec {
        command: String::from("cat"),
        stdin: Box::new(input),
        stdout: Box::new(out_writer),
        stderr: Box::new(err_writer),
        cancel: cancel.clone(),
        timeout: Some(Duration::from_secs(10)),
    });
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let result = router
        .execute(&local(true), request)
        .await
        .expect("cat exits on EOF");
    trigger.await.expect("trigger task");
    assert_eq!(result.exit_code(), 0);
}

#[rstest]
#[tokio::test]
async fn processes_ignoring_cancellation_are_killed(router: ExecutionRouter) {
    let (_held_open, input) = duplex(1024);
    let (out_writer, _out_reader) = duplex(1024);
    let (err_writer, _err_reader) = duplex(1024);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = ExecutionRequest::Interactive(InteractiveExec {
        command: String::from("exec sleep 30"),
        stdin: Box::new(input),
        stdout: Box::new(out_writer),
        stderr: Box::new(err_writer),
        cancel,
        timeout: Some(Duration::from_secs(10)),
    });
    let result = router
        .execute(&local(true), request)
        .await
        .expect("killed after grace");
    assert_eq!(result.exit_code(), SIGNALLED_EXIT_CODE);
}

#[rstest]
#[tokio::test]
async fn batch_only_machines_reject_interactive_requests(router: ExecutionRouter) {
    let request = ExecutionRequest::interactive(
        "true",
        Box::new(tokio::io::empty()),
        Box::new(tokio::io::sink()),
        Box::new(tokio::io::sink()),
    );
    let err = router
        .execute(&local(false), request)
        .await
        .expect_err("batch only");
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let batch = router
        .execute(&local(false), ExecutionRequest::batch("true"))
        .await
        .expect("batch still allowed");
    assert!(matches!(batch, ExecutionResult::Batch { exit_code: 0, .. }));
}

#[rstest]
#[tokio::test]
async fn closed_ssh_ports_fail_the_preflight(router: ExecutionRouter) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let port = listener.local_addr().expect("listener addr").port();
    drop(listener);

    let params = ConnectionParams {
        machine_id: String::from("srv-1"),
        address: Some(Address::new("127.0.0.1", port)),
        auth: AuthMethod::Ssh {
            user: String::from("root"),
            identity_file: None,
        },
        interactive: true,
    };
    let err = router
        .execute(&params, ExecutionRequest::batch("true"))
        .await
        .expect_err("nothing listening");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
}

#[test]
fn missing_client_binaries_are_configuration_errors() {
    let err = ExecutionRouter::new(ExecConfig {
        ssh_bin: String::from("  "),
        ..ExecConfig::default()
    })
    .expect_err("blank ssh binary");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
