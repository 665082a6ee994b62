//! Subprocess channel tests against the crate's own frame-worker
//!
//! The `frame-worker` subcommand serves the line protocol for real, so these
//! tests exercise actual pipes, half-close shutdown and process restarts
//! rather than fakes. Its payload for a request line is the hex SHA-256 of
//! that line followed by a newline, which keeps expectations derivable.

use framereel::{ChannelCommand, Error, StreamAssignment, SubprocessChannel};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, DuplexStream};

fn worker(extra: &[&str]) -> ChannelCommand {
    ChannelCommand::new(env!("CARGO_BIN_EXE_framereel"))
        .arg("frame-worker")
        .args(extra.iter().copied())
}

fn payload_for(request: &str) -> String {
    format!("{}\n", hex::encode(Sha256::digest(request.as_bytes())))
}

async fn collected(mut capture: DuplexStream) -> String {
    let mut buf = Vec::new();
    capture.read_to_end(&mut buf).await.unwrap();
    String::from_utf8(buf).unwrap()
}

fn channel_for(command: ChannelCommand) -> (SubprocessChannel, DuplexStream) {
    let (sink, capture) = tokio::io::duplex(1 << 20);
    let channel = SubprocessChannel::new(command, StreamAssignment::default(), Box::new(sink));
    (channel, capture)
}

#[tokio::test]
async fn close_and_wait_on_a_never_started_channel_do_nothing() {
    // A nonexistent program proves nothing gets spawned on close/wait.
    let (mut channel, _capture) = channel_for(ChannelCommand::new("definitely-not-a-real-program"));
    channel.close();
    channel.wait_for_done().await.unwrap();
    channel.wait_for_done().await.unwrap();
}

#[tokio::test]
async fn a_missing_program_fails_on_the_first_request() {
    let (mut channel, _capture) = channel_for(ChannelCommand::new("definitely-not-a-real-program"));
    let err = channel.make_request("0", "frame 0").await.unwrap_err();
    assert!(matches!(err, Error::Spawn(_)));
}

#[tokio::test]
async fn confirmed_requests_deliver_their_payloads_in_order() {
    let (mut channel, capture) = channel_for(worker(&[]));

    channel.make_request("0", "frame 0").await.unwrap();
    channel.make_request("0.5", "frame 1").await.unwrap();
    channel.make_request("1", "frame 2").await.unwrap();

    channel.close();
    channel.wait_for_done().await.unwrap();
    drop(channel);

    let expected = format!(
        "{}{}{}",
        payload_for("0"),
        payload_for("0.5"),
        payload_for("1")
    );
    assert_eq!(collected(capture).await, expected);
}

#[tokio::test]
async fn a_retry_answer_resends_until_confirmed() {
    // Every request asks for a retry on its first delivery.
    let (mut channel, capture) = channel_for(worker(&["--flaky-every", "1"]));

    channel.make_request("7", "frame 7").await.unwrap();

    channel.close();
    channel.wait_for_done().await.unwrap();
    drop(channel);

    // One payload block despite two deliveries of the request.
    assert_eq!(collected(capture).await, payload_for("7"));
}

#[tokio::test]
async fn an_unrecognized_answer_is_a_protocol_violation() {
    let (mut channel, capture) = channel_for(worker(&["--rude"]));

    let err = channel.make_request("0", "frame 0").await.unwrap_err();
    match err {
        Error::ProtocolViolation(line) => assert_eq!(line, "no thanks"),
        other => panic!("expected a protocol violation, got {:?}", other),
    }

    // The violation itself half-closes the worker's input, so draining must
    // finish without an explicit close().
    channel.wait_for_done().await.unwrap();
    drop(channel);
    assert_eq!(collected(capture).await, "", "no payload was ever confirmed");
}

#[tokio::test]
async fn an_exited_worker_is_replaced_on_the_next_request() {
    let (mut channel, capture) = channel_for(worker(&["--exit-after", "1"]));

    channel.make_request("0", "frame 0").await.unwrap();
    // Let the worker's voluntary exit become observable before asking again.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    channel.make_request("1", "frame 1").await.unwrap();

    channel.close();
    channel.wait_for_done().await.unwrap();
    drop(channel);

    let expected = format!("{}{}", payload_for("0"), payload_for("1"));
    assert_eq!(collected(capture).await, expected);
}

#[tokio::test]
async fn control_on_stderr_flips_both_streams() {
    let (sink, capture) = tokio::io::duplex(1 << 20);
    let command = worker(&["--control-stream", "stderr"]);
    let mut channel =
        SubprocessChannel::new(command, StreamAssignment::ControlOnStderr, Box::new(sink));

    channel.make_request("3", "frame 3").await.unwrap();

    channel.close();
    channel.wait_for_done().await.unwrap();
    drop(channel);
    assert_eq!(collected(capture).await, payload_for("3"));
}

#[tokio::test]
async fn wait_for_done_is_safe_to_repeat_after_a_run() {
    let (mut channel, _capture) = channel_for(worker(&[]));

    channel.make_request("0", "frame 0").await.unwrap();
    channel.close();
    channel.wait_for_done().await.unwrap();
    channel.wait_for_done().await.unwrap();
}
