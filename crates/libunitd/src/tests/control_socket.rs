//! Control-surface behavior over a real unix socket: request/reply
//! framing, subscriber signals, and the reload reply being held back until
//! the rescan completed.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde_json::{json, Value};

use crate::control::jsonrpc2::{Call, Response};
use crate::control::ControlServer;
use crate::manager::Objective;
use crate::tests::world;

fn connect(path: &std::path::Path) -> (UnixStream, BufReader<UnixStream>) {
    let stream = UnixStream::connect(path).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    (stream, reader)
}

fn send(stream: &mut UnixStream, method: &str, params: Option<Value>, id: u64) {
    let call = Call::new(method, params, Some(json!(id)));
    let mut line = serde_json::to_string(&call).unwrap();
    line.push('\n');
    stream.write_all(line.as_bytes()).unwrap();
}

fn read_response(reader: &mut BufReader<UnixStream>) -> Response {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    serde_json::from_str(&line).unwrap()
}

#[test]
fn request_reply_and_signals() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.socket");

    let mut w = world();
    w.add_service("a.service");
    let mut control = ControlServer::open(&socket_path).unwrap();

    let (mut stream, mut reader) = connect(&socket_path);
    send(&mut stream, "subscribe", None, 1);
    send(&mut stream, "start-unit", Some(json!(["a.service", "replace"])), 2);
    // give the data a moment to land in the socket buffer
    std::thread::sleep(Duration::from_millis(20));

    assert!(control.service(&mut w.manager).is_none());
    control.flush_events(&mut w.manager);

    let subscribe_reply = read_response(&mut reader);
    assert_eq!(subscribe_reply.id, Some(json!(1)));
    assert!(subscribe_reply.error.is_none());

    let start_reply = read_response(&mut reader);
    assert_eq!(start_reply.id, Some(json!(2)));
    let job = start_reply.result.unwrap()["job"].as_u64().unwrap();
    assert!(job > 0);

    // as a subscriber we see the job lifecycle signals
    let mut saw_new = false;
    let mut saw_removed_done = false;
    let mut line = String::new();
    while reader.read_line(&mut line).is_ok() && !line.is_empty() {
        let call: Call = serde_json::from_str(&line).unwrap();
        match call.method.as_str() {
            "job-new" => saw_new = true,
            "job-removed" => {
                let params = call.params.unwrap();
                assert_eq!(params["result"], json!("done"));
                saw_removed_done = true;
            }
            _ => {}
        }
        line.clear();
        if saw_new && saw_removed_done {
            break;
        }
    }
    assert!(saw_new && saw_removed_done);
}

#[test]
fn unknown_method_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.socket");

    let mut w = world();
    let mut control = ControlServer::open(&socket_path).unwrap();

    let (mut stream, mut reader) = connect(&socket_path);
    send(&mut stream, "frobnicate", None, 7);
    std::thread::sleep(Duration::from_millis(20));
    control.service(&mut w.manager);

    let reply = read_response(&mut reader);
    assert_eq!(reply.id, Some(json!(7)));
    assert!(reply.error.is_some());
}

#[test]
fn reload_reply_waits_for_the_rescan() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.socket");

    let mut w = world();
    w.add_service("a.service");
    let mut control = ControlServer::open(&socket_path).unwrap();

    let (mut reload_stream, mut reload_reader) = connect(&socket_path);
    let (mut other_stream, mut other_reader) = connect(&socket_path);

    send(&mut reload_stream, "reload", None, 1);
    send(&mut other_stream, "get-unit", Some(json!("a.service")), 2);
    std::thread::sleep(Duration::from_millis(20));

    let objective = control.service(&mut w.manager);
    assert_eq!(objective, Some(Objective::Reload));

    // the other handler in the same iteration was answered from the
    // current registry
    let other_reply = read_response(&mut other_reader);
    assert_eq!(other_reply.id, Some(json!(2)));
    assert_eq!(other_reply.result.unwrap()["id"], json!("a.service"));

    // but no reload reply yet: the rescan has not happened
    let mut line = String::new();
    assert!(reload_reader.read_line(&mut line).is_err() || line.is_empty());

    w.manager.reload();
    control.flush_deferred();

    let reload_reply = read_response(&mut reload_reader);
    assert_eq!(reload_reply.id, Some(json!(1)));
    assert!(reload_reply.error.is_none());
}
