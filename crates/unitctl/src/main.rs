//! unitctl — control tool for the unitd service manager.
//!
//! Packs CLI arguments into JSON-RPC 2.0 calls, sends them to the manager's
//! control socket, and pretty-prints the response.
//!
//! Exit codes: 0 on success, 1 on a failed operation or unreachable
//! manager.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use serde_json::{json, Value};

use libunitd::config::{Config, RunningAs};
use libunitd::control::jsonrpc2::{Call, Response};

/// Flags that only matter to other implementations; accepted and dropped
/// so scripts keep working.
const IGNORED_FLAGS: &[&str] = &[
    "--no-block",
    "--quiet",
    "--no-wall",
    "--force",
    "--no-pager",
    "--no-legend",
    "--plain",
    "--full",
    "--all",
    "-a",
    "-q",
    "-l",
];

fn usage() -> ! {
    eprintln!(
        "usage: unitctl [--system|--user] COMMAND [ARGS...]\n\
         \n\
         commands:\n\
         \tstart|stop|restart|try-restart|reload UNIT [MODE]\n\
         \tstatus UNIT\n\
         \tload UNIT\n\
         \tlist-units\n\
         \tlist-jobs\n\
         \tjob ID\n\
         \tcancel-all\n\
         \tsnapshot [NAME] [--cleanup]\n\
         \tdaemon-reload | daemon-reexec | exit\n\
         \tset-environment VAR=VALUE... | unset-environment VAR...\n\
         \tdump | properties"
    );
    std::process::exit(1)
}

fn main() {
    let mut running_as = RunningAs::System;
    let mut args: Vec<String> = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--system" => running_as = RunningAs::System,
            "--user" => running_as = RunningAs::Session,
            flag if IGNORED_FLAGS.contains(&flag) => {}
            _ => args.push(arg),
        }
    }
    if args.is_empty() {
        usage();
    }

    let command = args.remove(0);
    let call = match command.as_str() {
        "start" | "stop" | "restart" | "try-restart" | "reload" if !args.is_empty() => {
            let method = format!("{command}-unit");
            let unit = args.remove(0);
            let mode = args.first().cloned().unwrap_or_else(|| "replace".to_owned());
            Call::new(&method, Some(json!([unit, mode])), Some(json!(1)))
        }
        "status" if !args.is_empty() => {
            Call::new("get-unit", Some(json!(args.remove(0))), Some(json!(1)))
        }
        "load" if !args.is_empty() => {
            Call::new("load-unit", Some(json!(args.remove(0))), Some(json!(1)))
        }
        "list-units" => Call::new("list-units", None, Some(json!(1))),
        "list-jobs" => Call::new("list-jobs", None, Some(json!(1))),
        "job" if !args.is_empty() => {
            let id: u64 = match args.remove(0).parse() {
                Ok(id) => id,
                Err(_) => usage(),
            };
            Call::new("get-job", Some(json!(id)), Some(json!(1)))
        }
        "cancel-all" => Call::new("clear-jobs", None, Some(json!(1))),
        "snapshot" => {
            let cleanup = args.iter().any(|a| a == "--cleanup");
            let name = args.iter().find(|a| !a.starts_with("--")).cloned();
            Call::new(
                "create-snapshot",
                Some(json!([name, cleanup])),
                Some(json!(1)),
            )
        }
        "daemon-reload" => Call::new("reload", None, Some(json!(1))),
        "daemon-reexec" => Call::new("reexecute", None, Some(json!(1))),
        "exit" => Call::new("exit", None, Some(json!(1))),
        "set-environment" if !args.is_empty() => {
            Call::new("set-environment", Some(json!(args)), Some(json!(1)))
        }
        "unset-environment" if !args.is_empty() => {
            Call::new("unset-environment", Some(json!(args)), Some(json!(1)))
        }
        "dump" => Call::new("dump", None, Some(json!(1))),
        "properties" | "show" => Call::new("properties", None, Some(json!(1))),
        _ => usage(),
    };

    let socket_path = Config::default_for(running_as).control_socket;
    let mut stream = match UnixStream::connect(&socket_path) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("unitctl: cannot connect to {}: {e}", socket_path.display());
            std::process::exit(1);
        }
    };

    let mut line = match serde_json::to_string(&call) {
        Ok(line) => line,
        Err(e) => {
            eprintln!("unitctl: cannot encode request: {e}");
            std::process::exit(1);
        }
    };
    line.push('\n');
    if let Err(e) = stream.write_all(line.as_bytes()) {
        eprintln!("unitctl: cannot send request: {e}");
        std::process::exit(1);
    }

    let mut reader = BufReader::new(stream);
    let mut reply = String::new();
    if let Err(e) = reader.read_line(&mut reply) {
        eprintln!("unitctl: cannot read reply: {e}");
        std::process::exit(1);
    }
    let response: Response = match serde_json::from_str(&reply) {
        Ok(response) => response,
        Err(e) => {
            eprintln!("unitctl: malformed reply: {e}");
            std::process::exit(1);
        }
    };

    if let Some(error) = response.error {
        eprintln!("unitctl: {}", error.message);
        std::process::exit(1);
    }

    match response.result {
        Some(Value::Null) | None => {}
        Some(Value::String(text)) => print!("{text}"),
        Some(Value::Array(rows)) => {
            for row in rows {
                println!("{}", render_row(&row));
            }
        }
        Some(other) => println!("{}", render_row(&other)),
    }
}

/// Render an object as aligned `key=value` pairs, everything else as JSON.
fn render_row(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}
