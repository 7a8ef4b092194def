//! Commands understood on the control socket, their execution against the
//! manager, and the socket server the event loop services.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use log::{debug, trace, warn};
use serde_json::{json, Value};

use crate::control::jsonrpc2::{
    self, Call, Response, INVALID_PARAMS, METHOD_NOT_FOUND, OPERATION_FAILED, PARSE_ERROR,
};
use crate::jobs::{BusEvent, JobKind, JobMode};
use crate::manager::{Manager, Objective, VERSION};
use crate::units::LoadState;

#[derive(Debug)]
pub enum Command {
    GetUnit(String),
    LoadUnit(String),
    StartUnit(String, JobMode),
    StopUnit(String, JobMode),
    ReloadUnit(String, JobMode),
    RestartUnit(String, JobMode),
    TryRestartUnit(String, JobMode),
    GetJob(u32),
    ClearJobs,
    ListUnits,
    ListJobs,
    Subscribe,
    Unsubscribe,
    Dump,
    CreateSnapshot(Option<String>, bool),
    Reload,
    Reexecute,
    Exit,
    SetEnvironment(Vec<String>),
    UnsetEnvironment(Vec<String>),
    Properties,
}

#[derive(Debug)]
pub enum ParseError {
    MethodNotFound(String),
    ParamsInvalid(String),
}

fn name_param(call: &Call) -> Result<String, ParseError> {
    match &call.params {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Array(arr)) if !arr.is_empty() => arr[0]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ParseError::ParamsInvalid("unit name must be a string".into())),
        _ => Err(ParseError::ParamsInvalid(
            "params must be a unit name".into(),
        )),
    }
}

fn name_and_mode(call: &Call) -> Result<(String, JobMode), ParseError> {
    match &call.params {
        Some(Value::String(s)) => Ok((s.clone(), JobMode::Replace)),
        Some(Value::Array(arr)) if !arr.is_empty() => {
            let name = arr[0]
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| ParseError::ParamsInvalid("unit name must be a string".into()))?;
            let mode = match arr.get(1) {
                None => JobMode::Replace,
                Some(Value::String(mode)) => JobMode::from_str(mode).ok_or_else(|| {
                    ParseError::ParamsInvalid(format!("unknown job mode: {mode}"))
                })?,
                Some(_) => {
                    return Err(ParseError::ParamsInvalid("mode must be a string".into()));
                }
            };
            Ok((name, mode))
        }
        _ => Err(ParseError::ParamsInvalid(
            "params must be [name, mode?]".into(),
        )),
    }
}

fn string_list(call: &Call) -> Result<Vec<String>, ParseError> {
    match &call.params {
        Some(Value::Array(arr)) => arr
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| ParseError::ParamsInvalid("expected strings".into()))
            })
            .collect(),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        _ => Err(ParseError::ParamsInvalid("params must be strings".into())),
    }
}

pub fn parse_command(call: &Call) -> Result<Command, ParseError> {
    let command = match call.method.as_str() {
        "get-unit" => Command::GetUnit(name_param(call)?),
        "load-unit" => Command::LoadUnit(name_param(call)?),
        "start-unit" => {
            let (name, mode) = name_and_mode(call)?;
            Command::StartUnit(name, mode)
        }
        "stop-unit" => {
            let (name, mode) = name_and_mode(call)?;
            Command::StopUnit(name, mode)
        }
        "reload-unit" => {
            let (name, mode) = name_and_mode(call)?;
            Command::ReloadUnit(name, mode)
        }
        "restart-unit" => {
            let (name, mode) = name_and_mode(call)?;
            Command::RestartUnit(name, mode)
        }
        "try-restart-unit" => {
            let (name, mode) = name_and_mode(call)?;
            Command::TryRestartUnit(name, mode)
        }
        "get-job" => match &call.params {
            Some(Value::Number(n)) => Command::GetJob(n.as_u64().unwrap_or(0) as u32),
            _ => {
                return Err(ParseError::ParamsInvalid("params must be a job id".into()));
            }
        },
        "clear-jobs" => Command::ClearJobs,
        "list-units" => Command::ListUnits,
        "list-jobs" => Command::ListJobs,
        "subscribe" => Command::Subscribe,
        "unsubscribe" => Command::Unsubscribe,
        "dump" => Command::Dump,
        "create-snapshot" => match &call.params {
            None => Command::CreateSnapshot(None, false),
            Some(Value::String(s)) => Command::CreateSnapshot(Some(s.clone()), false),
            Some(Value::Array(arr)) => {
                let name = arr.first().and_then(|v| v.as_str()).map(str::to_owned);
                let cleanup = arr.get(1).and_then(Value::as_bool).unwrap_or(false);
                Command::CreateSnapshot(name, cleanup)
            }
            Some(_) => {
                return Err(ParseError::ParamsInvalid(
                    "params must be [name?, cleanup?]".into(),
                ));
            }
        },
        "reload" => Command::Reload,
        "reexecute" => Command::Reexecute,
        "exit" => Command::Exit,
        "set-environment" => Command::SetEnvironment(string_list(call)?),
        "unset-environment" => Command::UnsetEnvironment(string_list(call)?),
        "properties" => Command::Properties,
        other => return Err(ParseError::MethodNotFound(other.to_owned())),
    };
    Ok(command)
}

/// What execution produced: an immediate reply, or a reply to send only
/// after the requested objective (reload, re-exec, exit) has been acted on.
pub enum Outcome {
    Reply(Value),
    Failed(String),
    AfterObjective(Objective, Value),
}

fn unit_row(manager: &Manager, unit: &crate::units::Unit) -> Value {
    let (job_id, job_kind) = unit
        .job
        .and_then(|id| manager.jobs.get(id))
        .map(|job| (json!(job.id), json!(job.kind.as_str())))
        .unwrap_or((Value::Null, Value::Null));
    json!({
        "id": unit.id.name,
        "description": unit.description,
        "load": unit.load_state.as_str(),
        "active": unit.active_state().as_str(),
        "sub": unit.sub_state(),
        "job-id": job_id,
        "job-type": job_kind,
    })
}

fn enqueue(
    manager: &mut Manager,
    kind: JobKind,
    name: &str,
    mode: JobMode,
    manual_stop: bool,
) -> Outcome {
    // Manual-start/stop refusals only apply to requests from the bus.
    if let Some(unit) = manager.registry.get(name) {
        if !manual_stop && unit.config.refuse_manual_start {
            return Outcome::Failed(format!("unit {name} refuses manual start"));
        }
        if manual_stop && unit.config.refuse_manual_stop {
            return Outcome::Failed(format!("unit {name} refuses manual stop"));
        }
    }
    match manager.enqueue_job(kind, name, mode, false) {
        Ok(job_id) => Outcome::Reply(json!({ "job": job_id })),
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

pub fn execute_command(
    command: Command,
    manager: &mut Manager,
    subscribed: &mut bool,
) -> Outcome {
    trace!("control command: {command:?}");
    match command {
        Command::GetUnit(name) => match manager.registry.get(&name) {
            Some(unit) => Outcome::Reply(unit_row(manager, unit)),
            None => Outcome::Failed(format!("unit {name} not loaded")),
        },
        Command::LoadUnit(name) => match manager.load_unit(&name) {
            Ok(id) => {
                let unit = manager.registry.get_by_id(&id).unwrap();
                Outcome::Reply(unit_row(manager, unit))
            }
            Err(e) => Outcome::Failed(e),
        },
        Command::StartUnit(name, mode) => {
            enqueue(manager, JobKind::Start, &name, mode, false)
        }
        Command::StopUnit(name, mode) => enqueue(manager, JobKind::Stop, &name, mode, true),
        Command::ReloadUnit(name, mode) => {
            enqueue(manager, JobKind::Reload, &name, mode, false)
        }
        Command::RestartUnit(name, mode) => {
            enqueue(manager, JobKind::Restart, &name, mode, false)
        }
        Command::TryRestartUnit(name, mode) => {
            enqueue(manager, JobKind::TryRestart, &name, mode, false)
        }
        Command::GetJob(id) => match manager.jobs.get(id) {
            Some(job) => Outcome::Reply(json!({
                "id": job.id,
                "unit": job.unit.name,
                "job-type": job.kind.as_str(),
                "state": job.state.as_str(),
            })),
            None => Outcome::Failed(format!("no job with id {id}")),
        },
        Command::ClearJobs => {
            manager.clear_jobs();
            Outcome::Reply(Value::Null)
        }
        Command::ListUnits => {
            let mut ids = manager.registry.ids();
            ids.sort();
            let rows: Vec<Value> = ids
                .iter()
                .filter_map(|id| manager.registry.get_by_id(id))
                .filter(|u| u.load_state != LoadState::Merged)
                .map(|u| unit_row(manager, u))
                .collect();
            Outcome::Reply(Value::Array(rows))
        }
        Command::ListJobs => {
            let mut job_ids = manager.jobs.ids();
            job_ids.sort_unstable();
            let rows: Vec<Value> = job_ids
                .iter()
                .filter_map(|id| manager.jobs.get(*id))
                .map(|job| {
                    json!({
                        "id": job.id,
                        "unit": job.unit.name,
                        "job-type": job.kind.as_str(),
                        "state": job.state.as_str(),
                    })
                })
                .collect();
            Outcome::Reply(Value::Array(rows))
        }
        Command::Subscribe => {
            *subscribed = true;
            Outcome::Reply(Value::Null)
        }
        Command::Unsubscribe => {
            *subscribed = false;
            Outcome::Reply(Value::Null)
        }
        Command::Dump => Outcome::Reply(Value::String(manager.dump())),
        Command::CreateSnapshot(name, cleanup) => {
            match manager.create_snapshot(name.as_deref(), cleanup) {
                Ok(id) => Outcome::Reply(json!({ "unit": id.name })),
                Err(e) => Outcome::Failed(e),
            }
        }
        // The reply is held back until after the objective is acted on, so
        // a reload reply means the rescan actually happened.
        Command::Reload => Outcome::AfterObjective(Objective::Reload, Value::Null),
        Command::Reexecute => Outcome::AfterObjective(Objective::Reexecute, Value::Null),
        Command::Exit => Outcome::AfterObjective(Objective::Exit, Value::Null),
        Command::SetEnvironment(assignments) => {
            manager.set_environment(&assignments);
            Outcome::Reply(Value::Null)
        }
        Command::UnsetEnvironment(names) => {
            manager.unset_environment(&names);
            Outcome::Reply(Value::Null)
        }
        Command::Properties => Outcome::Reply(json!({
            "Version": VERSION,
            "RunningAs": manager.config.running_as.as_str(),
            "BootTimestamp": manager.boot_timestamp.to_rfc3339(),
            "LogLevel": manager.config.log.level.to_string(),
            "LogTarget": manager.config.log.target.as_str(),
            "NNames": manager.registry.n_names(),
            "NJobs": manager.jobs.len(),
            "Environment": manager
                .environment
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>(),
        })),
    }
}

pub fn bus_event_notification(event: &BusEvent) -> Call {
    match event {
        BusEvent::UnitNew { id } => {
            jsonrpc2::notification("unit-new", json!({ "id": id.name }))
        }
        BusEvent::UnitRemoved { id } => {
            jsonrpc2::notification("unit-removed", json!({ "id": id.name }))
        }
        BusEvent::JobNew { id, unit } => {
            jsonrpc2::notification("job-new", json!({ "id": id, "unit": unit.name }))
        }
        BusEvent::JobRemoved { id, unit, result } => jsonrpc2::notification(
            "job-removed",
            json!({ "id": id, "unit": unit.name, "result": result.as_str() }),
        ),
    }
}

struct Client {
    stream: UnixStream,
    buffer: Vec<u8>,
    subscribed: bool,
    /// Replies deferred until an objective completes.
    deferred: Vec<(Option<Value>, Value)>,
    dead: bool,
}

/// The socket server. The event loop polls the listener and client fds and
/// calls [`ControlServer::service`] when any are readable.
pub struct ControlServer {
    listener: Option<UnixListener>,
    clients: Vec<Client>,
}

impl ControlServer {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener: Some(listener),
            clients: Vec::new(),
        })
    }

    /// A server with no socket; used by `--test` runs.
    pub fn disabled() -> Self {
        Self {
            listener: None,
            clients: Vec::new(),
        }
    }

    pub fn fds(&self) -> Vec<i32> {
        use std::os::unix::io::AsRawFd;
        let mut fds = Vec::new();
        if let Some(listener) = &self.listener {
            fds.push(listener.as_raw_fd());
        }
        for client in &self.clients {
            fds.push(client.stream.as_raw_fd());
        }
        fds
    }

    /// Accept connections, read requests, execute them, write replies.
    /// Returns the objective if some command requested one.
    pub fn service(&mut self, manager: &mut Manager) -> Option<Objective> {
        let mut objective = None;

        if let Some(listener) = &self.listener {
            loop {
                match listener.accept() {
                    Ok((stream, _addr)) => {
                        if stream.set_nonblocking(true).is_ok() {
                            debug!("control client connected");
                            self.clients.push(Client {
                                stream,
                                buffer: Vec::new(),
                                subscribed: false,
                                deferred: Vec::new(),
                                dead: false,
                            });
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("control accept failed: {e}");
                        break;
                    }
                }
            }
        }

        for client in &mut self.clients {
            let mut chunk = [0u8; 4096];
            loop {
                match client.stream.read(&mut chunk) {
                    Ok(0) => {
                        client.dead = true;
                        break;
                    }
                    Ok(n) => client.buffer.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        client.dead = true;
                        break;
                    }
                }
            }

            while let Some(pos) = client.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = client.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Call>(line) {
                    Err(e) => Some(Response::error(None, PARSE_ERROR, e.to_string())),
                    Ok(call) => {
                        let id = call.id.clone();
                        match parse_command(&call) {
                            Err(ParseError::MethodNotFound(method)) => Some(Response::error(
                                id,
                                METHOD_NOT_FOUND,
                                format!("unknown method: {method}"),
                            )),
                            Err(ParseError::ParamsInvalid(message)) => {
                                Some(Response::error(id, INVALID_PARAMS, message))
                            }
                            Ok(command) => {
                                match execute_command(command, manager, &mut client.subscribed) {
                                    Outcome::Reply(value) => Some(Response::result(id, value)),
                                    Outcome::Failed(message) => {
                                        Some(Response::error(id, OPERATION_FAILED, message))
                                    }
                                    Outcome::AfterObjective(requested, value) => {
                                        client.deferred.push((id, value));
                                        objective = Some(requested);
                                        None
                                    }
                                }
                            }
                        }
                    }
                };
                if let Some(response) = response {
                    send_json(&mut client.stream, &response);
                }
            }
        }
        self.clients.retain(|c| !c.dead);

        objective
    }

    /// Send deferred replies; called after the manager acted on an
    /// objective (e.g. the reload finished).
    pub fn flush_deferred(&mut self) {
        for client in &mut self.clients {
            for (id, value) in std::mem::take(&mut client.deferred) {
                let response = Response::result(id, value);
                send_json(&mut client.stream, &response);
            }
        }
    }

    /// Broadcast pending bus events to subscribers.
    pub fn flush_events(&mut self, manager: &mut Manager) {
        if manager.bus_events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut manager.bus_events);
        for event in &events {
            let call = bus_event_notification(event);
            for client in &mut self.clients {
                if client.subscribed {
                    send_json(&mut client.stream, &call);
                }
            }
        }
    }
}

fn send_json<T: serde::Serialize>(stream: &mut UnixStream, value: &T) {
    match serde_json::to_string(value) {
        Ok(mut line) => {
            line.push('\n');
            if let Err(e) = stream.write_all(line.as_bytes()) {
                trace!("control write failed: {e}");
            }
        }
        Err(e) => warn!("cannot serialize control message: {e}"),
    }
}
