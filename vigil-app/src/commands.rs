//! Line-oriented control console.
//!
//! Each input line is one command; each reply is one JSON object on one line:
//! `{"ok":true,"data":...}` or `{"ok":false,"error":"..."}`.

use std::time::Duration;

use serde_json::{json, Value};
use vigil_core::capture::list_input_devices;
use vigil_core::{IncidentKind, Period};

use crate::state::AppState;

const DEFAULT_HISTORY_MINUTES: u64 = 60;
const DEFAULT_ERROR_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Current,
    History { minutes: u64 },
    Stats(Period),
    Classify,
    Status,
    Errors { limit: usize, kind: Option<IncidentKind> },
    Devices,
    Start,
    Stop,
    Delete(i64),
    Prune,
    ResetDiagnostics,
    Help,
    Quit,
}

pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".into());
    };
    let head = head.to_ascii_lowercase();
    let arg = words.next();
    let takes_arg = matches!(head.as_str(), "history" | "stats" | "errors" | "delete");
    let extra = if takes_arg { words.next() } else { arg };
    if let Some(extra) = extra {
        if head != "errors" {
            return Err(format!("unexpected argument '{extra}'"));
        }
    }

    match head.as_str() {
        "current" => Ok(Command::Current),
        "history" => {
            let minutes = match arg {
                Some(v) => v
                    .parse::<u64>()
                    .ok()
                    .filter(|m| *m > 0)
                    .ok_or_else(|| format!("invalid minutes '{v}'"))?,
                None => DEFAULT_HISTORY_MINUTES,
            };
            Ok(Command::History { minutes })
        }
        "stats" => {
            let period = match arg {
                Some(v) => v.parse::<Period>().map_err(|e| e.to_string())?,
                None => Period::Day,
            };
            Ok(Command::Stats(period))
        }
        "classify" => Ok(Command::Classify),
        "status" => Ok(Command::Status),
        "errors" => {
            let mut limit = DEFAULT_ERROR_LIMIT;
            let mut kind = None;
            for v in line.split_whitespace().skip(1) {
                if let Ok(n) = v.parse::<usize>() {
                    limit = n.max(1);
                } else {
                    kind = Some(v.parse::<IncidentKind>()?);
                }
            }
            Ok(Command::Errors { limit, kind })
        }
        "devices" => Ok(Command::Devices),
        "start" => Ok(Command::Start),
        "stop" => Ok(Command::Stop),
        "delete" => {
            let v = arg.ok_or("delete needs a record id")?;
            let id = v.parse::<i64>().map_err(|_| format!("invalid id '{v}'"))?;
            Ok(Command::Delete(id))
        }
        "prune" => Ok(Command::Prune),
        "reset-diagnostics" => Ok(Command::ResetDiagnostics),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}' (try 'help')")),
    }
}

pub async fn execute(state: &AppState, command: Command) -> Result<Value, String> {
    let engine = &state.engine;
    match command {
        Command::Current => Ok(json!(engine.current_activity())),
        Command::History { minutes } => {
            let records = engine
                .recent_history(Duration::from_secs(minutes * 60))
                .map_err(|e| e.to_string())?;
            Ok(json!(records))
        }
        Command::Stats(period) => {
            let stats = engine.stats(period).map_err(|e| e.to_string())?;
            Ok(json!({ "period": period.as_str(), "stats": stats }))
        }
        Command::Classify => {
            let classification = engine
                .force_classification()
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!(classification))
        }
        Command::Status => Ok(json!({
            "uptimeSecs": state.uptime_secs(),
            "settingsPath": state.settings_path,
            "storedRecords": state.store.count().unwrap_or(0),
            "engine": engine.status_report(),
        })),
        Command::Errors { limit, kind } => Ok(json!(engine.recent_errors(limit, kind))),
        Command::Devices => {
            let preference = state.settings.lock().device_preference;
            Ok(json!(list_input_devices(preference)))
        }
        Command::Start => {
            engine.start().map_err(|e| e.to_string())?;
            Ok(json!({ "status": engine.status() }))
        }
        Command::Stop => {
            engine.stop().await.map_err(|e| e.to_string())?;
            Ok(json!({ "status": engine.status() }))
        }
        Command::Delete(id) => {
            let deleted = state.store.delete(id)?;
            Ok(json!({ "id": id, "deleted": deleted }))
        }
        Command::Prune => {
            let retention_days = state.settings.lock().retention_days;
            let removed = state.store.prune(retention_days)?;
            Ok(json!({ "retentionDays": retention_days, "removed": removed }))
        }
        Command::ResetDiagnostics => {
            engine.reset_diagnostics();
            Ok(json!(engine.diagnostics_snapshot()))
        }
        Command::Help => Ok(json!([
            "current",
            "history [minutes]",
            "stats [day|week|month]",
            "classify",
            "status",
            "errors [limit] [kind]",
            "devices",
            "start",
            "stop",
            "delete <id>",
            "prune",
            "reset-diagnostics",
            "quit",
        ])),
        Command::Quit => Ok(json!("bye")),
    }
}

pub fn reply(result: Result<Value, String>) -> String {
    let value = match result {
        Ok(data) => json!({ "ok": true, "data": data }),
        Err(error) => json!({ "ok": false, "error": error }),
    };
    value.to_string()
}
