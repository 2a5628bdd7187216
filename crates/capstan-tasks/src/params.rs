//! Task input parsing.
//!
//! Task calls accept JSON-shaped maps; the `action` field selects the
//! operation. This is the only wire-level surface kept stable for
//! workflow authors.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, TaskError};

/// The selected task operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start a child process on the current server.
    Start,
    /// Start a process on an external server.
    StartExternal,
    /// Fork the current process.
    Fork,
    /// Kill processes.
    Kill,
}

impl Action {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_uppercase().as_str() {
            "START" => Ok(Action::Start),
            "STARTEXTERNAL" => Ok(Action::StartExternal),
            "FORK" => Ok(Action::Fork),
            "KILL" => Ok(Action::Kill),
            other => Err(TaskError::InvalidParams(format!(
                "unsupported action type: {}",
                other
            ))),
        }
    }
}

/// Parameters for START and STARTEXTERNAL.
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    /// Target organization name.
    pub org: Option<String>,
    /// Target project name.
    pub project: Option<String>,
    /// Repository to start from.
    pub repo: Option<String>,
    /// Workflow entry point.
    pub entry_point: Option<String>,
    /// Process arguments.
    pub arguments: Map<String, Value>,
    /// Active configuration profiles.
    pub active_profiles: Vec<String>,
    /// Wait for the child to finish.
    pub sync: bool,
    /// When synchronous, suspend instead of blocking.
    pub suspend: bool,
    /// Downgrade child failures from fault to warning.
    pub ignore_failures: bool,
    /// Output variables to collect from the child.
    pub out_vars: Vec<String>,
    /// Base URL of the external server (STARTEXTERNAL only).
    pub base_url: Option<String>,
}

/// One fork group.
#[derive(Debug, Clone)]
pub struct ForkStartParams {
    /// Child entry point.
    pub entry_point: String,
    /// Number of instances to start.
    pub instances: u32,
    /// Process arguments.
    pub arguments: Map<String, Value>,
    /// Output variables to collect.
    pub out_vars: Vec<String>,
}

/// Parameters for FORK.
#[derive(Debug, Clone)]
pub struct ForkParams {
    /// The fork groups.
    pub forks: Vec<ForkStartParams>,
    /// Wait for the children to finish.
    pub sync: bool,
    /// When synchronous, suspend instead of blocking.
    pub suspend: bool,
    /// Downgrade child failures from fault to warning.
    pub ignore_failures: bool,
}

/// Parameters for KILL.
#[derive(Debug, Clone)]
pub struct KillParams {
    /// The processes to kill.
    pub ids: Vec<Uuid>,
    /// Wait for the kills to land.
    pub sync: bool,
}

/// A parsed task call.
#[derive(Debug, Clone)]
pub enum TaskParams {
    /// Start a child process.
    Start(StartParams),
    /// Start an external process.
    StartExternal(StartParams),
    /// Fork the current process.
    Fork(ForkParams),
    /// Kill processes.
    Kill(KillParams),
}

fn get_str(input: &Map<String, Value>, key: &str) -> Option<String> {
    input.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_bool(input: &Map<String, Value>, key: &str, default: bool) -> bool {
    input.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn get_map(input: &Map<String, Value>, key: &str) -> Map<String, Value> {
    match input.get(key) {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    }
}

fn get_string_list(input: &Map<String, Value>, key: &str) -> Vec<String> {
    match input.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn get_uuid_list(input: &Map<String, Value>, keys: &[&str]) -> Result<Vec<Uuid>> {
    let mut out = Vec::new();
    for key in keys {
        match input.get(*key) {
            Some(Value::String(s)) => {
                out.push(parse_uuid(s)?);
            }
            Some(Value::Array(items)) => {
                for item in items {
                    let s = item.as_str().ok_or_else(|| {
                        TaskError::InvalidParams(format!("'{}' must contain strings", key))
                    })?;
                    out.push(parse_uuid(s)?);
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| TaskError::InvalidParams(format!("invalid process id '{}': {}", raw, e)))
}

fn parse_start(input: &Map<String, Value>) -> StartParams {
    StartParams {
        org: get_str(input, "org"),
        project: get_str(input, "project"),
        repo: get_str(input, "repo"),
        entry_point: get_str(input, "entryPoint"),
        arguments: get_map(input, "arguments"),
        active_profiles: get_string_list(input, "activeProfiles"),
        sync: get_bool(input, "sync", false),
        suspend: get_bool(input, "suspend", false),
        ignore_failures: get_bool(input, "ignoreFailures", false),
        out_vars: get_string_list(input, "outVars"),
        base_url: get_str(input, "baseUrl"),
    }
}

impl TaskParams {
    /// Parse a task call from its JSON-shaped input map.
    pub fn from_map(input: &Map<String, Value>) -> Result<Self> {
        let action = get_str(input, "action")
            .ok_or_else(|| TaskError::InvalidParams("'action' is required".to_string()))?;

        match Action::parse(&action)? {
            Action::Start => {
                let params = parse_start(input);
                if params.project.is_none() && params.entry_point.is_none() {
                    return Err(TaskError::InvalidParams(
                        "'project' and/or 'entryPoint' are required".to_string(),
                    ));
                }
                Ok(TaskParams::Start(params))
            }
            Action::StartExternal => {
                let params = parse_start(input);
                if params.base_url.is_none() {
                    return Err(TaskError::InvalidParams(
                        "'baseUrl' is required for STARTEXTERNAL".to_string(),
                    ));
                }
                Ok(TaskParams::StartExternal(params))
            }
            Action::Fork => {
                let raw_forks = match input.get("forks") {
                    Some(Value::Array(items)) => items.clone(),
                    _ => {
                        // A single fork may be specified inline.
                        vec![Value::Object(input.clone())]
                    }
                };

                let mut forks = Vec::with_capacity(raw_forks.len());
                for raw in &raw_forks {
                    let Value::Object(fork) = raw else {
                        return Err(TaskError::InvalidParams(
                            "'forks' must contain objects".to_string(),
                        ));
                    };
                    let entry_point = get_str(fork, "entryPoint").ok_or_else(|| {
                        TaskError::InvalidParams("fork 'entryPoint' is required".to_string())
                    })?;
                    let instances = fork
                        .get("instances")
                        .and_then(Value::as_u64)
                        .unwrap_or(1);
                    if instances == 0 {
                        return Err(TaskError::InvalidParams(
                            "fork 'instances' must be at least 1".to_string(),
                        ));
                    }
                    forks.push(ForkStartParams {
                        entry_point,
                        instances: instances as u32,
                        arguments: get_map(fork, "arguments"),
                        out_vars: get_string_list(fork, "outVars"),
                    });
                }

                Ok(TaskParams::Fork(ForkParams {
                    forks,
                    sync: get_bool(input, "sync", false),
                    suspend: get_bool(input, "suspend", false),
                    ignore_failures: get_bool(input, "ignoreFailures", false),
                }))
            }
            Action::Kill => {
                let ids = get_uuid_list(input, &["instanceId", "instanceIds"])?;
                if ids.is_empty() {
                    return Err(TaskError::InvalidParams(
                        "'instanceId' or 'instanceIds' is required".to_string(),
                    ));
                }
                Ok(TaskParams::Kill(KillParams {
                    ids,
                    sync: get_bool(input, "sync", false),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn missing_action_rejected() {
        let err = TaskParams::from_map(&obj(json!({}))).unwrap_err();
        assert!(err.to_string().contains("'action' is required"));
    }

    #[test]
    fn unknown_action_rejected() {
        let err = TaskParams::from_map(&obj(json!({"action": "DANCE"}))).unwrap_err();
        assert!(err.to_string().contains("unsupported action type"));
    }

    #[test]
    fn start_requires_project_or_entry_point() {
        let err = TaskParams::from_map(&obj(json!({"action": "start"}))).unwrap_err();
        assert!(err.to_string().contains("required"));

        let params = TaskParams::from_map(&obj(json!({
            "action": "START",
            "entryPoint": "main",
            "arguments": {"x": 1},
            "sync": true
        })))
        .unwrap();

        match params {
            TaskParams::Start(p) => {
                assert_eq!(p.entry_point.as_deref(), Some("main"));
                assert!(p.sync);
                assert!(!p.suspend);
                assert_eq!(p.arguments.get("x"), Some(&json!(1)));
            }
            other => panic!("expected Start, got {:?}", other),
        }
    }

    #[test]
    fn start_external_requires_base_url() {
        let err = TaskParams::from_map(&obj(json!({
            "action": "STARTEXTERNAL",
            "entryPoint": "main"
        })))
        .unwrap_err();
        assert!(err.to_string().contains("baseUrl"));
    }

    #[test]
    fn fork_groups_parsed() {
        let params = TaskParams::from_map(&obj(json!({
            "action": "FORK",
            "forks": [
                {"entryPoint": "a", "instances": 3},
                {"entryPoint": "b", "outVars": ["result"]}
            ],
            "sync": true,
            "suspend": true
        })))
        .unwrap();

        match params {
            TaskParams::Fork(f) => {
                assert_eq!(f.forks.len(), 2);
                assert_eq!(f.forks[0].instances, 3);
                assert_eq!(f.forks[1].instances, 1);
                assert_eq!(f.forks[1].out_vars, vec!["result"]);
                assert!(f.sync && f.suspend);
            }
            other => panic!("expected Fork, got {:?}", other),
        }
    }

    #[test]
    fn inline_fork_without_forks_array() {
        let params = TaskParams::from_map(&obj(json!({
            "action": "FORK",
            "entryPoint": "child"
        })))
        .unwrap();

        match params {
            TaskParams::Fork(f) => {
                assert_eq!(f.forks.len(), 1);
                assert_eq!(f.forks[0].entry_point, "child");
            }
            other => panic!("expected Fork, got {:?}", other),
        }
    }

    #[test]
    fn kill_accepts_single_and_multiple_ids() {
        let id = Uuid::new_v4();
        let params = TaskParams::from_map(&obj(json!({
            "action": "KILL",
            "instanceId": id.to_string(),
            "sync": true
        })))
        .unwrap();

        match params {
            TaskParams::Kill(k) => {
                assert_eq!(k.ids, vec![id]);
                assert!(k.sync);
            }
            other => panic!("expected Kill, got {:?}", other),
        }

        let err = TaskParams::from_map(&obj(json!({
            "action": "KILL",
            "instanceId": "not-a-uuid"
        })))
        .unwrap_err();
        assert!(err.to_string().contains("invalid process id"));
    }
}
