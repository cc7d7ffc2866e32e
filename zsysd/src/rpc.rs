use serde::{Deserialize, Serialize};

/// One RPC call. Every variant is something the State Model or Boot & GC
/// Controller can execute directly against the cached graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SaveSystemState { machine_id: String },
    SaveUserState { machine_id: String, user: String },
    RemoveSystemState { machine_id: String, state_id: String, force: bool },
    RemoveUserState { machine_id: String, user: String, state_id: String, force: bool },
    DissociateUser { machine_id: String, user: String },
    CreateUserData { machine_id: String, user: String, home: String },
    ChangeHome { home: String, new_home: String },
    EnsureBoot,
    CommitBoot { mounted_root: String },
    Gc { machine_id: String },
}

/// Server-side streaming response: a request produces zero or more log
/// lines followed by exactly one result record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Log(LogRecord),
    Result(ResultRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultRecord {
    Ok { detail: serde_json::Value },
    Err { kind: WireErrorKind, message: String },
}

/// The wire mapping of `ZsysError`'s variants, per the error-handling
/// propagation policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    NotFound,
    Conflict,
    IntegrityViolation,
    PoolError,
    PermissionDenied,
    Cancelled,
    Usage,
}

impl From<&libzsys::error::ZsysError> for WireErrorKind {
    fn from(err: &libzsys::error::ZsysError) -> Self {
        use libzsys::error::ZsysError::*;
        match err {
            NotFound(_) => WireErrorKind::NotFound,
            Conflict(_, _) => WireErrorKind::Conflict,
            IntegrityViolation(_) => WireErrorKind::IntegrityViolation,
            PoolError(_) => WireErrorKind::PoolError,
            PermissionDenied(_) => WireErrorKind::PermissionDenied,
            Cancelled => WireErrorKind::Cancelled,
            Usage(_) => WireErrorKind::Usage,
        }
    }
}

impl ResultRecord {
    pub fn from_result<T: Serialize>(result: Result<T, libzsys::error::ZsysError>) -> Self {
        match result {
            Ok(value) => ResultRecord::Ok {
                detail: serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            },
            Err(err) => ResultRecord::Err {
                kind: WireErrorKind::from(&err),
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let request = Request::RemoveSystemState {
            machine_id: "init".to_string(),
            state_id: "abcdef".to_string(),
            force: true,
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Request::RemoveSystemState { machine_id, state_id, force } => {
                assert_eq!(machine_id, "init");
                assert_eq!(state_id, "abcdef");
                assert!(force);
            }
            _ => panic!("unexpected variant"),
        }
    }

    #[test]
    fn error_result_carries_wire_kind() {
        let err = libzsys::error::ZsysError::NotFound("rpool/ROOT/ubuntu_init".to_string());
        let record = ResultRecord::from_result::<()>(Err(err));
        match record {
            ResultRecord::Err { kind, .. } => assert_eq!(kind, WireErrorKind::NotFound),
            _ => panic!("expected an error result"),
        }
    }
}
