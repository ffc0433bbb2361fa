//! The command/response control plane that F-engine and ARX daemons listen on
use crate::common::BOARDS;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Default location of the etcd v3 JSON gateway
pub const DEFAULT_ETCD_ENDPOINT: &str = "http://etcdv3service.sas.pvt:2379";
/// How often we look for responses while waiting on a command
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Status string daemons report on success
const STATUS_NORMAL: &str = "normal";

#[derive(thiserror::Error, Debug)]
/// Errors that can be produced talking to the control plane
pub enum ControlError {
    #[error("HTTP transport error - {0}")]
    Http(#[from] reqwest::Error),
    #[error("Couldn't (de)serialize a control message - {0}")]
    Json(#[from] serde_json::Error),
    #[error("Gateway returned invalid base64 - {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Couldn't read the system clock - {0}")]
    Clock(#[from] hifitime::Errors),
    #[error("Unit {unit} reported status {status:?}: {response}")]
    Remote {
        unit: usize,
        status: String,
        response: String,
    },
    #[error("Unit {unit} didn't respond to {block}.{method}")]
    NoResponse {
        unit: usize,
        block: String,
        method: String,
    },
}

/// Who a command is addressed to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every unit listening (selector 0)
    All,
    /// A single unit
    Unit(usize),
}

impl Target {
    /// The numeric selector daemons key their commands on
    #[must_use]
    pub fn selector(self) -> usize {
        match self {
            Target::All => 0,
            Target::Unit(n) => n,
        }
    }
}

/// A single unit's answer to a command
pub type Reply = Result<Value, ControlError>;
/// Every answer to a command, keyed by unit number
pub type Responses = BTreeMap<usize, Reply>;

/// Anything that can deliver block method calls to remote units
pub trait ControlPlane {
    /// Call `block.method(**kwargs)` on `target`, waiting up to `timeout` for
    /// `n_response_expected` replies. Units that never answered are absent
    /// from the result.
    fn send_command(
        &self,
        target: Target,
        block: &str,
        method: &str,
        kwargs: Value,
        timeout: Duration,
        n_response_expected: usize,
    ) -> Result<Responses, ControlError>;

    /// Call a method on a single unit and return its answer
    fn call(
        &self,
        unit: usize,
        block: &str,
        method: &str,
        kwargs: Value,
        timeout: Duration,
    ) -> Reply {
        let mut responses =
            self.send_command(Target::Unit(unit), block, method, kwargs, timeout, 1)?;
        responses
            .remove(&unit)
            .unwrap_or_else(|| {
                Err(ControlError::NoResponse {
                    unit,
                    block: block.to_owned(),
                    method: method.to_owned(),
                })
            })
    }
}

impl<T: ControlPlane + ?Sized> ControlPlane for &T {
    fn send_command(
        &self,
        target: Target,
        block: &str,
        method: &str,
        kwargs: Value,
        timeout: Duration,
        n_response_expected: usize,
    ) -> Result<Responses, ControlError> {
        (**self).send_command(target, block, method, kwargs, timeout, n_response_expected)
    }
}

#[derive(Serialize)]
struct Command<'a> {
    cmd: &'a str,
    val: CommandVal<'a>,
    id: &'a str,
}

#[derive(Serialize)]
struct CommandVal<'a> {
    block: &'a str,
    timestamp: f64,
    kwargs: &'a Value,
}

#[derive(Deserialize)]
struct Response {
    id: String,
    val: ResponseVal,
}

#[derive(Deserialize)]
struct ResponseVal {
    status: String,
    #[serde(default)]
    response: Value,
}

impl Response {
    fn into_reply(self, unit: usize) -> Reply {
        if self.val.status == STATUS_NORMAL {
            Ok(self.val.response)
        } else {
            Err(ControlError::Remote {
                unit,
                status: self.val.status,
                response: self.val.response.to_string(),
            })
        }
    }
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

fn b64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// The smallest key greater than every key starting with `prefix`
fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff (or empty), which etcd spells as a single null byte
    vec![0]
}

/// Fold one poll of the response keys into `responses`. Keys that aren't
/// `<resp_root><unit>`, answers to other commands and malformed values are
/// ignored, as are units that already answered.
fn collect_responses(
    kvs: Vec<(String, String)>,
    id: &str,
    resp_root: &str,
    responses: &mut Responses,
) {
    for (key, value) in kvs {
        let Some(unit) = key
            .strip_prefix(resp_root)
            .and_then(|s| s.parse::<usize>().ok())
        else {
            continue;
        };
        if responses.contains_key(&unit) {
            continue;
        }
        // Stale answers to older commands stay in the store, so match on id
        match serde_json::from_str::<Response>(&value) {
            Ok(resp) if resp.id == id => {
                responses.insert(unit, resp.into_reply(unit));
            }
            Ok(_) => (),
            Err(e) => debug!("Ignoring malformed response at {key} - {e}"),
        }
    }
}

/// Run `poll` until `n_response_expected` units have answered or `timeout`
/// passes, returning whatever arrived
fn wait_for_responses(
    what: &str,
    timeout: Duration,
    n_response_expected: usize,
    mut poll: impl FnMut(&mut Responses) -> Result<(), ControlError>,
) -> Result<Responses, ControlError> {
    let deadline = Instant::now() + timeout;
    let mut responses = Responses::new();
    loop {
        poll(&mut responses)?;
        if responses.len() >= n_response_expected {
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                "{what} timed out after {timeout:?} with {} of {n_response_expected} responses",
                responses.len()
            );
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(responses)
}

/// Control plane backed by etcd, spoken to through its v3 JSON gateway.
///
/// Commands are written to `<cmd_root><selector>`, and each daemon writes its
/// answer to `<resp_root><unit>`, tagged with the id of the command.
pub struct EtcdControl {
    client: reqwest::blocking::Client,
    endpoint: String,
    cmd_root: String,
    resp_root: String,
}

impl EtcdControl {
    /// Control of the SNAP2 F-engine daemons
    pub fn snap(endpoint: &str) -> Result<Self, ControlError> {
        Self::new(endpoint, "/cmd/snap/", "/resp/snap/")
    }

    /// Control of the ARX board daemons
    pub fn arx(endpoint: &str) -> Result<Self, ControlError> {
        Self::new(endpoint, "/cmd/arx/", "/resp/arx/")
    }

    pub fn new(endpoint: &str, cmd_root: &str, resp_root: &str) -> Result<Self, ControlError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            cmd_root: cmd_root.to_owned(),
            resp_root: resp_root.to_owned(),
        })
    }

    fn put(&self, key: &str, value: &str) -> Result<(), ControlError> {
        self.client
            .post(format!("{}/v3/kv/put", self.endpoint))
            .json(&PutRequest {
                key: b64(key.as_bytes()),
                value: b64(value.as_bytes()),
            })
            .send()?
            .error_for_status()?;
        Ok(())
    }

    /// Every (key, value) under `key`, or the single key if `prefix` is false
    fn range(&self, key: &str, prefix: bool) -> Result<Vec<(String, String)>, ControlError> {
        let request = RangeRequest {
            key: b64(key.as_bytes()),
            range_end: prefix.then(|| b64(&prefix_end(key))),
        };
        let resp: RangeResponse = self
            .client
            .post(format!("{}/v3/kv/range", self.endpoint))
            .json(&request)
            .send()?
            .error_for_status()?
            .json()?;
        resp.kvs
            .into_iter()
            .map(|kv| {
                let key = general_purpose::STANDARD.decode(kv.key)?;
                let value = general_purpose::STANDARD.decode(kv.value)?;
                Ok((
                    String::from_utf8_lossy(&key).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                ))
            })
            .collect()
    }
}

impl ControlPlane for EtcdControl {
    fn send_command(
        &self,
        target: Target,
        block: &str,
        method: &str,
        kwargs: Value,
        timeout: Duration,
        n_response_expected: usize,
    ) -> Result<Responses, ControlError> {
        let id = format!("{:016x}", rand::random::<u64>());
        let command = Command {
            cmd: method,
            val: CommandVal {
                block,
                timestamp: hifitime::Epoch::now()?.to_unix_seconds(),
                kwargs: &kwargs,
            },
            id: &id,
        };
        let cmd_key = format!("{}{}", self.cmd_root, target.selector());
        debug!("Sending {block}.{method} to {cmd_key} ({id})");
        self.put(&cmd_key, &serde_json::to_string(&command)?)?;

        let (resp_key, prefix) = match target {
            Target::All => (self.resp_root.clone(), true),
            Target::Unit(n) => (format!("{}{n}", self.resp_root), false),
        };
        wait_for_responses(
            &format!("{block}.{method}"),
            timeout,
            n_response_expected,
            |responses| {
                let kvs = self.range(&resp_key, prefix)?;
                collect_responses(kvs, &id, &self.resp_root, responses);
                Ok(())
            },
        )
    }
}

/// A control plane that sends nothing, logging what it would have sent and
/// acknowledging on behalf of every addressed unit
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRun;

impl ControlPlane for DryRun {
    fn send_command(
        &self,
        target: Target,
        block: &str,
        method: &str,
        kwargs: Value,
        _timeout: Duration,
        _n_response_expected: usize,
    ) -> Result<Responses, ControlError> {
        debug!("(dry run) {:?} {block}.{method} {kwargs}", target);
        let units = match target {
            Target::All => (1..=BOARDS).collect(),
            Target::Unit(n) => vec![n],
        };
        Ok(units.into_iter().map(|u| (u, Ok(Value::Null))).collect())
    }
}
