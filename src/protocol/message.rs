//! Protocol message types.
//!
//! Payloads are flat JSON maps, base64 wrapped. Optional fields may be
//! absent; decoding never fails because of a missing optional field, and a
//! missing required field is a `Payload` error rather than a panic.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::frame::{self, MessageType};
use crate::error::{LoggerError, Result};

/// Tag of the Identity frame, echoed by the server's reply to it. Tags
/// below [`INITIAL_ENTITY_TAG`] are reserved for control messages.
pub const IDENTITY_TAG: i64 = 0;

/// First tag handed out to entities.
pub const INITIAL_ENTITY_TAG: i64 = 100;

/// Entity tags wrap back to [`INITIAL_ENTITY_TAG`] before reaching this value.
pub const ENTITY_TAG_LIMIT: i64 = i32::MAX as i64 - 1;

// =============================================================================
// Tag allocation
// =============================================================================

/// Monotonic entity tag generator, scoped to one client.
#[derive(Debug)]
pub struct TagSequence {
    next: AtomicI64,
}

impl TagSequence {
    pub fn new() -> Self {
        Self::starting_at(INITIAL_ENTITY_TAG)
    }

    pub fn starting_at(tag: i64) -> Self {
        Self {
            next: AtomicI64::new(tag.clamp(INITIAL_ENTITY_TAG, ENTITY_TAG_LIMIT - 1)),
        }
    }

    pub fn next_tag(&self) -> i64 {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |tag| {
                Some(if tag + 1 >= ENTITY_TAG_LIMIT {
                    INITIAL_ENTITY_TAG
                } else {
                    tag + 1
                })
            })
            .unwrap_or_else(|tag| tag)
    }
}

impl Default for TagSequence {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_entity_tag(tag: i64) -> bool {
    (INITIAL_ENTITY_TAG..ENTITY_TAG_LIMIT).contains(&tag)
}

// =============================================================================
// Severity
// =============================================================================

/// Severity of a log entry. The discriminants are the on-wire flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Severity {
    Error = 1 << 0,
    #[serde(alias = "warn")]
    Warning = 1 << 1,
    Info = 1 << 2,
    Debug = 1 << 3,
    Verbose = 1 << 4,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Error,
        Severity::Warning,
        Severity::Info,
        Severity::Debug,
        Severity::Verbose,
    ];

    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as u32 == bits)
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn title(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
            Severity::Verbose => "VERBOSE",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Severity::Error),
            "warning" | "warn" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            "debug" => Ok(Severity::Debug),
            "verbose" | "trace" => Ok(Severity::Verbose),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

bitflags::bitflags! {
    /// Set of severities let through by a level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LevelMask: u32 {
        const ERROR = Severity::Error as u32;
        const WARNING = Severity::Warning as u32;
        const INFO = Severity::Info as u32;
        const DEBUG = Severity::Debug as u32;
        const VERBOSE = Severity::Verbose as u32;
    }
}

impl LevelMask {
    /// Every severity at least as important as `level`.
    pub fn up_to(level: Severity) -> Self {
        Self::from_bits_truncate((level.bits() << 1) - 1)
    }

    pub fn allows(self, severity: Severity) -> bool {
        self.bits() & severity.bits() != 0
    }
}

// =============================================================================
// Payload helpers
// =============================================================================

fn wrap<T: Serialize>(msg_type: MessageType, value: &T) -> Result<Bytes> {
    let json = serde_json::to_vec(value)?;
    let text = STANDARD.encode(json);
    Ok(frame::encode(msg_type.tag(), text.as_bytes()))
}

fn unwrap_payload<T: DeserializeOwned>(kind: &'static str, payload: &[u8]) -> Result<T> {
    let json = STANDARD
        .decode(payload)
        .map_err(|e| LoggerError::Payload {
            kind,
            reason: format!("invalid base64: {}", e),
        })?;
    serde_json::from_slice(&json).map_err(|e| LoggerError::Payload {
        kind,
        reason: e.to_string(),
    })
}

fn missing(kind: &'static str, field: &str) -> LoggerError {
    LoggerError::Payload {
        kind,
        reason: format!("missing field '{}'", field),
    }
}

// =============================================================================
// HI - Identity
// =============================================================================

/// Who a client is. Sent once per connection as the first frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    host_name: String,
    device_id: String,
    secret: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct IdentityPayload {
    #[serde(rename = "hostName")]
    host_name: Option<String>,
    #[serde(rename = "deviceID")]
    device_id: Option<String>,
    #[serde(default)]
    secret: Option<String>,
}

impl Identity {
    pub fn new(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        secret: Option<String>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Identity of the machine this process runs on.
    pub fn local() -> Self {
        Self::new(whoami::devicename(), local_device_id(), None)
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub fn rename(&mut self, new_host_name: impl Into<String>) {
        self.host_name = new_host_name.into();
    }

    pub fn encode(&self) -> Result<Bytes> {
        wrap(
            MessageType::Hello,
            &IdentityPayload {
                host_name: Some(self.host_name.clone()),
                device_id: Some(self.device_id.clone()),
                // Empty string is the "no secret" sentinel on the wire
                secret: Some(self.secret.clone().unwrap_or_default()),
            },
        )
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let p: IdentityPayload = unwrap_payload("identity", payload)?;
        Ok(Self::new(
            p.host_name.ok_or_else(|| missing("identity", "hostName"))?,
            p.device_id.ok_or_else(|| missing("identity", "deviceID"))?,
            p.secret,
        ))
    }
}

/// Stable per-device identifier: a digest of the machine id, or of the
/// host and user names when no machine id is available.
fn local_device_id() -> String {
    let seed = std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            format!(
                "{}:{}",
                whoami::fallible::hostname().unwrap_or_default(),
                whoami::username()
            )
        });
    let digest = blake3::hash(seed.as_bytes());
    hex::encode(&digest.as_bytes()[..16])
}

// =============================================================================
// EN - Entity
// =============================================================================

/// A log record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub severity: Severity,
    pub filename: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub message: String,
    pub tag: i64,
}

#[derive(Serialize, Deserialize)]
struct EntityPayload {
    date: Option<f64>,
    flag: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function: Option<String>,
    message: Option<String>,
    tag: Option<i64>,
}

impl Entity {
    pub fn new(message: impl Into<String>, severity: Severity, tag: i64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            timestamp,
            severity,
            filename: None,
            line: None,
            function: None,
            message: message.into(),
            tag,
        }
    }

    pub fn with_location(
        mut self,
        filename: Option<String>,
        line: Option<u32>,
        function: Option<String>,
    ) -> Self {
        self.filename = filename;
        self.line = line;
        self.function = function;
        self
    }

    /// Module the entry was logged from: the file name without directory or
    /// extension.
    pub fn module(&self) -> Option<&str> {
        let filename = self.filename.as_deref()?;
        Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
    }

    pub fn datetime(&self) -> chrono::DateTime<chrono::Local> {
        let secs = self.timestamp.floor();
        let nanos = ((self.timestamp - secs) * 1e9) as u32;
        chrono::DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
            .unwrap_or_default()
            .with_timezone(&chrono::Local)
    }

    pub fn encode(&self) -> Result<Bytes> {
        wrap(
            MessageType::Entity,
            &EntityPayload {
                date: Some(self.timestamp),
                flag: Some(self.severity.bits()),
                filename: self.filename.clone(),
                line: self.line,
                function: self.function.clone(),
                message: Some(self.message.clone()),
                tag: Some(self.tag),
            },
        )
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let p: EntityPayload = unwrap_payload("entity", payload)?;
        let flag = p.flag.ok_or_else(|| missing("entity", "flag"))?;
        let severity = Severity::from_bits(flag).ok_or_else(|| LoggerError::Payload {
            kind: "entity",
            reason: format!("unknown severity flag {}", flag),
        })?;

        Ok(Self {
            timestamp: p.date.ok_or_else(|| missing("entity", "date"))?,
            severity,
            filename: p.filename,
            line: p.line,
            function: p.function,
            message: p.message.ok_or_else(|| missing("entity", "message"))?,
            tag: p.tag.ok_or_else(|| missing("entity", "tag"))?,
        })
    }
}

/// An entity as seen by the server: bound to the identity of the connection
/// it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEntity {
    pub entity: Entity,
    pub identity: Identity,
    /// Display name of the sending device, filled in by the consumer when
    /// its naming policy shows one
    pub device_name: Option<String>,
}

// =============================================================================
// AK - Response
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Hello,
    Entity,
}

/// Server reply to a Hello or an Entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub accepted: bool,
    pub message: Option<String>,
    pub source_type: SourceType,
    pub source_tag: i64,
}

#[derive(Serialize, Deserialize)]
struct ResponsePayload {
    accepted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(rename = "sourceType")]
    source_type: Option<SourceType>,
    #[serde(rename = "sourceTag")]
    source_tag: Option<i64>,
}

impl Response {
    pub fn hello(accepted: bool, message: Option<String>) -> Self {
        Self {
            accepted,
            message,
            source_type: SourceType::Hello,
            source_tag: IDENTITY_TAG,
        }
    }

    pub fn entity_ack(tag: i64) -> Self {
        Self {
            accepted: true,
            message: None,
            source_type: SourceType::Entity,
            source_tag: tag,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        wrap(
            MessageType::Ack,
            &ResponsePayload {
                accepted: Some(self.accepted),
                message: self.message.clone(),
                source_type: Some(self.source_type),
                source_tag: Some(self.source_tag),
            },
        )
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let p: ResponsePayload = unwrap_payload("response", payload)?;
        Ok(Self {
            accepted: p.accepted.ok_or_else(|| missing("response", "accepted"))?,
            message: p.message,
            source_type: p
                .source_type
                .ok_or_else(|| missing("response", "sourceType"))?,
            source_tag: p
                .source_tag
                .ok_or_else(|| missing("response", "sourceTag"))?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
