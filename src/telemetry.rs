//! Telemetry backend seam and the agents shipped with the crate.
//!
//! The session talks to the backend exclusively through [`TelemetryAgent`].
//! Every call either succeeds or fails with the negative status the backend
//! reported; the session logs failures and never retries.
//!
//! Both shipped agents keep open transactions in a [`TransactionBook`] and
//! hand the finished transaction to a [`TransactionSink`] when it ends:
//! [`LogSink`] writes it to the log, [`HttpSink`] posts it as JSON.

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::{CollectorKind, Config, RelayError, RelayResult};

pub const ROOT_SEGMENT: SegmentId = SegmentId(0);

/// Status returned for an id the agent has never handed out.
pub const UNKNOWN_ID: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TransactionId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SegmentId(pub i64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call}() returned {code}")]
pub struct AgentError {
    pub call: &'static str,
    pub code: i32,
}

pub type AgentResult<T> = Result<T, AgentError>;

pub trait TelemetryAgent {
    fn transaction_begin(&mut self) -> AgentResult<TransactionId>;
    fn transaction_set_type_other(&mut self, tx: TransactionId) -> AgentResult<()>;
    fn transaction_set_name(&mut self, tx: TransactionId, name: &str) -> AgentResult<()>;
    fn transaction_set_category(&mut self, tx: TransactionId, category: &str) -> AgentResult<()>;
    fn transaction_add_attribute(
        &mut self,
        tx: TransactionId,
        key: &str,
        value: &str,
    ) -> AgentResult<()>;
    fn segment_external_begin(
        &mut self,
        tx: TransactionId,
        parent: SegmentId,
        host: &str,
        name: &str,
    ) -> AgentResult<SegmentId>;
    fn segment_end(&mut self, tx: TransactionId, segment: SegmentId) -> AgentResult<()>;
    fn transaction_notice_error(
        &mut self,
        tx: TransactionId,
        kind: &str,
        message: &str,
        class: &str,
        stack: &str,
    ) -> AgentResult<()>;
    fn transaction_end(&mut self, tx: TransactionId) -> AgentResult<()>;
}

/// What the backend is told about us at init time.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub license_key: String,
    pub app_name: String,
    pub language: String,
    pub language_version: String,
}

impl AgentIdentity {
    pub fn new(license_key: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            license_key: license_key.into(),
            app_name: app_name.into(),
            language: "Rust".to_string(),
            language_version: "2024".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttributeRecord {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentRecord {
    pub id: SegmentId,
    pub parent: SegmentId,
    pub host: String,
    pub name: String,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "endedAt", skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoticedError {
    pub kind: String,
    pub message: String,
    pub class: String,
    pub stack: String,
    pub at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub guid: Uuid,
    #[serde(rename = "appName")]
    pub app_name: String,
    pub language: String,
    #[serde(rename = "languageVersion")]
    pub language_version: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "endedAt", skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    pub attributes: Vec<AttributeRecord>,
    pub segments: Vec<SegmentRecord>,
    pub errors: Vec<NoticedError>,
}

/// Open transactions of one agent, keyed by the ids it handed out.
#[derive(Debug)]
pub struct TransactionBook {
    identity: AgentIdentity,
    next_transaction: i64,
    next_segment: i64,
    open: BTreeMap<TransactionId, TransactionRecord>,
}

impl TransactionBook {
    pub fn new(identity: AgentIdentity) -> Self {
        Self {
            identity,
            next_transaction: 1,
            next_segment: ROOT_SEGMENT.0 + 1,
            open: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn begin(&mut self) -> TransactionId {
        let id = TransactionId(self.next_transaction);
        self.next_transaction = self.next_transaction.saturating_add(1);
        self.open.insert(
            id,
            TransactionRecord {
                guid: Uuid::new_v4(),
                app_name: self.identity.app_name.clone(),
                language: self.identity.language.clone(),
                language_version: self.identity.language_version.clone(),
                kind: None,
                name: None,
                category: None,
                started_at: now_rfc3339(),
                ended_at: None,
                attributes: Vec::new(),
                segments: Vec::new(),
                errors: Vec::new(),
            },
        );
        id
    }

    pub fn get_mut(
        &mut self,
        tx: TransactionId,
        call: &'static str,
    ) -> AgentResult<&mut TransactionRecord> {
        self.open.get_mut(&tx).ok_or(AgentError {
            call,
            code: UNKNOWN_ID,
        })
    }

    pub fn begin_segment(
        &mut self,
        tx: TransactionId,
        parent: SegmentId,
        host: &str,
        name: &str,
    ) -> AgentResult<SegmentId> {
        let id = SegmentId(self.next_segment);
        let record = self.get_mut(tx, "segment_external_begin")?;
        if parent != ROOT_SEGMENT && !record.segments.iter().any(|s| s.id == parent) {
            return Err(AgentError {
                call: "segment_external_begin",
                code: UNKNOWN_ID,
            });
        }
        record.segments.push(SegmentRecord {
            id,
            parent,
            host: host.to_string(),
            name: name.to_string(),
            started_at: now_rfc3339(),
            ended_at: None,
        });
        self.next_segment = self.next_segment.saturating_add(1);
        Ok(id)
    }

    pub fn end_segment(&mut self, tx: TransactionId, segment: SegmentId) -> AgentResult<()> {
        let record = self.get_mut(tx, "segment_end")?;
        let seg = record
            .segments
            .iter_mut()
            .find(|s| s.id == segment && s.ended_at.is_none())
            .ok_or(AgentError {
                call: "segment_end",
                code: UNKNOWN_ID,
            })?;
        seg.ended_at = Some(now_rfc3339());
        Ok(())
    }

    pub fn finish(&mut self, tx: TransactionId) -> AgentResult<TransactionRecord> {
        let mut record = self.open.remove(&tx).ok_or(AgentError {
            call: "transaction_end",
            code: UNKNOWN_ID,
        })?;
        record.ended_at = Some(now_rfc3339());
        Ok(record)
    }
}

/// Destination of finished transactions.
pub trait TransactionSink {
    fn deliver(&mut self, identity: &AgentIdentity, record: &TransactionRecord) -> AgentResult<()>;
}

/// Agent that buffers each transaction and delivers it whole when it ends.
#[derive(Debug)]
pub struct BufferedAgent<S> {
    book: TransactionBook,
    sink: S,
}

pub type LogAgent = BufferedAgent<LogSink>;
pub type HttpAgent = BufferedAgent<HttpSink>;

impl<S: TransactionSink> BufferedAgent<S> {
    pub fn new(identity: AgentIdentity, sink: S) -> Self {
        tracing::debug!(
            app = %identity.app_name,
            language = %identity.language,
            "telemetry agent initialised"
        );
        Self {
            book: TransactionBook::new(identity),
            sink,
        }
    }
}

impl<S: TransactionSink> TelemetryAgent for BufferedAgent<S> {
    fn transaction_begin(&mut self) -> AgentResult<TransactionId> {
        Ok(self.book.begin())
    }

    fn transaction_set_type_other(&mut self, tx: TransactionId) -> AgentResult<()> {
        self.book.get_mut(tx, "transaction_set_type_other")?.kind = Some("other".to_string());
        Ok(())
    }

    fn transaction_set_name(&mut self, tx: TransactionId, name: &str) -> AgentResult<()> {
        self.book.get_mut(tx, "transaction_set_name")?.name = Some(name.to_string());
        Ok(())
    }

    fn transaction_set_category(&mut self, tx: TransactionId, category: &str) -> AgentResult<()> {
        self.book.get_mut(tx, "transaction_set_category")?.category = Some(category.to_string());
        Ok(())
    }

    fn transaction_add_attribute(
        &mut self,
        tx: TransactionId,
        key: &str,
        value: &str,
    ) -> AgentResult<()> {
        self.book
            .get_mut(tx, "transaction_add_attribute")?
            .attributes
            .push(AttributeRecord {
                key: key.to_string(),
                value: value.to_string(),
            });
        Ok(())
    }

    fn segment_external_begin(
        &mut self,
        tx: TransactionId,
        parent: SegmentId,
        host: &str,
        name: &str,
    ) -> AgentResult<SegmentId> {
        self.book.begin_segment(tx, parent, host, name)
    }

    fn segment_end(&mut self, tx: TransactionId, segment: SegmentId) -> AgentResult<()> {
        self.book.end_segment(tx, segment)
    }

    fn transaction_notice_error(
        &mut self,
        tx: TransactionId,
        kind: &str,
        message: &str,
        class: &str,
        stack: &str,
    ) -> AgentResult<()> {
        self.book
            .get_mut(tx, "transaction_notice_error")?
            .errors
            .push(NoticedError {
                kind: kind.to_string(),
                message: message.to_string(),
                class: class.to_string(),
                stack: stack.to_string(),
                at: now_rfc3339(),
            });
        Ok(())
    }

    fn transaction_end(&mut self, tx: TransactionId) -> AgentResult<()> {
        let record = self.book.finish(tx)?;
        self.sink.deliver(self.book.identity(), &record)
    }
}

/// Writes each finished transaction to the log as one JSON document.
#[derive(Debug, Default)]
pub struct LogSink;

impl TransactionSink for LogSink {
    fn deliver(&mut self, _identity: &AgentIdentity, record: &TransactionRecord) -> AgentResult<()> {
        let json = serde_json::to_string(record).map_err(|err| {
            tracing::warn!("cannot serialize transaction: {err}");
            AgentError {
                call: "transaction_end",
                code: -3,
            }
        })?;
        tracing::info!(target: "perfrelay::transaction", "{json}");
        Ok(())
    }
}

/// Posts each finished transaction to an HTTP collector.
#[derive(Debug)]
pub struct HttpSink {
    endpoint: String,
    http: ureq::Agent,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl TransactionSink for HttpSink {
    fn deliver(&mut self, identity: &AgentIdentity, record: &TransactionRecord) -> AgentResult<()> {
        let failed = |code| AgentError {
            call: "transaction_end",
            code,
        };
        let body = serde_json::to_string(record).map_err(|err| {
            tracing::warn!("cannot serialize transaction: {err}");
            failed(-3)
        })?;
        match self
            .http
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("X-License-Key", &identity.license_key)
            .send_string(&body)
        {
            Ok(_) => {
                tracing::debug!("delivered transaction {} to {}", record.guid, self.endpoint);
                Ok(())
            }
            Err(ureq::Error::Status(status, _)) => {
                tracing::warn!("collector {} answered {status}", self.endpoint);
                Err(failed(-i32::from(status)))
            }
            Err(err) => {
                tracing::warn!("cannot reach collector {}: {err}", self.endpoint);
                Err(failed(-1))
            }
        }
    }
}

/// Initialises the agent selected by the configuration.
pub fn connect_agent(
    config: &Config,
    identity: AgentIdentity,
) -> RelayResult<Box<dyn TelemetryAgent>> {
    match config.collector.kind {
        CollectorKind::Log => Ok(Box::new(LogAgent::new(identity, LogSink))),
        CollectorKind::Http => {
            let endpoint = config.collector.endpoint.clone().ok_or_else(|| {
                RelayError::Config("collector kind `http` needs an `endpoint`".to_string())
            })?;
            let sink = HttpSink::new(endpoint, Duration::from_secs(config.collector.timeout_secs));
            Ok(Box::new(HttpAgent::new(identity, sink)))
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}
