//! Converts report samples into transaction attributes.

use std::time::Duration;

use crate::{Sample, TelemetryAgent, TransactionId};

/// Longest attribute key the backend accepts, in bytes.
pub const MAX_ATTRIBUTE_KEY_LEN: usize = 255;

const ZERO_SECONDS: &str = "0.000000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryAttribute {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    Sent,
    /// Rounded to zero seconds; not worth an attribute.
    Discarded,
    Failed,
}

/// `<prefix>_<symbol>@<object>`, cut to [`MAX_ATTRIBUTE_KEY_LEN`] bytes on a
/// character boundary.
pub fn attribute_key(prefix: &str, symbol: &str, object: &str) -> String {
    let mut key = format!("{prefix}_{symbol}@{object}");
    if key.len() > MAX_ATTRIBUTE_KEY_LEN {
        let mut end = MAX_ATTRIBUTE_KEY_LEN;
        while !key.is_char_boundary(end) {
            end -= 1;
        }
        key.truncate(end);
    }
    key
}

/// Seconds attributable to the sample: its share of the recorded wall time.
pub fn attributed_seconds(percent: f64, total: Duration) -> f64 {
    percent / 100.0 * total.as_secs_f64()
}

/// The attribute for `sample`, or `None` when its value rounds to zero at
/// microsecond precision.
pub fn attribute_for(
    sample: &Sample,
    total: Duration,
    prefix: &str,
) -> Option<TelemetryAttribute> {
    let value = format!("{:.6}", attributed_seconds(sample.percent, total));
    if value == ZERO_SECONDS {
        return None;
    }
    Some(TelemetryAttribute {
        key: attribute_key(prefix, &sample.symbol, &sample.object),
        value,
    })
}

/// Sends one sample. A failed call is logged and reported back; it never
/// stops the caller from sending the next sample.
pub fn emit_sample(
    agent: &mut dyn TelemetryAgent,
    tx: TransactionId,
    sample: &Sample,
    total: Duration,
    prefix: &str,
) -> Emission {
    let Some(attr) = attribute_for(sample, total, prefix) else {
        tracing::trace!("{}@{} rounds to zero", sample.symbol, sample.object);
        return Emission::Discarded;
    };
    tracing::debug!("{} = {}", attr.key, attr.value);
    match agent.transaction_add_attribute(tx, &attr.key, &attr.value) {
        Ok(()) => Emission::Sent,
        Err(err) => {
            tracing::warn!("dropping attribute {}: {err}", attr.key);
            Emission::Failed
        }
    }
}
