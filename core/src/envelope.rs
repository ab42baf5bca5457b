//! Message envelope codec
//!
//! Producers embed timing and provenance metadata in every message as a
//! single `|`-delimited line:
//!
//! ```text
//! sendTime|threadID|tag|payload:<payload>|senderHost
//! ```
//!
//! Consumers decode that line, attach the transport metadata and the local
//! receive time, and derive end-to-end latency from the two timestamps.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use thiserror::Error;

use crate::transport::MessageId;

/// Timestamp layout shared by both ends
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Marker placed in front of the payload field
pub const PAYLOAD_MARKER: &str = "payload:";

pub(crate) const FIELD_SEPARATOR: char = '|';

/// Current time at the precision carried on the wire
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Format a timestamp the way envelopes carry it
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp in [`TIMESTAMP_FORMAT`]
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).map(|naive| naive.and_utc())
}

/// Envelope decode errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer fields than the envelope layout requires
    #[error("expected 5 '|'-separated fields, found {0}")]
    MissingFields(usize),

    /// Leading field is not a timestamp
    #[error("invalid send timestamp '{value}': {reason}")]
    InvalidTimestamp {
        /// Offending field
        value: String,
        /// Parser message
        reason: String,
    },

    /// Thread id is not an integer
    #[error("invalid thread id '{0}'")]
    InvalidThreadId(String),

    /// Embedded tag differs from the tag of the topic the message arrived on
    #[error("envelope tag '{embedded}' does not match topic tag '{topic}'")]
    TagMismatch {
        /// Tag carried in the envelope
        embedded: String,
        /// Tag resolved from the delivery topic
        topic: String,
    },
}

/// Outbound envelope, built by a producer worker at send time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Send time (microsecond precision)
    pub send_time: DateTime<Utc>,
    /// Producer worker id
    pub thread_id: usize,
    /// Namespace tag of the destination
    pub tag: String,
    /// User payload
    pub payload: String,
    /// Hostname of the sender
    pub sender_host: String,
}

impl Envelope {
    /// Build an envelope stamped with the current time
    pub fn new(
        thread_id: usize,
        tag: impl Into<String>,
        payload: impl Into<String>,
        sender_host: impl Into<String>,
    ) -> Self {
        Self {
            send_time: now_micros(),
            thread_id,
            tag: tag.into(),
            payload: payload.into(),
            sender_host: sender_host.into(),
        }
    }

    /// Encode to the wire line
    pub fn encode(&self) -> String {
        self.render(&self.payload)
    }

    /// Wire line with the payload text removed, for detail logging
    pub fn redacted(&self) -> String {
        self.render("")
    }

    fn render(&self, payload: &str) -> String {
        format!(
            "{}|{}|{}|{}{}|{}",
            format_timestamp(&self.send_time),
            self.thread_id,
            self.tag,
            PAYLOAD_MARKER,
            payload,
            self.sender_host
        )
    }

    /// Decode a wire line
    ///
    /// The first three fields are split from the left and the sender host
    /// from the right, so a payload that itself contains `|` survives.
    pub fn parse(line: &str) -> Result<Self, DecodeError> {
        let mut head = line.splitn(4, FIELD_SEPARATOR);
        let send_time = head.next().unwrap_or_default();
        let (thread_id, tag, rest) = match (head.next(), head.next(), head.next()) {
            (Some(thread_id), Some(tag), Some(rest)) => (thread_id, tag, rest),
            _ => return Err(DecodeError::MissingFields(line.split(FIELD_SEPARATOR).count())),
        };
        let (payload, sender_host) = rest
            .rsplit_once(FIELD_SEPARATOR)
            .ok_or(DecodeError::MissingFields(4))?;

        let send_time = parse_timestamp(send_time).map_err(|e| DecodeError::InvalidTimestamp {
            value: send_time.to_string(),
            reason: e.to_string(),
        })?;
        let thread_id = thread_id
            .parse()
            .map_err(|_| DecodeError::InvalidThreadId(thread_id.to_string()))?;
        let payload = payload.strip_prefix(PAYLOAD_MARKER).unwrap_or(payload);

        Ok(Self {
            send_time,
            thread_id,
            tag: tag.to_string(),
            payload: payload.to_string(),
            sender_host: sender_host.to_string(),
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Inbound envelope: the decoded outbound envelope plus delivery metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    /// Transport message id
    pub message_id: MessageId,
    /// Local receive time (microsecond precision)
    pub receive_time: DateTime<Utc>,
    /// The envelope as the producer sent it
    pub envelope: Envelope,
    /// Hostname of the receiver
    pub receiver_host: String,
}

impl InboundEnvelope {
    /// Decode a received line
    ///
    /// `receiver_tag` is the tag resolved from the topic the message arrived
    /// on; the embedded tag must agree with it.
    pub fn decode(
        line: &str,
        message_id: MessageId,
        receive_time: DateTime<Utc>,
        receiver_host: impl Into<String>,
        receiver_tag: &str,
    ) -> Result<Self, DecodeError> {
        let envelope = Envelope::parse(line)?;
        if envelope.tag != receiver_tag {
            return Err(DecodeError::TagMismatch {
                embedded: envelope.tag,
                topic: receiver_tag.to_string(),
            });
        }
        Ok(Self {
            message_id,
            receive_time,
            envelope,
            receiver_host: receiver_host.into(),
        })
    }

    /// End-to-end latency in milliseconds (microsecond resolution)
    pub fn latency_ms(&self) -> f64 {
        let delta = self.receive_time - self.envelope.send_time;
        match delta.num_microseconds() {
            Some(micros) => micros as f64 / 1000.0,
            None => delta.num_milliseconds() as f64,
        }
    }

    /// Redacted detail line for the consumer log
    pub fn log_line(&self, worker_id: usize) -> String {
        format!(
            "({},rust,{})|{}|{}|{}",
            self.message_id.as_str().replace(',', ""),
            worker_id,
            format_timestamp(&self.receive_time),
            self.envelope.redacted(),
            self.receiver_host
        )
    }
}
