//! Human-readable rendering of messages and statistics.

use std::fmt::Write as _;
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use crate::checkpoint::StatsSummary;
use crate::driver::MessageLog;
use crate::error::{Error, Result};
use crate::message::Message;
pub use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MessageLogFormat {
    #[default]
    None,
    /// Body only.
    Body,
    /// Python dict with underscore keys.
    Dict,
    /// Python dict with AMQP (dashed) keys.
    Interop,
    /// JSON object with AMQP keys.
    Json,
}

impl FromStr for MessageLogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(MessageLogFormat::None),
            "body" => Ok(MessageLogFormat::Body),
            "dict" => Ok(MessageLogFormat::Dict),
            "interop" => Ok(MessageLogFormat::Interop),
            "json" => Ok(MessageLogFormat::Json),
            other => Err(Error::argument(format!("unknown message log format '{other}'"))),
        }
    }
}

/// Hex digest standing in for message content.
pub fn content_digest(value: &Value) -> String {
    let hash = match value {
        Value::Bytes(bytes) => blake3::hash(bytes),
        Value::String(text) => blake3::hash(text.as_bytes()),
        other => blake3::hash(python(other).as_bytes()),
    };
    hash.to_hex().to_string()
}

/// Renders `value` as a Python literal.
pub fn python(value: &Value) -> String {
    let mut out = String::new();
    write_python(&mut out, value);
    out
}

fn write_python(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(int) => {
            let _ = write!(out, "{int}");
        }
        Value::Float(float) => {
            let _ = write!(out, "{float:?}");
        }
        Value::Timestamp(ms) => {
            let _ = write!(out, "{ms}");
        }
        Value::String(text) => write_quoted(out, text),
        Value::Bytes(bytes) => {
            out.push('b');
            write_quoted(out, &String::from_utf8_lossy(bytes));
        }
        Value::List(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                write_python(out, item);
            }
            out.push(']');
        }
        Value::Map(entries) => {
            out.push('{');
            for (idx, (key, item)) in entries.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                write_quoted(out, key);
                out.push_str(": ");
                write_python(out, item);
            }
            out.push('}');
        }
    }
}

fn write_quoted(out: &mut String, text: &str) {
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('\'');
}

/// Converts `value` into JSON. Bytes become (lossy) strings and non-finite
/// floats become `null`.
pub fn json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Null => Json::Null,
        Value::Bool(flag) => Json::Bool(*flag),
        Value::Int(int) => Json::from(*int),
        Value::Float(float) => serde_json::Number::from_f64(*float).map_or(Json::Null, Json::Number),
        Value::String(text) => Json::String(text.clone()),
        Value::Bytes(bytes) => Json::String(String::from_utf8_lossy(bytes).into_owned()),
        Value::Timestamp(ms) => Json::from(*ms),
        Value::List(items) => Json::Array(items.iter().map(json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), json(item)))
                .collect(),
        ),
    }
}

/// Field list shared by the dict, interop and JSON renderings.
fn fields(message: &Message, dashed: bool, hash: bool) -> Vec<(&'static str, Value)> {
    let key = |underscore: &'static str, dash: &'static str| if dashed { dash } else { underscore };
    let header = &message.header;
    let props = &message.properties;
    let ttl = header
        .ttl
        .map_or(0, |ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
    let user_id = props
        .user_id
        .as_ref()
        .map(|bytes| Value::String(String::from_utf8_lossy(bytes).into_owned()));
    let content = if hash {
        Value::String(content_digest(&message.body))
    } else {
        message.body.clone()
    };

    let mut fields = vec![
        ("durable", Value::Bool(header.durable)),
        ("ttl", Value::Int(ttl)),
        (key("delivery_count", "delivery-count"), Value::Int(i64::from(header.delivery_count))),
        ("priority", Value::Int(i64::from(header.priority))),
        (key("first_acquirer", "first-acquirer"), Value::Bool(header.first_acquirer)),
        ("id", props.message_id.clone().into()),
    ];
    if dashed {
        fields.push(("to", props.to.clone().into()));
        fields.push(("address", props.to.clone().into()));
    }
    fields.extend([
        (key("reply_to", "reply-to"), props.reply_to.clone().into()),
        ("subject", props.subject.clone().into()),
        ("creation-time", props.creation_time.map(Value::Timestamp).into()),
        (
            "absolute-expiry-time",
            props.absolute_expiry_time.map(Value::Timestamp).into(),
        ),
        (key("content_encoding", "content-encoding"), props.content_encoding.clone().into()),
        (key("content_type", "content-type"), props.content_type.clone().into()),
        (key("correlation_id", "correlation-id"), props.correlation_id.clone().into()),
        (key("user_id", "user-id"), user_id.into()),
        ("group-id", props.group_id.clone().into()),
        ("group-sequence", Value::Int(i64::from(props.group_sequence))),
        ("reply-to-group-id", props.reply_to_group_id.clone().into()),
        ("content", content),
    ]);
    if !message.application_properties.is_empty() {
        fields.push(("properties", Value::Map(message.application_properties.clone())));
    }
    if !dashed && !message.annotations.is_empty() {
        fields.push(("message-annotations", Value::Map(message.annotations.clone())));
    }
    fields
}

fn python_dict(fields: &[(&str, Value)]) -> String {
    let mut out = String::from("{");
    for (idx, (key, value)) in fields.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        write_quoted(&mut out, key);
        out.push_str(": ");
        write_python(&mut out, value);
    }
    out.push('}');
    out
}

/// One line for `message` in `format`, or `None` when logging is off.
pub fn render(message: &Message, format: MessageLogFormat, hash: bool) -> Option<String> {
    match format {
        MessageLogFormat::None => None,
        MessageLogFormat::Body if hash => Some(content_digest(&message.body)),
        MessageLogFormat::Body => Some(message.body.to_string()),
        MessageLogFormat::Dict => Some(python_dict(&fields(message, false, hash))),
        MessageLogFormat::Interop => Some(python_dict(&fields(message, true, hash))),
        MessageLogFormat::Json => {
            let object: serde_json::Map<String, serde_json::Value> = fields(message, true, hash)
                .into_iter()
                .map(|(key, value)| (key.to_string(), json(&value)))
                .collect();
            Some(serde_json::Value::Object(object).to_string())
        }
    }
}

/// Writes each message to `out` in the configured format.
pub struct Printer<W: Write> {
    out: W,
    format: MessageLogFormat,
    hash: bool,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W, format: MessageLogFormat, hash: bool) -> Self {
        Self { out, format, hash }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> MessageLog for Printer<W> {
    fn on_message(&mut self, message: &Message) {
        let Some(line) = render(message, self.format, self.hash) else {
            return;
        };
        if let Err(err) = writeln!(self.out, "{line}") {
            log::warn!("message log write failed: {err}");
        }
    }
}

fn millis(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64() * 1000.0)
}

/// `STATS key=value ...` line for a run summary. `label` prefixes each key.
pub fn stats_line(label: &str, summary: &StatsSummary) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut push = |key: &str, value: String| pairs.push((format!("{label}{key}"), value));

    for (key, value) in [
        ("elapsed_ms", summary.elapsed),
        ("connect_ms", summary.connect),
        ("session_ms", summary.session),
        ("link_ms", summary.link),
        ("transfer_ms", summary.transfer),
    ] {
        if let Some(value) = value {
            push(key, millis(value));
        }
    }
    if let Some(messages) = summary.messages {
        push("messages", messages.to_string());
    }
    if let Some(rate) = summary.rate {
        push("msg_per_sec", format!("{rate:.2}"));
    }
    if let Some(throughput) = summary.throughput {
        push("bytes_per_sec", format!("{throughput:.2}"));
    }
    if let Some(latency) = summary.latency {
        push("latency_mean_us", latency.mean.as_micros().to_string());
        push("latency_p50_us", latency.p50.as_micros().to_string());
        push("latency_p99_us", latency.p99.as_micros().to_string());
        push("latency_max_us", latency.max.as_micros().to_string());
    }

    let mut line = String::from("STATS");
    for (key, value) in pairs {
        let _ = write!(line, " {key}={value}");
    }
    line
}
