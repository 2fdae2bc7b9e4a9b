//! Message model and the factory that stamps messages out of static options.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::value::Value;

/// Placeholder in string content replaced by the 0-based send index.
pub const INDEX_PLACEHOLDER: &str = "%d";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub durable: bool,
    pub priority: u8,
    pub ttl: Option<Duration>,
    pub delivery_count: u32,
    pub first_acquirer: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub message_id: Option<String>,
    pub user_id: Option<Vec<u8>>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub absolute_expiry_time: Option<i64>,
    pub creation_time: Option<i64>,
    pub group_id: Option<String>,
    pub group_sequence: u32,
    pub reply_to_group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub properties: Properties,
    pub annotations: BTreeMap<String, Value>,
    pub application_properties: BTreeMap<String, Value>,
    pub body: Value,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            header: Header {
                priority: 4,
                ..Header::default()
            },
            properties: Properties::default(),
            annotations: BTreeMap::new(),
            application_properties: BTreeMap::new(),
            body: Value::Null,
        }
    }
}

impl Message {
    pub fn with_body(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn body_len(&self) -> usize {
        self.body.content_len()
    }
}

/// Static message shape configured by the operator.
///
/// Content sources are consulted in order: text, list, map, file. When none
/// is set the body is an empty string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOptions {
    pub content: Option<String>,
    pub list_content: Vec<Value>,
    pub map_content: BTreeMap<String, Value>,
    /// Text loaded from a content file; sent verbatim.
    pub file_content: Option<String>,
    pub id: Option<String>,
    pub correlation_id: Option<String>,
    pub subject: Option<String>,
    pub content_type: Option<String>,
    pub user_id: Option<String>,
    pub reply_to: Option<String>,
    pub group_id: Option<String>,
    pub group_sequence: u32,
    pub reply_to_group_id: Option<String>,
    pub to: Option<String>,
    pub durable: Option<bool>,
    pub priority: Option<u8>,
    pub ttl: Option<Duration>,
    pub properties: BTreeMap<String, Value>,
}

/// Builds the message for a given send index.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    template: Message,
    templated_content: Option<String>,
}

impl MessageFactory {
    pub fn new(options: &MessageOptions) -> Self {
        let mut template = Message::default();
        let mut templated_content = None;

        template.body = match &options.content {
            Some(text) if text.contains(INDEX_PLACEHOLDER) => {
                templated_content = Some(text.clone());
                Value::String(text.clone())
            }
            Some(text) => Value::String(text.clone()),
            None if !options.list_content.is_empty() => Value::List(options.list_content.clone()),
            None if !options.map_content.is_empty() => Value::Map(options.map_content.clone()),
            None => Value::String(options.file_content.clone().unwrap_or_default()),
        };

        let props = &mut template.properties;
        props.message_id = options.id.clone();
        props.correlation_id = options.correlation_id.clone();
        props.subject = options.subject.clone();
        props.content_type = options.content_type.clone();
        props.user_id = options
            .user_id
            .as_ref()
            .filter(|user| !user.is_empty())
            .map(|user| user.as_bytes().to_vec());
        props.reply_to = options.reply_to.clone();
        props.group_id = options.group_id.clone();
        props.group_sequence = options.group_sequence;
        props.reply_to_group_id = options.reply_to_group_id.clone();
        props.to = options.to.clone();

        if let Some(durable) = options.durable {
            template.header.durable = durable;
        }
        if let Some(priority) = options.priority {
            template.header.priority = priority;
        }
        template.header.ttl = options.ttl;
        template.application_properties = options.properties.clone();

        Self {
            template,
            templated_content,
        }
    }

    pub fn create(&self, index: u64) -> Message {
        let mut message = self.template.clone();
        if let Some(text) = &self.templated_content {
            message.body = Value::String(text.replace(INDEX_PLACEHOLDER, &index.to_string()));
        }
        message
    }

    /// Body size of the untemplated message in bytes.
    pub fn content_len(&self) -> usize {
        self.template.body_len()
    }
}
