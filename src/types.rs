//! Common types shared between the broker and client surfaces.

use bytes::Bytes;

/// An application message as seen at the public API boundary: a
/// decoded PUBLISH with its MQTT 5 properties flattened into the
/// fields callers actually use.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Retain flag.
    pub retain: bool,
    /// `ResponseTopic` property, if the publisher set one.
    pub response_topic: Option<String>,
    /// `CorrelationData` property, if the publisher set one.
    pub correlation_data: Option<Bytes>,
}

impl Message {
    /// Create a new message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
            response_topic: None,
            correlation_data: None,
        }
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Set a response topic.
    pub fn with_response_topic(mut self, topic: impl Into<String>) -> Self {
        self.response_topic = Some(topic.into());
        self
    }

    /// Set correlation data.
    pub fn with_correlation_data(mut self, data: impl Into<Bytes>) -> Self {
        self.correlation_data = Some(data.into());
        self
    }

    pub(crate) fn from_publish(publish: &crate::packet::Publish) -> Self {
        use crate::properties::{PropertyId, PropertyValue};
        let response_topic = publish.properties.get(PropertyId::ResponseTopic).and_then(|v| match v {
            PropertyValue::Utf8String(s) => Some(s.clone()),
            _ => None,
        });
        let correlation_data = publish.properties.get(PropertyId::CorrelationData).and_then(|v| match v {
            PropertyValue::BinaryData(b) => Some(b.clone()),
            _ => None,
        });
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            retain: publish.retain,
            response_topic,
            correlation_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let msg = Message::new("a/b", "payload")
            .with_retain(true)
            .with_response_topic("a/b/reply")
            .with_correlation_data(Bytes::from_static(b"id-1"));
        assert!(msg.retain);
        assert_eq!(msg.response_topic.as_deref(), Some("a/b/reply"));
        assert_eq!(&msg.correlation_data.unwrap()[..], b"id-1");
    }
}
