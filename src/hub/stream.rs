//! Streaming a subscription as newline-delimited JSON frames.

use std::time::Duration;

use futures::stream::{self, Stream};
use serde::Serialize;

use crate::models::{EventType, LifecycleEvent};

use super::Subscription;

/// Default idle interval before a keep-alive frame is emitted.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// One unit written to a live connection.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct Frame(LifecycleEvent);

impl Frame {
    pub fn event(event: LifecycleEvent) -> Self {
        Self(event)
    }

    pub fn keep_alive() -> Self {
        Self(LifecycleEvent::keep_alive())
    }

    pub fn is_keep_alive(&self) -> bool {
        self.0.event_type == EventType::KeepAlive
    }

    pub fn into_event(self) -> LifecycleEvent {
        self.0
    }

    /// `{"event_type":…,"payload":…,"timestamp":…}` followed by `\n`.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(&self.0)?;
        line.push('\n');
        Ok(line)
    }
}

impl Subscription {
    /// Turn the subscription into a stream of frames, inserting a keep-alive
    /// whenever nothing arrives for `keepalive`.
    ///
    /// The stream ends when the hub closes the channel. Dropping the stream
    /// drops the subscription.
    pub fn into_stream(self, keepalive: Duration) -> impl Stream<Item = Frame> + Send {
        stream::unfold(self, move |subscription| async move {
            match tokio::time::timeout(keepalive, subscription.recv()).await {
                Ok(Some(event)) => Some((Frame::event(event), subscription)),
                Ok(None) => None,
                Err(_) => Some((Frame::keep_alive(), subscription)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_line_shape() {
        let frame = Frame::event(LifecycleEvent::new(
            EventType::GroupDeleted,
            json!({ "group_id": "g1" }),
        ));
        let line = frame.to_line().unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["event_type"], "group_deleted");
        assert_eq!(value["payload"]["group_id"], "g1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_keep_alive_frame() {
        assert!(Frame::keep_alive().is_keep_alive());
    }
}
