use serde::Serialize;
use serde_json::Value;

/// Object kind addressed by every flow command. The service only exposes drops
/// over the socket.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Drop,
}

/// Sort order for `findmany` queries.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Desc,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FindOptions {
    pub filter: String,
    pub order: SortOrder,
    pub hints: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl FindOptions {
    /// Newest-first query without server hints.
    pub fn newest_first(filter: impl Into<String>, limit: Option<u64>) -> Self {
        Self {
            filter: filter.into(),
            order: SortOrder::Desc,
            hints: 0,
            limit,
        }
    }
}

/// Frames written to the flow socket.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Heartbeat,
    Subscribe {
        msg_id: u64,
        object: ObjectKind,
        flow_id: String,
    },
    Unsubscribe {
        msg_id: u64,
        object: ObjectKind,
        flow_id: String,
    },
    FindMany {
        object: ObjectKind,
        flow_id: String,
        msg_id: String,
        options: FindOptions,
    },
}

impl ClientMessage {
    pub fn subscribe(msg_id: u64, flow_id: impl Into<String>) -> Self {
        Self::Subscribe {
            msg_id,
            object: ObjectKind::Drop,
            flow_id: flow_id.into(),
        }
    }

    pub fn unsubscribe(msg_id: u64, flow_id: impl Into<String>) -> Self {
        Self::Unsubscribe {
            msg_id,
            object: ObjectKind::Drop,
            flow_id: flow_id.into(),
        }
    }

    pub fn find_many(
        msg_id: impl Into<String>,
        flow_id: impl Into<String>,
        options: FindOptions,
    ) -> Self {
        Self::FindMany {
            object: ObjectKind::Drop,
            flow_id: flow_id.into(),
            msg_id: msg_id.into(),
            options,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Classified inbound frame.
///
/// The service mixes two unrelated shapes on one socket: pushes tagged with
/// `"type": "message"` and replies carrying a `head.msgId`. Anything else is
/// surfaced as [`InboundFrame::Other`] and ignored by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Unsolicited drop for a subscribed flow. `value` is the raw record.
    Push { flow_id: String, value: Value },
    /// Reply to a request. `Err` carries the joined server error messages.
    Reply {
        msg_id: String,
        body: Result<Vec<Value>, String>,
    },
    Other,
}

impl InboundFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        let frame: Value = serde_json::from_str(text)?;
        Ok(Self::classify(frame))
    }

    pub fn classify(mut frame: Value) -> Self {
        if frame.get("type").and_then(Value::as_str) == Some("message") {
            let value = frame.get_mut("value").map(Value::take).unwrap_or(Value::Null);
            return match value.get("flowId").and_then(Value::as_str) {
                Some(flow_id) => Self::Push {
                    flow_id: flow_id.to_string(),
                    value,
                },
                None => Self::Other,
            };
        }

        let Some(head) = frame.get("head") else {
            return Self::Other;
        };
        let Some(msg_id) = head.get("msgId").and_then(msg_id_text) else {
            return Self::Other;
        };
        let ok = head.get("ok").map_or(true, is_ok_flag);
        let body = frame.get_mut("body").map(Value::take).unwrap_or(Value::Null);

        let body = if ok {
            Ok(match body {
                Value::Array(records) => records,
                Value::Null => Vec::new(),
                record => vec![record],
            })
        } else {
            Err(join_errors(&body))
        };

        Self::Reply { msg_id, body }
    }
}

/// Interprets a `head.ok` acknowledgement flag.
///
/// The service is inconsistent about the type, so both `true` and `"true"`
/// count as success.
pub fn is_ok_flag(value: &Value) -> bool {
    match value {
        Value::Bool(ok) => *ok,
        Value::String(ok) => ok == "true",
        _ => false,
    }
}

/// Joins `errors: [string, ...]` from an envelope body with newlines.
pub fn join_errors(body: &Value) -> String {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .map(|error| match error {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn msg_id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn heartbeat_serializes_to_bare_type_tag() {
        let value = serde_json::to_value(ClientMessage::Heartbeat).expect("serialize");
        assert_eq!(value, json!({"type": "heartbeat"}));
    }

    #[test]
    fn subscribe_envelope_matches_service_contract() {
        let value = serde_json::to_value(ClientMessage::subscribe(7, "f123")).expect("serialize");
        assert_eq!(
            value,
            json!({"msgId": 7, "object": "drop", "type": "subscribe", "flowId": "f123"})
        );

        let value = serde_json::to_value(ClientMessage::unsubscribe(8, "f123")).expect("serialize");
        assert_eq!(value["type"], "unsubscribe");
        assert_eq!(value["msgId"], 8);
    }

    #[test]
    fn find_many_omits_unset_limit() {
        let message = ClientMessage::find_many(
            "search-1",
            "f1",
            FindOptions::newest_first("EXISTS temperature", None),
        );
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(
            value,
            json!({
                "object": "drop",
                "type": "findmany",
                "flowId": "f1",
                "msgId": "search-1",
                "options": {"filter": "EXISTS temperature", "order": "desc", "hints": 0}
            })
        );

        let limited = ClientMessage::find_many(
            "search-2",
            "f1",
            FindOptions::newest_first("", Some(10)),
        );
        let text = limited.to_text().expect("encode");
        let value: Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(value["options"]["limit"], 10);
    }

    #[test]
    fn classifies_push_frames() {
        let frame = InboundFrame::from_text(
            r#"{"type":"message","value":{"flowId":"f1","elems":{},"creationDate":1}}"#,
        )
        .expect("decode");
        match frame {
            InboundFrame::Push { flow_id, value } => {
                assert_eq!(flow_id, "f1");
                assert_eq!(value["creationDate"], 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn classifies_replies_with_string_or_numeric_ids() {
        let frame = InboundFrame::from_text(r#"{"head":{"msgId":"search-3"},"body":[{"a":1}]}"#)
            .expect("decode");
        assert_eq!(
            frame,
            InboundFrame::Reply {
                msg_id: "search-3".to_string(),
                body: Ok(vec![json!({"a": 1})]),
            }
        );

        let frame = InboundFrame::from_text(r#"{"head":{"msgId":4,"ok":true},"body":null}"#)
            .expect("decode");
        assert_eq!(
            frame,
            InboundFrame::Reply {
                msg_id: "4".to_string(),
                body: Ok(Vec::new()),
            }
        );
    }

    #[test]
    fn failed_reply_carries_joined_errors() {
        let frame = InboundFrame::from_text(
            r#"{"head":{"msgId":"search-1","ok":false},"body":{"errors":["bad filter","try again"]}}"#,
        )
        .expect("decode");
        assert_eq!(
            frame,
            InboundFrame::Reply {
                msg_id: "search-1".to_string(),
                body: Err("bad filter\ntry again".to_string()),
            }
        );
    }

    #[test]
    fn unrecognized_frames_are_other() {
        for text in [
            r#"{"type":"heartbeat"}"#,
            r#"{"type":"message","value":{"elems":{}}}"#,
            r#"{"head":{"ok":true},"body":[]}"#,
            r#"[1,2,3]"#,
        ] {
            assert_eq!(
                InboundFrame::from_text(text).expect("decode"),
                InboundFrame::Other
            );
        }
        assert!(InboundFrame::from_text("not json").is_err());
    }

    #[test]
    fn ok_flag_accepts_bool_and_string_truth() {
        assert!(is_ok_flag(&json!(true)));
        assert!(is_ok_flag(&json!("true")));
        assert!(!is_ok_flag(&json!(false)));
        assert!(!is_ok_flag(&json!("false")));
        assert!(!is_ok_flag(&json!(1)));
        assert!(!is_ok_flag(&json!(null)));
    }
}
