//! CDP event intake and synthesis.
//!
//! Events genuinely sourced from the extension maintain the target registry
//! and are broadcast verbatim to every client. Events the router fabricates
//! (a real browser would emit them itself) carry a provenance marker so
//! consumers can tell the two apart.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, error};

use tab_relay_core::protocol::{EventEnvelope, ForwardedEvent};
use tab_relay_core::targets::Target;

use crate::state::RelayState;

/// Marker set inside `params` of every router-generated event.
pub const SYNTHESIZED_MARKER: &str = "_relayGenerated";

/// Handle one `forwardCDPEvent` from the extension: update the registry,
/// wake any command waiting on the event bus, then fan out verbatim.
pub async fn handle_forwarded_event(state: &Arc<RelayState>, event: ForwardedEvent) {
    maintain_registry(state, &event).await;
    state.extension.publish_event(event.clone());

    let envelope = EventEnvelope {
        method: event.method,
        session_id: event.session_id,
        params: event.params,
    };
    match serde_json::to_string(&envelope) {
        Ok(text) => state.clients.broadcast(&text).await,
        Err(e) => error!(%e, "Failed to serialize event"),
    }
}

async fn maintain_registry(state: &Arc<RelayState>, event: &ForwardedEvent) {
    match event.method.as_str() {
        "Target.attachedToTarget" => {
            let session_id = event.params.get("sessionId").and_then(Value::as_str);
            let info = event.params.get("targetInfo");
            let target_id = info
                .and_then(|i| i.get("targetId"))
                .and_then(Value::as_str);
            match (session_id, target_id, info) {
                (Some(session_id), Some(target_id), Some(info)) => {
                    state.targets.lock().await.upsert(
                        session_id.to_string(),
                        target_id.to_string(),
                        info.clone(),
                    );
                }
                _ => debug!("Attach event missing session or target id, registry unchanged"),
            }
        }
        "Target.targetInfoChanged" => {
            if let Some(info) = event.params.get("targetInfo") {
                if let Some(target_id) = info.get("targetId").and_then(Value::as_str) {
                    state.targets.lock().await.update_info(target_id, info.clone());
                }
            }
        }
        "Target.detachedFromTarget" | "Target.targetCrashed" => {
            let mut targets = state.targets.lock().await;
            let session_id = event
                .params
                .get("sessionId")
                .and_then(Value::as_str)
                .or(event.session_id.as_deref());
            if let Some(session_id) = session_id {
                targets.remove(session_id);
            } else if let Some(target_id) = event.params.get("targetId").and_then(Value::as_str) {
                targets.remove_by_target_id(target_id);
            }
        }
        _ => {}
    }
}

/// The target's mirrored info with `targetId` and `attached` pinned, as
/// automation clients expect from target-discovery payloads.
pub fn attached_target_info(target: &Target) -> Value {
    let mut info = target.target_info.clone();
    if let Some(obj) = info.as_object_mut() {
        obj.insert("targetId".into(), Value::String(target.target_id.clone()));
        obj.insert("attached".into(), Value::Bool(true));
    }
    info
}

pub fn synthesized_attach_event(target: &Target) -> EventEnvelope {
    EventEnvelope {
        method: "Target.attachedToTarget".into(),
        session_id: None,
        params: json!({
            "sessionId": target.session_id,
            "targetInfo": attached_target_info(target),
            "waitingForDebugger": false,
            SYNTHESIZED_MARKER: true,
        }),
    }
}

pub fn synthesized_target_created_event(target: &Target) -> EventEnvelope {
    EventEnvelope {
        method: "Target.targetCreated".into(),
        session_id: None,
        params: json!({
            "targetInfo": attached_target_info(target),
            SYNTHESIZED_MARKER: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tab_relay_core::config::RelayConfig;

    fn state() -> Arc<RelayState> {
        Arc::new(RelayState::new(RelayConfig::default()))
    }

    fn forwarded(method: &str, session_id: Option<&str>, params: Value) -> ForwardedEvent {
        serde_json::from_value(json!({
            "method": method,
            "sessionId": session_id,
            "params": params,
        }))
        .unwrap()
    }

    fn attach_params(session_id: &str, target_id: &str, url: &str) -> Value {
        json!({
            "sessionId": session_id,
            "targetInfo": {"targetId": target_id, "url": url, "title": "", "type": "page"},
            "waitingForDebugger": false,
        })
    }

    #[tokio::test]
    async fn attach_event_registers_target() {
        let state = state();
        let event = forwarded(
            "Target.attachedToTarget",
            None,
            attach_params("s1", "t1", "https://example.com"),
        );
        handle_forwarded_event(&state, event).await;

        let targets = state.targets.lock().await;
        assert_eq!(targets.get("s1").unwrap().target_id, "t1");
    }

    #[tokio::test]
    async fn info_changed_refreshes_metadata() {
        let state = state();
        handle_forwarded_event(
            &state,
            forwarded("Target.attachedToTarget", None, attach_params("s1", "t1", "a")),
        )
        .await;
        handle_forwarded_event(
            &state,
            forwarded(
                "Target.targetInfoChanged",
                Some("s1"),
                json!({"targetInfo": {"targetId": "t1", "url": "b"}}),
            ),
        )
        .await;

        let targets = state.targets.lock().await;
        assert_eq!(targets.get("s1").unwrap().target_info["url"], "b");
    }

    #[tokio::test]
    async fn detach_event_removes_by_envelope_session() {
        let state = state();
        handle_forwarded_event(
            &state,
            forwarded("Target.attachedToTarget", None, attach_params("s1", "t1", "a")),
        )
        .await;
        handle_forwarded_event(
            &state,
            forwarded("Target.detachedFromTarget", Some("s1"), json!({})),
        )
        .await;

        assert!(state.targets.lock().await.get("s1").is_none());
    }

    #[tokio::test]
    async fn crash_event_removes_by_params_session() {
        let state = state();
        handle_forwarded_event(
            &state,
            forwarded("Target.attachedToTarget", None, attach_params("s1", "t1", "a")),
        )
        .await;
        handle_forwarded_event(
            &state,
            forwarded("Target.targetCrashed", None, json!({"sessionId": "s1"})),
        )
        .await;

        assert!(state.targets.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unrelated_events_leave_registry_alone() {
        let state = state();
        handle_forwarded_event(
            &state,
            forwarded("Target.attachedToTarget", None, attach_params("s1", "t1", "a")),
        )
        .await;
        handle_forwarded_event(
            &state,
            forwarded("Page.loadEventFired", Some("s1"), json!({"timestamp": 1.0})),
        )
        .await;

        assert_eq!(state.targets.lock().await.len(), 1);
    }

    #[test]
    fn synthesized_events_carry_provenance_marker() {
        let target = Target {
            session_id: "s1".into(),
            target_id: "t1".into(),
            target_info: json!({"url": "a", "type": "page"}),
        };

        let attach = synthesized_attach_event(&target);
        assert_eq!(attach.method, "Target.attachedToTarget");
        assert_eq!(attach.params[SYNTHESIZED_MARKER], true);
        assert_eq!(attach.params["sessionId"], "s1");
        assert_eq!(attach.params["targetInfo"]["attached"], true);

        let created = synthesized_target_created_event(&target);
        assert_eq!(created.method, "Target.targetCreated");
        assert_eq!(created.params[SYNTHESIZED_MARKER], true);
        assert_eq!(created.params["targetInfo"]["targetId"], "t1");
    }
}
