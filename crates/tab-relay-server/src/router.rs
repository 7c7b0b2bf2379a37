//! Command routing.
//!
//! Each automation command is either answered synthetically from the target
//! registry, special-cased with side effects, or forwarded verbatim to the
//! extension. Every failure becomes a per-command error reply; nothing here
//! terminates a connection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use tab_relay_core::error::RelayError;
use tab_relay_core::protocol::{ClientCommand, CommandResponse, EventEnvelope};

use crate::events;
use crate::state::RelayState;

/// How long `Runtime.enable` holds its reply waiting for the session's
/// default execution context to appear.
const CONTEXT_WAIT: Duration = Duration::from_secs(3);

/// Route one command. Returns the reply plus any events synthesized for the
/// requesting client; callers must deliver the reply first.
pub async fn handle_command(
    state: &Arc<RelayState>,
    cmd: ClientCommand,
) -> (CommandResponse, Vec<EventEnvelope>) {
    debug!(method = %cmd.method, id = cmd.id, session = ?cmd.session_id, "Routing command");

    match cmd.method.as_str() {
        "Browser.getVersion" => {
            let descriptor = serde_json::to_value(&state.version).unwrap_or_else(|_| json!({}));
            (CommandResponse::ok(cmd.id, cmd.session_id.clone(), descriptor), vec![])
        }
        // Downloads are not meaningful through the relay.
        "Browser.setDownloadBehavior" => (empty_ok(&cmd), vec![]),
        "Target.setAutoAttach" if cmd.session_id.is_none() => {
            handle_set_auto_attach(state, &cmd).await
        }
        "Target.setDiscoverTargets" => handle_set_discover_targets(state, &cmd).await,
        "Target.attachToTarget" => handle_attach_to_target(state, &cmd).await,
        "Target.getTargetInfo" => (handle_get_target_info(state, &cmd).await, vec![]),
        "Target.getTargets" => (handle_get_targets(state, &cmd).await, vec![]),
        "Runtime.enable" if cmd.session_id.is_some() => {
            (handle_runtime_enable(state, &cmd).await, vec![])
        }
        // Tab creation and removal are capabilities only the extension has.
        "Target.createTarget" | "Target.closeTarget" => (forward(state, &cmd).await, vec![]),
        _ => (forward(state, &cmd).await, vec![]),
    }
}

fn empty_ok(cmd: &ClientCommand) -> CommandResponse {
    CommandResponse::ok(cmd.id, cmd.session_id.clone(), json!({}))
}

fn param_str(cmd: &ClientCommand, key: &str) -> Option<String> {
    cmd.params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

async fn forward(state: &Arc<RelayState>, cmd: &ClientCommand) -> CommandResponse {
    match state
        .extension
        .forward_cdp(cmd.session_id.as_deref(), &cmd.method, cmd.params.clone())
        .await
    {
        Ok(result) => CommandResponse::ok(cmd.id, cmd.session_id.clone(), result),
        Err(e) => CommandResponse::err(cmd.id, cmd.session_id.clone(), e.to_string()),
    }
}

/// Browser-global auto-attach doubles as the initialization signal: the
/// calling library sends it once right after connecting. That behavior is
/// undocumented, so provisioning stays behind this one conditional and can
/// be swapped for an explicit call without touching the rest of the router.
async fn handle_set_auto_attach(
    state: &Arc<RelayState>,
    cmd: &ClientCommand,
) -> (CommandResponse, Vec<EventEnvelope>) {
    if state.config.auto_provision() && state.targets.lock().await.is_empty() {
        match state.extension.dispatch("attachToTab", json!({})).await {
            Ok(result) => register_provisioned_target(state, result).await,
            Err(e) => {
                return (CommandResponse::err(cmd.id, cmd.session_id.clone(), e.to_string()), vec![]);
            }
        }
    }

    let mut synthesized = Vec::new();
    if state.first_auto_attach() {
        for target in state.targets.lock().await.all() {
            synthesized.push(events::synthesized_attach_event(target));
        }
    }
    (empty_ok(cmd), synthesized)
}

async fn register_provisioned_target(state: &Arc<RelayState>, result: Value) {
    let session_id = result.get("sessionId").and_then(Value::as_str);
    let info = result.get("targetInfo").cloned().unwrap_or_else(|| json!({}));
    let target_id = result
        .get("targetId")
        .and_then(Value::as_str)
        .or_else(|| info.get("targetId").and_then(Value::as_str));
    match (session_id, target_id) {
        (Some(session_id), Some(target_id)) => {
            state
                .targets
                .lock()
                .await
                .upsert(session_id.to_string(), target_id.to_string(), info.clone());
        }
        _ => warn!("attachToTab reply missing session or target id, nothing registered"),
    }
}

async fn handle_set_discover_targets(
    state: &Arc<RelayState>,
    cmd: &ClientCommand,
) -> (CommandResponse, Vec<EventEnvelope>) {
    let discover = cmd
        .params
        .as_ref()
        .and_then(|p| p.get("discover"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut synthesized = Vec::new();
    if discover {
        for target in state.targets.lock().await.all() {
            synthesized.push(events::synthesized_target_created_event(target));
        }
    }
    (empty_ok(cmd), synthesized)
}

async fn handle_attach_to_target(
    state: &Arc<RelayState>,
    cmd: &ClientCommand,
) -> (CommandResponse, Vec<EventEnvelope>) {
    let Some(target_id) = param_str(cmd, "targetId") else {
        let err = RelayError::TargetNotFound("targetId missing".into());
        return (CommandResponse::err(cmd.id, cmd.session_id.clone(), err.to_string()), vec![]);
    };

    let targets = state.targets.lock().await;
    match targets.find_by_target_id(&target_id) {
        Some(target) => {
            let reply = CommandResponse::ok(
                cmd.id,
                cmd.session_id.clone(),
                json!({"sessionId": target.session_id}),
            );
            (reply, vec![events::synthesized_attach_event(target)])
        }
        None => {
            let err = RelayError::TargetNotFound(target_id);
            (CommandResponse::err(cmd.id, cmd.session_id.clone(), err.to_string()), vec![])
        }
    }
}

/// Resolves by explicit `targetId`, then by the command's own session, then
/// falls back to the first registered target. Never contacts the extension.
async fn handle_get_target_info(state: &Arc<RelayState>, cmd: &ClientCommand) -> CommandResponse {
    let targets = state.targets.lock().await;

    let (target, missing) = if let Some(target_id) = param_str(cmd, "targetId") {
        (targets.find_by_target_id(&target_id), target_id)
    } else if let Some(session_id) = cmd.session_id.as_deref() {
        (targets.get(session_id), session_id.to_string())
    } else {
        (targets.first(), "no targets registered".to_string())
    };

    match target {
        Some(target) => CommandResponse::ok(
            cmd.id,
            cmd.session_id.clone(),
            json!({"targetInfo": events::attached_target_info(target)}),
        ),
        None => {
            let err = RelayError::TargetNotFound(missing);
            CommandResponse::err(cmd.id, cmd.session_id.clone(), err.to_string())
        }
    }
}

async fn handle_get_targets(state: &Arc<RelayState>, cmd: &ClientCommand) -> CommandResponse {
    let targets = state.targets.lock().await;
    let infos: Vec<Value> = targets.all().iter().map(events::attached_target_info).collect();
    CommandResponse::ok(cmd.id, cmd.session_id.clone(), json!({"targetInfos": infos}))
}

/// Forward, but hold the reply until the session's default execution
/// context has been observed or [`CONTEXT_WAIT`] elapses. Callers otherwise
/// race ahead of a context that does not exist yet. The wait timing out is
/// not a failure.
async fn handle_runtime_enable(state: &Arc<RelayState>, cmd: &ClientCommand) -> CommandResponse {
    let session_id = cmd.session_id.clone().unwrap_or_default();
    // Subscribe before sending so the event cannot slip past between the
    // reply and the wait.
    let mut bus = state.extension.subscribe_events();

    let result = match state
        .extension
        .forward_cdp(cmd.session_id.as_deref(), &cmd.method, cmd.params.clone())
        .await
    {
        Ok(result) => result,
        Err(e) => return CommandResponse::err(cmd.id, cmd.session_id.clone(), e.to_string()),
    };

    let context_seen = async {
        loop {
            match bus.recv().await {
                Ok(event) => {
                    if event.method == "Runtime.executionContextCreated"
                        && event.session_id.as_deref() == Some(session_id.as_str())
                        && event.params["context"]["auxData"]["isDefault"].as_bool() == Some(true)
                    {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    if tokio::time::timeout(CONTEXT_WAIT, context_seen).await.is_err() {
        debug!(session = %session_id, "No default execution context observed, resolving anyway");
    }

    CommandResponse::ok(cmd.id, cmd.session_id.clone(), result)
}
