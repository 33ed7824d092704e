use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chatbridge_runtime::{
    default_system_prompt, load_audience_policy_for_state_dir, load_connection_snapshot,
    AiResponder, ConnectionState, ConnectionStatus, ConnectionSupervisor, DependentTimers,
    DispatcherCollaborators, DispatcherConfig, FileAudienceConfig, JsonConversationStore,
    JsonModeStore, JsonlAuditLog, LogRotationPolicy, MessageDispatcher, NoopFollowUpScheduler,
    OpenAiCompatibleResponder, OpenAiResponderConfig, StatusTracker, SupervisorConfig,
    DEFAULT_GROUP_LABEL,
};
use chatbridge_transport::{
    DisconnectCode, SidecarTransportConfig, SidecarTransportConnector, TransportConnector,
};
use tokio::sync::mpsc;

use crate::cli_args::RunArgs;

const MESSAGE_EVENT_BUFFER: usize = 256;
const DISPATCHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_supervisor_config(state_dir: &Path, args: &RunArgs) -> SupervisorConfig {
    SupervisorConfig {
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        max_credential_resets: args.max_credential_resets,
        session_cleanup_interval: Duration::from_millis(args.session_cleanup_interval_ms),
        session_max_idle: Duration::from_millis(args.session_max_idle_ms),
        ..SupervisorConfig::for_state_dir(state_dir)
    }
}

pub(crate) fn build_responder_config(args: &RunArgs) -> Result<OpenAiResponderConfig> {
    let Some(api_key) = args
        .responder_api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
    else {
        bail!("--responder-api-key (or CHATBRIDGE_RESPONDER_API_KEY) is required for `run`");
    };
    Ok(OpenAiResponderConfig {
        api_base: args.responder_api_base.clone(),
        api_key: api_key.to_string(),
        model: args.responder_model.clone(),
        system_prompt: args
            .responder_system_prompt
            .clone()
            .unwrap_or_else(default_system_prompt),
        request_timeout_ms: args.responder_timeout_ms,
        temperature: None,
    })
}

/// Outcome of observing one connection status change from the foreground loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunVerdict {
    Continue,
    Failed,
    LoggedOut,
}

pub(crate) fn run_verdict(status: &ConnectionStatus) -> RunVerdict {
    match status.state {
        ConnectionState::Failed => RunVerdict::Failed,
        ConnectionState::Idle
            if status.last_close_code == Some(DisconnectCode::LoggedOut.status_code()) =>
        {
            RunVerdict::LoggedOut
        }
        _ => RunVerdict::Continue,
    }
}

pub(crate) async fn execute_run_command(state_dir: &Path, args: RunArgs) -> Result<()> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
    load_audience_policy_for_state_dir(state_dir)?;
    if let Some(snapshot) = load_connection_snapshot(state_dir)? {
        if snapshot.status.state == ConnectionState::Failed {
            bail!(
                "previous run ended in the failed state; run `chatbridge reset` and pair again"
            );
        }
    }

    let responder: Arc<dyn AiResponder> = Arc::new(
        OpenAiCompatibleResponder::new(build_responder_config(&args)?)
            .context("failed to build AI responder")?,
    );
    let logger = Arc::new(JsonlAuditLog::for_state_dir(
        state_dir,
        LogRotationPolicy::from_env(),
    ));
    let conversations = Arc::new(JsonConversationStore::for_state_dir(
        state_dir,
        args.history_window,
    ));
    let follow_ups = Arc::new(NoopFollowUpScheduler);
    let connector: Arc<dyn TransportConnector> =
        Arc::new(SidecarTransportConnector::new(SidecarTransportConfig {
            url: args.sidecar_url.clone(),
            request_timeout_ms: args.sidecar_request_timeout_ms,
            ..SidecarTransportConfig::default()
        }));

    let (event_tx, event_rx) = mpsc::channel(MESSAGE_EVENT_BUFFER);
    let supervisor = ConnectionSupervisor::new(
        build_supervisor_config(state_dir, &args),
        connector,
        DependentTimers {
            conversations: conversations.clone(),
            follow_ups: follow_ups.clone(),
        },
        event_tx,
    );
    let handle = supervisor.handle();
    let dispatcher = MessageDispatcher::new(
        DispatcherConfig {
            processed_message_cap: args.processed_message_cap,
            apology_text: args.apology_text.clone(),
            default_group_label: DEFAULT_GROUP_LABEL.to_string(),
        },
        DispatcherCollaborators {
            logger: logger.clone(),
            conversations,
            modes: Arc::new(JsonModeStore::for_state_dir(state_dir)),
            audience: Arc::new(FileAudienceConfig::for_state_dir(state_dir)),
            follow_ups,
            responder,
        },
        Arc::new(StatusTracker::new(logger)),
        handle.clone(),
    );
    let dispatcher_task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run(event_rx).await }
    });

    if !supervisor.start() {
        bail!(
            "connection is in state '{}'; run `chatbridge reset` before starting again",
            handle.state().as_str()
        );
    }
    tracing::info!(
        state_dir = %state_dir.display(),
        sidecar_url = %args.sidecar_url,
        "chatbridge started"
    );

    let mut status_rx = handle.subscribe();
    let mut announced_challenge: Option<String> = None;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let outcome = loop {
        let status = status_rx.borrow_and_update().clone();
        if status.pairing_challenge != announced_challenge {
            if let Some(challenge) = status.pairing_challenge.as_deref() {
                println!("pairing required; scan this challenge with the phone app:");
                println!("{challenge}");
            }
            announced_challenge = status.pairing_challenge.clone();
        }
        match run_verdict(&status) {
            RunVerdict::Continue => {}
            RunVerdict::Failed => {
                break Err(anyhow::anyhow!(
                    "connection failed after {} credential rejections; run `chatbridge reset` \
                     and pair again",
                    status.reconnect_counter
                ));
            }
            RunVerdict::LoggedOut => {
                break Err(anyhow::anyhow!(
                    "session was logged out from the phone; run `chatbridge reset` and pair again"
                ));
            }
        }

        tokio::select! {
            _ = &mut shutdown => {
                println!("chatbridge shutdown requested");
                break Ok(());
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
        }
    };

    supervisor.stop().await;
    drop(supervisor);
    drop(dispatcher);
    match tokio::time::timeout(DISPATCHER_DRAIN_TIMEOUT, dispatcher_task).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!(error = %error, "dispatcher task ended abnormally"),
        Err(_) => tracing::warn!("timed out waiting for in-flight dispatches to finish"),
    }
    outcome
}
