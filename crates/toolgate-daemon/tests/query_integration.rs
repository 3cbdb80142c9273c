#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the query facade over an in-memory agent.
//!
//! The agent side of a `tokio::io::duplex` pair plays the subprocess: it emits
//! stream-json frames and reads back the host's control responses.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use toolgate_core::config::PermissionConfig;
use toolgate_core::ndjson::Frame;
use toolgate_core::{PermissionMode, StaticPolicy};
use toolgate_daemon::permission::{
    ApprovalError, BrokerConfig, FnApproval, PermissionBroker, PermissionRequest,
};
use toolgate_daemon::query::{Gateway, Query, QueryOptions};
use toolgate_daemon::subprocess::{PromptSource, TransportOptions};

struct FakeAgent {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeAgent {
    async fn say(&mut self, value: Value) {
        self.writer
            .write_all(format!("{value}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn hear(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn ask(&mut self, request_id: &str, tool_name: &str, input: Value) {
        self.say(json!({
            "type": "control_request",
            "request_id": request_id,
            "request": {"subtype": "can_use_tool", "tool_name": tool_name, "input": input}
        }))
        .await;
    }
}

fn manual_gateway() -> (Gateway, Arc<PermissionBroker>) {
    let broker = Arc::new(PermissionBroker::new(
        Arc::new(StaticPolicy::new(PermissionMode::Manual)),
        BrokerConfig::default(),
    ));
    (Gateway::new(Arc::clone(&broker)), broker)
}

fn start(gateway: &Gateway, parent: &CancellationToken, options: QueryOptions) -> (Query, FakeAgent) {
    let (host, agent) = tokio::io::duplex(64 * 1024);
    let (host_r, host_w) = tokio::io::split(host);
    let (agent_r, agent_w) = tokio::io::split(agent);
    let query = gateway.query_attached(parent, host_r, host_w, PromptSource::Empty, options);
    (
        query,
        FakeAgent {
            lines: BufReader::new(agent_r).lines(),
            writer: agent_w,
        },
    )
}

fn scoped(scope: &str) -> QueryOptions {
    QueryOptions {
        transport: TransportOptions {
            scope_id: Some(scope.to_string()),
            ..TransportOptions::default()
        },
        ..QueryOptions::default()
    }
}

async fn wait_for_pending<F>(broker: &PermissionBroker, mut done: F) -> Vec<PermissionRequest>
where
    F: FnMut(&[PermissionRequest]) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let pending = broker.pending_requests().await;
            if done(&pending) {
                return pending;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn conversation_flows_while_a_decision_is_pending() {
    let (gateway, broker) = manual_gateway();
    let (mut query, mut agent) = start(&gateway, &CancellationToken::new(), QueryOptions::default());

    agent
        .say(json!({"type": "system", "subtype": "init", "session_id": "sess-1", "model": "m"}))
        .await;
    agent.ask("req_1", "Bash", json!({"command": "ls -la"})).await;
    agent
        .say(json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "checking files"}]}
        }))
        .await;

    // Both conversation frames arrive although the permission ask is unanswered.
    assert!(matches!(query.next().await, Some(Frame::System(_))));
    assert!(matches!(query.next().await, Some(Frame::Assistant(_))));
    assert_eq!(query.session_id().await.as_deref(), Some("sess-1"));

    let pending = wait_for_pending(&broker, |p| p.len() == 1).await;
    assert_eq!(pending[0].scope_id, "sess-1");
    assert_eq!(pending[0].control_request_id, "req_1");
    assert_eq!(pending[0].tool_name, "Bash");

    broker
        .submit_decision(&pending[0].request_id, true, "user approved")
        .await
        .unwrap();

    let response = agent.hear().await;
    assert_eq!(response["type"], "control_response");
    assert_eq!(response["response"]["subtype"], "success");
    assert_eq!(response["response"]["request_id"], "req_1");
    assert_eq!(response["response"]["response"]["behavior"], "allow");
    assert_eq!(
        response["response"]["response"]["updatedInput"],
        json!({"command": "ls -la"})
    );
}

#[tokio::test]
async fn denial_reason_reaches_the_agent() {
    let (gateway, broker) = manual_gateway();
    let (_query, mut agent) = start(&gateway, &CancellationToken::new(), scoped("s1"));

    agent.ask("req_7", "Write", json!({"file_path": "/etc/hosts"})).await;
    let pending = wait_for_pending(&broker, |p| p.len() == 1).await;
    broker
        .submit_decision(&pending[0].request_id, false, "not in this repo")
        .await
        .unwrap();

    let response = agent.hear().await;
    assert_eq!(response["response"]["response"]["behavior"], "deny");
    assert_eq!(response["response"]["response"]["message"], "not in this repo");
}

#[tokio::test]
async fn agent_cancel_resolves_wait_and_still_answers() {
    let (gateway, broker) = manual_gateway();
    let (_query, mut agent) = start(&gateway, &CancellationToken::new(), scoped("s1"));

    agent.ask("req_2", "Bash", json!({"command": "make"})).await;
    wait_for_pending(&broker, |p| p.len() == 1).await;

    agent
        .say(json!({"type": "control_cancel_request", "request_id": "req_2"}))
        .await;

    let response = agent.hear().await;
    assert_eq!(response["response"]["request_id"], "req_2");
    assert_eq!(response["response"]["response"]["behavior"], "deny");
    assert_eq!(response["response"]["response"]["message"], "context cancelled");
    assert_eq!(broker.pending_count().await, 0);
}

#[tokio::test]
async fn failing_approval_source_becomes_deny() {
    let (gateway, _broker) = manual_gateway();
    let approval = FnApproval::new(|_cancel, _request| async {
        Err(ApprovalError::Failed("approval backend unreachable".into()))
    });
    let options = QueryOptions {
        approval: Some(Arc::new(approval)),
        ..QueryOptions::default()
    };
    let (_query, mut agent) = start(&gateway, &CancellationToken::new(), options);

    agent.ask("req_3", "Bash", json!({})).await;
    let response = agent.hear().await;
    assert_eq!(response["response"]["response"]["behavior"], "deny");
    assert_eq!(
        response["response"]["response"]["message"],
        "approval backend unreachable"
    );
}

#[tokio::test]
async fn closing_a_query_cancels_only_its_own_waits() {
    let (gateway, broker) = manual_gateway();
    let parent = CancellationToken::new();
    let (query_a, mut agent_a) = start(&gateway, &parent, scoped("scope-a"));
    let (_query_b, mut agent_b) = start(&gateway, &parent, scoped("scope-b"));

    agent_a.ask("req_a", "Bash", json!({})).await;
    agent_b.ask("req_b", "Bash", json!({})).await;
    wait_for_pending(&broker, |p| p.len() == 2).await;

    query_a.close().await;

    let remaining = wait_for_pending(&broker, |p| p.len() == 1).await;
    assert_eq!(remaining[0].scope_id, "scope-b");

    broker
        .submit_decision(&remaining[0].request_id, true, "ok")
        .await
        .unwrap();
    let response = agent_b.hear().await;
    assert_eq!(response["response"]["response"]["behavior"], "allow");
}

#[tokio::test]
async fn unbounded_decision_duration_still_answers() {
    let broker = Arc::new(PermissionBroker::from_config(&PermissionConfig {
        default_mode: PermissionMode::Manual,
        remember_decisions: true,
        decision_duration_secs: u64::MAX,
        ..PermissionConfig::default()
    }));
    let gateway = Gateway::new(Arc::clone(&broker));
    let (_query, mut agent) = start(&gateway, &CancellationToken::new(), scoped("s1"));

    agent.ask("req_1", "Bash", json!({"command": "ls"})).await;
    let pending = wait_for_pending(&broker, |p| p.len() == 1).await;
    broker
        .submit_decision(&pending[0].request_id, true, "ok")
        .await
        .unwrap();

    let response = agent.hear().await;
    assert_eq!(response["response"]["request_id"], "req_1");
    assert_eq!(response["response"]["response"]["behavior"], "allow");

    // Remembered without expiry: the next ask is answered from the cache.
    agent.ask("req_2", "Bash", json!({"command": "pwd"})).await;
    let response = agent.hear().await;
    assert_eq!(response["response"]["request_id"], "req_2");
    assert_eq!(response["response"]["response"]["behavior"], "allow");
    assert_eq!(broker.pending_count().await, 0);
}

#[tokio::test]
async fn requests_before_session_start_use_default_scope() {
    let (gateway, broker) = manual_gateway();
    let (_query, mut agent) = start(&gateway, &CancellationToken::new(), QueryOptions::default());

    agent.ask("req_4", "Read", json!({"file_path": "a.txt"})).await;
    let pending = wait_for_pending(&broker, |p| p.len() == 1).await;
    assert_eq!(pending[0].scope_id, "default");
}

#[tokio::test]
async fn result_frame_ends_the_turn() {
    let (gateway, _broker) = manual_gateway();
    let (mut query, mut agent) = start(&gateway, &CancellationToken::new(), QueryOptions::default());

    agent.say(json!({"type": "not_a_frame_we_know", "x": 1})).await;
    agent.writer.write_all(b"garbage line\n").await.unwrap();
    agent
        .say(json!({
            "type": "result",
            "subtype": "success",
            "session_id": "sess-2",
            "result": "done",
            "is_error": false,
            "num_turns": 1
        }))
        .await;

    assert!(matches!(query.next().await, Some(Frame::Unknown { .. })));
    match query.next().await {
        Some(Frame::Result(result)) => {
            assert_eq!(result.result.as_deref(), Some("done"));
            assert!(!result.is_error);
        }
        other => panic!("expected result frame, got {other:?}"),
    }

    query.close().await;
    assert!(query.next().await.is_none());
}

#[cfg(unix)]
const SCRIPT_AGENT: &str = r#"#!/bin/sh
read -r prompt
echo '{"type":"system","subtype":"init","session_id":"sess-sh"}'
echo '{"type":"control_request","request_id":"req_1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"true"}}}'
read -r answer
case "$answer" in
  *'"allow"'*) verdict=allowed ;;
  *) verdict=denied ;;
esac
echo "{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"sess-sh\",\"result\":\"$verdict\",\"is_error\":false,\"num_turns\":1}"
"#;

#[cfg(unix)]
#[tokio::test]
async fn spawned_agent_round_trip() {
    use std::os::unix::fs::PermissionsExt;

    use toolgate_daemon::subprocess::LaunchOptions;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("agent.sh");
    std::fs::write(&script, SCRIPT_AGENT).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let broker = Arc::new(PermissionBroker::new(
        Arc::new(StaticPolicy::new(PermissionMode::Skip)),
        BrokerConfig::default(),
    ));
    let gateway = Gateway::new(broker);
    let options = QueryOptions {
        launch: LaunchOptions {
            binary: script,
            working_directory: dir.path().to_path_buf(),
            ..LaunchOptions::default()
        },
        ..QueryOptions::default()
    };

    let mut query = gateway
        .query(
            &CancellationToken::new(),
            PromptSource::Text("hello".into()),
            options,
        )
        .unwrap();

    let mut verdict = None;
    while let Some(frame) = tokio::time::timeout(Duration::from_secs(10), query.next())
        .await
        .unwrap()
    {
        if let Frame::Result(result) = frame {
            verdict = result.result;
            break;
        }
    }
    assert_eq!(verdict.as_deref(), Some("allowed"));
    assert_eq!(query.session_id().await.as_deref(), Some("sess-sh"));
    query.close().await;
}
