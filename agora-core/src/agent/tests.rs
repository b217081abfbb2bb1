use super::*;
use crate::bus::Endpoint;
use crate::knowledge::{KnowledgeEdge, KnowledgeGraph, KnowledgeNode};
use crate::memory::{InMemorySink, MemoryEntry};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// Fails tasks whose payload carries `"fail"`, panics on `"panic"`, records the
/// status seen while running
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<AgentStatus>>,
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, task: &Task, agent: &Agent) -> anyhow::Result<serde_json::Value> {
        let status = agent.status().await;
        self.seen.lock().unwrap().push(status);
        if task.payload.get("fail").is_some() {
            anyhow::bail!("requested failure");
        }
        if task.payload.get("panic").is_some() {
            panic!("boom");
        }
        Ok(json!({ "handled": task.payload }))
    }
}

async fn agent_with(handler: Arc<dyn TaskHandler>, bus: &MessageBus) -> Agent {
    Agent::builder()
        .id("worker")
        .capability("inspect")
        .handler(handler)
        .bus(bus.clone())
        .build()
        .await
        .unwrap()
}

fn task_message(task: &Task) -> Message {
    Message::new(MessageKind::Task, "caller", serde_json::to_value(task).unwrap()).to("worker")
}

async fn next_outcome(endpoint: &mut Endpoint) -> (Message, TaskOutcome) {
    let message = endpoint
        .recv_timeout(Duration::from_secs(1))
        .await
        .expect("response");
    assert_eq!(message.kind(), MessageKind::Response);
    let outcome = TaskOutcome::from_message(&message).expect("task outcome");
    (message, outcome)
}

#[tokio::test]
async fn test_successful_task_replies_and_records_result() {
    let bus = MessageBus::new();
    let mut caller = bus.open_endpoint("caller").await.unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let agent = agent_with(handler.clone(), &bus).await;

    let task = Task::new("inspect", json!({ "n": 1 }));
    let request = task_message(&task);
    agent.handle_message(request.clone()).await;

    let (reply, outcome) = next_outcome(&mut caller).await;
    assert_eq!(reply.sender(), "worker");
    assert_eq!(reply.correlation_id(), Some(request.id()));
    assert!(outcome.success);
    assert_eq!(outcome.task_id, task.id);
    assert_eq!(outcome.result, Some(json!({ "handled": { "n": 1 } })));

    assert_eq!(*handler.seen.lock().unwrap(), vec![AgentStatus::Processing]);
    assert_eq!(agent.status().await, AgentStatus::Idle);
    assert_eq!(agent.tasks_handled(), 1);
    assert_eq!(
        agent.short_term().retrieve(&format!("task_{}", task.id)),
        Some(json!({ "handled": { "n": 1 } }))
    );
}

#[tokio::test]
async fn test_failed_task_reports_error_then_recovers() {
    let bus = MessageBus::new();
    let mut caller = bus.open_endpoint("caller").await.unwrap();
    let agent = agent_with(Arc::new(RecordingHandler::default()), &bus).await;

    let failing = Task::new("inspect", json!({ "fail": true }));
    agent.handle_message(task_message(&failing)).await;

    let (_, outcome) = next_outcome(&mut caller).await;
    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().contains("requested failure"));

    let state = agent.state().await;
    assert_eq!(state.status, AgentStatus::Error);
    assert!(state.last_error.unwrap().contains("requested failure"));
    assert_eq!(agent.error_count(), 1);

    let record = agent
        .short_term()
        .retrieve(&format!("error_{}", failing.id))
        .unwrap();
    assert_eq!(record["task"]["id"], json!(failing.id));
    assert!(record["error"].as_str().unwrap().contains("requested failure"));

    agent
        .handle_message(task_message(&Task::new("inspect", json!({}))))
        .await;
    let (_, outcome) = next_outcome(&mut caller).await;
    assert!(outcome.success);
    assert_eq!(agent.status().await, AgentStatus::Idle);
    assert_eq!(agent.error_count(), 1);
    assert_eq!(agent.tasks_handled(), 2);
}

#[tokio::test]
async fn test_panicking_handler_fails_task_and_keeps_agent_alive() {
    let bus = MessageBus::new();
    let mut caller = bus.open_endpoint("caller").await.unwrap();
    let agent = Agent::builder()
        .id("worker")
        .capability("inspect")
        .handler(Arc::new(RecordingHandler::default()))
        .bus(bus.clone())
        .spawn()
        .await
        .unwrap();

    let panicking = Task::new("inspect", json!({ "panic": true }));
    bus.send(task_message(&panicking)).await.unwrap();

    let (_, outcome) = next_outcome(&mut caller).await;
    assert!(!outcome.success);
    assert_eq!(outcome.task_id, panicking.id);
    assert!(outcome.error.as_deref().unwrap().contains("handler panicked: boom"));

    let state = agent.state().await;
    assert_eq!(state.status, AgentStatus::Error);
    assert!(state.last_error.unwrap().contains("boom"));
    assert_eq!(agent.error_count(), 1);
    assert!(
        agent
            .short_term()
            .retrieve(&format!("error_{}", panicking.id))
            .is_some()
    );

    // the inbox loop survived the panic
    bus.send(task_message(&Task::new("inspect", json!({}))))
        .await
        .unwrap();
    let (_, outcome) = next_outcome(&mut caller).await;
    assert!(outcome.success);
    assert_eq!(agent.status().await, AgentStatus::Idle);
    assert_eq!(agent.tasks_handled(), 2);
    assert_eq!(bus.agent_count().await, 1);
}

#[tokio::test]
async fn test_raw_task_payload_is_wrapped() {
    let bus = MessageBus::new();
    let mut caller = bus.open_endpoint("caller").await.unwrap();
    let agent = agent_with(Arc::new(RecordingHandler::default()), &bus).await;

    let request = Message::new(MessageKind::Task, "caller", json!("plain text")).to("worker");
    agent.handle_message(request.clone()).await;

    let (_, outcome) = next_outcome(&mut caller).await;
    assert!(outcome.success);
    assert_eq!(outcome.task_id, request.id());
    assert_eq!(outcome.result, Some(json!({ "handled": "plain text" })));
}

#[tokio::test]
async fn test_query_answers_without_status_change() {
    let bus = MessageBus::new();
    let mut caller = bus.open_endpoint("caller").await.unwrap();
    let graph = KnowledgeGraph::shared();
    graph
        .add_node(KnowledgeNode::new("doc1", "document").with_property("lang", json!("en")))
        .unwrap();
    graph
        .add_node(KnowledgeNode::new("doc2", "document").with_property("lang", json!("fr")))
        .unwrap();
    graph
        .add_edge(KnowledgeEdge::new("doc1", "doc2", "cites"))
        .unwrap();

    let agent = Agent::builder()
        .id("worker")
        .handler(Arc::new(RecordingHandler::default()))
        .knowledge(graph)
        .bus(bus.clone())
        .build()
        .await
        .unwrap();
    agent.short_term().store("fact", json!(42), None).await;

    // put the agent in the error state first; queries must not clear it
    agent
        .handle_message(task_message(&Task::new("inspect", json!({ "fail": 1 }))))
        .await;
    let _ = caller.recv_timeout(Duration::from_secs(1)).await;

    let ask = |payload| Message::new(MessageKind::Query, "caller", payload).to("worker");

    agent.handle_message(ask(json!({ "key": "fact" }))).await;
    let answer = caller.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(answer.payload(), &json!({ "key": "fact", "found": true, "value": 42 }));

    agent.handle_message(ask(json!({ "node_id": "doc2" }))).await;
    let answer = caller.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(answer.payload()["found"], json!(true));
    assert_eq!(answer.payload()["node"]["node_type"], json!("document"));

    agent
        .handle_message(ask(json!({ "node_type": "document", "properties": { "lang": "fr" } })))
        .await;
    let answer = caller.recv_timeout(Duration::from_secs(1)).await.unwrap();
    let nodes = answer.payload()["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["id"], json!("doc2"));

    agent.handle_message(ask(json!("what?"))).await;
    let answer = caller.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert!(answer.payload()["error"].is_string());

    assert_eq!(agent.status().await, AgentStatus::Error);
    assert_eq!(agent.tasks_handled(), 1);
}

#[tokio::test]
async fn test_dispatcher_routes_by_capability() {
    let bus = MessageBus::new();
    let mut caller = bus.open_endpoint("caller").await.unwrap();
    let dispatcher = CapabilityDispatcher::new()
        .on(
            "upper",
            handler_fn(|task| {
                Box::pin(async move {
                    Ok(json!(task.payload.as_str().unwrap_or_default().to_uppercase()))
                })
            }),
        )
        .on(
            "len",
            handler_fn(|task| {
                Box::pin(async move { Ok(json!(task.payload.as_str().map(str::len))) })
            }),
        );

    let agent = Agent::builder()
        .id("worker")
        .dispatcher(dispatcher)
        .bus(bus.clone())
        .build()
        .await
        .unwrap();
    assert!(agent.has_capability("upper"));
    assert!(agent.has_capability("len"));

    agent
        .handle_message(task_message(&Task::new("upper", json!("abc"))))
        .await;
    let (_, outcome) = next_outcome(&mut caller).await;
    assert_eq!(outcome.result, Some(json!("ABC")));

    agent
        .handle_message(task_message(&Task::new("translate", json!("abc"))))
        .await;
    let (_, outcome) = next_outcome(&mut caller).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("Unsupported task type: translate"));
}

#[tokio::test]
async fn test_role_capabilities_join_agent() {
    let bus = MessageBus::new();
    let role = Role::new("reviewer", ["review", "approve"], "Reviews analyses");
    let agent = Agent::builder()
        .id("worker")
        .role(role)
        .capability("inspect")
        .handler(Arc::new(RecordingHandler::default()))
        .bus(bus)
        .build()
        .await
        .unwrap();

    assert_eq!(agent.role().unwrap().name, "reviewer");
    let caps: Vec<&str> = agent.capabilities().iter().map(String::as_str).collect();
    assert_eq!(caps, vec!["approve", "inspect", "review"]);
}

#[tokio::test]
async fn test_role_presets_by_name() {
    for name in Role::PRESETS {
        assert_eq!(Role::preset(name).unwrap().name, name);
    }
    assert!(Role::preset("janitor").is_none());

    let bus = MessageBus::new();
    let agent = Agent::builder()
        .id("scout")
        .preset("researcher")
        .capability("cite")
        .handler(Arc::new(RecordingHandler::default()))
        .bus(bus.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(agent.role(), Some(&Role::researcher()));
    let caps: Vec<&str> = agent.capabilities().iter().map(String::as_str).collect();
    assert_eq!(caps, vec!["analyze", "cite", "research", "summarize"]);

    let err = Agent::builder()
        .id("scout")
        .preset("janitor")
        .handler(Arc::new(RecordingHandler::default()))
        .bus(bus)
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, AgoraError::Configuration(ref m) if m.contains("janitor")));
}

#[tokio::test]
async fn test_builder_requires_id_handler_and_bus() {
    let handler: Arc<dyn TaskHandler> = Arc::new(RecordingHandler::default());

    let missing_id = Agent::builder()
        .handler(handler.clone())
        .bus(MessageBus::new())
        .build()
        .await;
    assert!(matches!(missing_id, Err(AgoraError::Configuration(_))));

    let missing_handler = Agent::builder().id("a").bus(MessageBus::new()).build().await;
    assert!(matches!(missing_handler, Err(AgoraError::Configuration(_))));

    let missing_bus = Agent::builder().id("a").handler(handler).build().await;
    assert!(matches!(missing_bus, Err(AgoraError::Configuration(_))));
}

#[tokio::test]
async fn test_proposal_and_consensus_are_remembered() {
    let bus = MessageBus::new();
    let agent = agent_with(Arc::new(RecordingHandler::default()), &bus).await;

    let proposal = Proposal {
        problem_id: "p1".to_string(),
        solution: json!("X"),
        proposer: "peer".to_string(),
        created_at: Utc::now(),
    };
    agent
        .handle_message(Message::new(
            MessageKind::Proposal,
            "peer",
            serde_json::to_value(&proposal).unwrap(),
        ))
        .await;
    assert_eq!(
        agent.short_term().retrieve("proposal_p1").unwrap()["solution"],
        json!("X")
    );

    let decision = json!({
        "problem_id": "p1",
        "proposal": proposal,
        "tally": {
            "votes": { "peer": true, "worker": true },
            "approvals": 2,
            "rejections": 0,
            "registered_agents": 3,
            "quorum_met": true
        },
        "reached_at": Utc::now(),
    });
    agent
        .handle_message(Message::new(
            MessageKind::ConsensusReached,
            "consensus-coordinator",
            decision,
        ))
        .await;
    assert_eq!(
        agent.long_term().retrieve("consensus_p1").unwrap()["tally"]["approvals"],
        json!(2)
    );
    assert!(agent.recall("consensus_p1").is_some());
}

#[tokio::test]
async fn test_agent_with_policy_votes_through_coordinator() {
    let bus = MessageBus::new();
    let coordinator = Arc::new(ConsensusCoordinator::new(bus.clone()));
    let agent = Agent::builder()
        .id("worker")
        .handler(Arc::new(RecordingHandler::default()))
        .bus(bus.clone())
        .coordinator(coordinator.clone())
        .vote_policy(vote_fn(|proposal| proposal.solution == json!("good")))
        .spawn()
        .await
        .unwrap();

    coordinator.propose("outsider", "p1", json!("bad")).await.unwrap();
    coordinator.propose("outsider", "p2", json!("good")).await.unwrap();

    // one registered agent: its vote alone meets quorum
    tokio::time::timeout(Duration::from_secs(2), async {
        while !(coordinator.tally("p1").await.is_some_and(|t| t.voters() == 1)
            && coordinator.is_resolved("p2"))
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(!coordinator.is_resolved("p1"));
    assert_eq!(coordinator.tally("p1").await.unwrap().rejections, 1);
    assert_eq!(coordinator.decision("p2").unwrap().tally.votes.get("worker"), Some(&true));
    assert_eq!(agent.id(), "worker");
}

#[tokio::test]
async fn test_long_term_sink_is_loaded_on_build() {
    let bus = MessageBus::new();
    let sink = Arc::new(InMemorySink::with_entries(vec![MemoryEntry::new(
        "consensus_old",
        json!({ "problem_id": "old" }),
        None,
    )]));

    let agent = Agent::builder()
        .id("worker")
        .handler(Arc::new(RecordingHandler::default()))
        .long_term_sink(sink.clone())
        .bus(bus)
        .build()
        .await
        .unwrap();

    assert!(agent.long_term().is_persistent());
    assert_eq!(agent.recall("consensus_old"), Some(json!({ "problem_id": "old" })));
    assert!(agent.long_term().warnings().is_empty());
}

#[tokio::test]
async fn test_responses_are_recorded_by_correlation() {
    let bus = MessageBus::new();
    let agent = agent_with(Arc::new(RecordingHandler::default()), &bus).await;

    let request = Message::new(MessageKind::Query, "worker", json!({ "key": "x" })).to("peer");
    let reply = request.reply(MessageKind::Response, "peer", json!({ "found": false }));
    agent.handle_message(reply).await;

    assert_eq!(
        agent
            .short_term()
            .retrieve(&format!("response_{}", request.id())),
        Some(json!({ "found": false }))
    );
}
