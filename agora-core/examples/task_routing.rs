//! Task routing example
//!
//! Three analysts and a researcher share a bus. The router spreads
//! analysis tasks round-robin over the analysts and sends research to the
//! only agent that can do it; one task fails on purpose to show the failed
//! RESPONSE path.

use std::time::Duration;

use agora_core::prelude::*;
use agora_core::telemetry;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing()?;

    println!("Task Routing Example");
    println!("====================\n");

    let bus = MessageBus::new();
    let router = TaskRouter::start(bus.clone(), RouterConfig::default()).await?;

    let analyst = Role::new("analyst", ["analysis"], "Scores documents");
    for id in ["analyst_1", "analyst_2", "analyst_3"] {
        let dispatcher = CapabilityDispatcher::new().on(
            "analysis",
            handler_fn(|task| {
                Box::pin(async move {
                    let text = task.payload["text"].as_str().unwrap_or_default();
                    if text.is_empty() {
                        anyhow::bail!("nothing to analyze");
                    }
                    Ok(json!({ "words": text.split_whitespace().count() }))
                })
            }),
        );
        let agent = Agent::builder()
            .id(id)
            .role(analyst.clone())
            .dispatcher(dispatcher)
            .bus(bus.clone())
            .spawn()
            .await?;
        router.register_capabilities(agent.id(), agent.capabilities().iter().cloned());
    }

    let researcher = Agent::builder()
        .id("researcher")
        .capability("research")
        .handler(handler_fn(|task| {
            Box::pin(async move { Ok(json!({ "sources": [task.payload["topic"].clone()] })) })
        }))
        .bus(bus.clone())
        .spawn()
        .await?;
    router.register_capabilities(researcher.id(), ["research"]);

    let tasks = vec![
        Task::new("analysis", json!({ "text": "agents share one bus" })),
        Task::new("analysis", json!({ "text": "round robin per capability" })),
        Task::new("research", json!({ "topic": "quorum" })),
        Task::new("analysis", json!({ "text": "" })),
        Task::new("analysis", json!({ "text": "fifo per recipient" })),
    ];

    let mut submitted = Vec::new();
    for task in tasks {
        let assignment = router.submit(task).await?;
        println!(
            "  → {} task {} assigned to {}",
            assignment.task.required_capability, assignment.task.id, assignment.agent_id
        );
        submitted.push(assignment.task.id);
    }

    match router.submit(Task::new("translation", json!({}))).await {
        Err(AgoraError::NoCapableAgent(capability)) => {
            println!("  ✗ nobody can do {}\n", capability)
        }
        other => println!("  ? unexpected: {:?}\n", other),
    }

    for task_id in submitted {
        let done = router
            .await_completion(task_id, Duration::from_secs(2))
            .await?;
        match done.status {
            AssignmentStatus::Completed => println!(
                "  ✓ {} by {}: {}",
                task_id,
                done.agent_id,
                done.result.unwrap_or_default()
            ),
            _ => println!(
                "  ✗ {} by {}: {}",
                task_id,
                done.agent_id,
                done.error.unwrap_or_default()
            ),
        }
    }

    println!("\nAssignments per agent:");
    let mut counts: Vec<_> = router.assignment_counts().into_iter().collect();
    counts.sort();
    for (agent_id, count) in counts {
        println!("  {}: {}", agent_id, count);
    }

    router.shutdown().await;
    Ok(())
}
