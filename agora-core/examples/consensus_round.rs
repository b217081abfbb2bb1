//! Consensus example
//!
//! Five agents vote on two proposals. Agents approve a plan only when it
//! stays within their budget, so one proposal passes and the other stays
//! open. Every agent records the decision in long-term memory, mirrored to
//! a JSON file.

use std::sync::Arc;
use std::time::Duration;

use agora_core::prelude::*;
use agora_core::telemetry;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing()?;

    println!("Consensus Round Example");
    println!("=======================\n");

    let config = AgoraConfig::load()?;
    let bus = MessageBus::with_config(&config.bus);
    let coordinator = ConsensusCoordinator::start(bus.clone(), config.consensus.clone()).await;
    let decisions_dir = std::env::temp_dir().join("agora-consensus-round");
    std::fs::create_dir_all(&decisions_dir)?;

    let budgets = [("alice", 100), ("bob", 80), ("carol", 120), ("dave", 50), ("erin", 90)];
    let mut agents = Vec::new();
    for (id, budget) in budgets {
        let agent = Agent::builder()
            .id(id)
            .handler(handler_fn(|task| Box::pin(async move { Ok(task.payload) })))
            .coordinator(coordinator.clone())
            .vote_policy(vote_fn(move |proposal| {
                proposal.solution["cost"].as_u64().unwrap_or(u64::MAX) <= budget
            }))
            .long_term_sink(Arc::new(JsonFileSink::new(
                decisions_dir.join(format!("{}.json", id)),
            )))
            .memory_config(config.memory.clone())
            .bus(bus.clone())
            .spawn()
            .await?;
        agents.push(agent);
    }
    println!("✓ {} agents registered\n", bus.agent_count().await);

    let mut tap = bus.subscribe();
    // alice runs her round over the bus, carol goes through the coordinator
    agents[0]
        .propose("offsite", json!({ "venue": "lake house", "cost": 75 }))
        .await?;
    coordinator
        .propose("carol", "hardware", json!({ "item": "GPU cluster", "cost": 110 }))
        .await?;

    // proposers do not receive their own broadcast
    agents[0].cast_vote("offsite", true).await?;
    coordinator.vote("carol", "hardware", true).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while let Ok(Ok(message)) = tokio::time::timeout_at(deadline, tap.recv()).await {
        if message.kind() == MessageKind::Vote {
            println!(
                "  vote from {}: {}",
                message.sender(),
                message.payload()["approve"]
            );
        }
        if message.kind() == MessageKind::ConsensusReached {
            println!(
                "  ✓ consensus on {}",
                message.payload()["problem_id"].as_str().unwrap_or_default()
            );
        }
    }

    println!();
    for problem_id in ["offsite", "hardware"] {
        match coordinator.tally(problem_id).await {
            Some(tally) => println!(
                "{}: {} of {} voters approve, {} agents, resolved: {}",
                problem_id,
                tally.approvals,
                tally.voters(),
                tally.registered_agents,
                coordinator.is_resolved(problem_id)
            ),
            None => println!("{}: unknown", problem_id),
        }
    }

    println!("\nLong-term memory:");
    for agent in &agents {
        let recorded = agent.long_term().contains_key("consensus_offsite");
        println!("  {} remembers offsite decision: {}", agent.id(), recorded);
    }
    println!("\nDecisions mirrored under {}", decisions_dir.display());
    Ok(())
}
