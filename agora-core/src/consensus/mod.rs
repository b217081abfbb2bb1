//! Quorum consensus over the message bus
//!
//! Any agent may propose a solution for a problem id; peers vote on it.
//! After every vote the coordinator checks:
//!
//! 1. quorum: distinct voters `>=` quorum ratio (2/3) of registered agents
//! 2. approval: approving voters `>` approval ratio (1/2) of voters
//!
//! When both hold it broadcasts CONSENSUS_REACHED exactly once and closes
//! the problem. A problem that has quorum but not a majority stays open;
//! there is no timeout here, callers poll [`ConsensusCoordinator::tally`].
//!
//! Only registered agents vote. Under [`QuorumBasis::Live`] a voter that has
//! since left the bus no longer counts; under [`QuorumBasis::Snapshot`] the
//! electorate is the set of agents registered when the problem was proposed.
//!
//! A coordinator built with [`ConsensusCoordinator::start`] also follows the
//! bus, so agents can run a round with plain PROPOSAL and VOTE broadcasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::bus::{Message, MessageBus, MessageKind};
use crate::config::{ConsensusConfig, QuorumBasis};
use crate::error::{AgoraError, Result};

/// Candidate solution for a problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub problem_id: String,
    pub solution: serde_json::Value,
    pub proposer: String,
    pub created_at: DateTime<Utc>,
}

/// One voter's decision on a problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub problem_id: String,
    pub voter: String,
    pub approve: bool,
    pub cast_at: DateTime<Utc>,
}

/// Votes recorded for a problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    /// voter -> decision, latest vote per voter
    pub votes: BTreeMap<String, bool>,
    pub approvals: usize,
    pub rejections: usize,

    /// Agent count the quorum was measured against
    pub registered_agents: usize,
    pub quorum_met: bool,
}

impl Tally {
    pub fn voters(&self) -> usize {
        self.votes.len()
    }

    /// Approving share of the voters, 0.0 without votes
    pub fn approval_fraction(&self) -> f64 {
        if self.votes.is_empty() {
            0.0
        } else {
            self.approvals as f64 / self.votes.len() as f64
        }
    }
}

/// Payload of CONSENSUS_REACHED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub problem_id: String,
    pub proposal: Proposal,
    pub tally: Tally,
    pub reached_at: DateTime<Utc>,
}

/// Result of [`ConsensusCoordinator::propose`]
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalOutcome {
    /// Recorded; [`ConsensusCoordinator::propose`] also broadcast it
    Opened(Proposal),
    /// The problem already has an open proposal; nothing was broadcast
    AlreadyOpen,
    /// The problem is resolved; nothing was broadcast
    AlreadyResolved,
}

/// Result of [`ConsensusCoordinator::vote`]
#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    /// Recorded; consensus not (yet) reached
    Recorded(Tally),
    /// This vote completed the consensus
    ConsensusReached(ConsensusDecision),
    /// The problem was already resolved; the vote was ignored
    Closed,
}

#[derive(Debug)]
struct ProblemState {
    proposal: Proposal,
    votes: HashMap<String, Vote>,
    /// Agents registered at proposal time, the electorate under `QuorumBasis::Snapshot`
    snapshot_agents: HashSet<String>,
    decision: Option<ConsensusDecision>,
}

impl ProblemState {
    fn electorate<'a>(
        &'a self,
        live_agents: &'a HashSet<String>,
        basis: QuorumBasis,
    ) -> &'a HashSet<String> {
        match basis {
            QuorumBasis::Live => live_agents,
            QuorumBasis::Snapshot => &self.snapshot_agents,
        }
    }

    /// Count the votes cast by members of `electorate`
    fn tally(&self, electorate: &HashSet<String>, config: &ConsensusConfig) -> Tally {
        let votes: BTreeMap<String, bool> = self
            .votes
            .values()
            .filter(|vote| electorate.contains(&vote.voter))
            .map(|vote| (vote.voter.clone(), vote.approve))
            .collect();
        let approvals = votes.values().filter(|approve| **approve).count();
        Tally {
            rejections: votes.len() - approvals,
            approvals,
            quorum_met: config.quorum.is_met_by(votes.len(), electorate.len()),
            registered_agents: electorate.len(),
            votes,
        }
    }
}

/// Runs the proposal/vote protocol for any number of problem ids
pub struct ConsensusCoordinator {
    bus: MessageBus,
    config: ConsensusConfig,
    problems: Mutex<HashMap<String, ProblemState>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConsensusCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusCoordinator")
            .field("config", &self.config)
            .finish()
    }
}

impl ConsensusCoordinator {
    /// Coordinator driven only through [`propose`](Self::propose) and [`vote`](Self::vote)
    pub fn new(bus: MessageBus) -> Self {
        Self::with_config(bus, ConsensusConfig::default())
    }

    pub fn with_config(bus: MessageBus, config: ConsensusConfig) -> Self {
        Self {
            bus,
            config,
            problems: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Coordinator that also tallies PROPOSAL and VOTE broadcasts sent over `bus`.
    ///
    /// The listener stops when the coordinator is dropped or shut down.
    pub async fn start(bus: MessageBus, config: ConsensusConfig) -> Arc<Self> {
        let tap = bus.subscribe();
        let coordinator = Arc::new(Self::with_config(bus, config));

        let span = tracing::info_span!(
            "consensus",
            coordinator_id = %coordinator.config.coordinator_id
        );
        let handle = tokio::spawn(listen(Arc::downgrade(&coordinator), tap).instrument(span));
        *coordinator.listener() = Some(handle);

        tracing::info!(
            coordinator_id = %coordinator.config.coordinator_id,
            "Consensus coordinator started"
        );
        coordinator
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Record `proposer`'s solution for `problem_id` and broadcast a PROPOSAL
    pub async fn propose(
        &self,
        proposer: &str,
        problem_id: &str,
        solution: serde_json::Value,
    ) -> Result<ProposalOutcome> {
        let proposal = Proposal {
            problem_id: problem_id.to_string(),
            solution,
            proposer: proposer.to_string(),
            created_at: Utc::now(),
        };

        let outcome = self.observe_proposal(proposal).await;
        match &outcome {
            ProposalOutcome::Opened(proposal) => {
                let message =
                    Message::new(MessageKind::Proposal, proposer, serde_json::to_value(proposal)?);
                let delivered = self.bus.broadcast(message).await?;
                tracing::info!(problem_id, proposer, delivered, "Proposal opened");
            }
            ProposalOutcome::AlreadyResolved => {
                tracing::info!(problem_id, proposer, "Ignoring proposal for resolved problem");
            }
            ProposalOutcome::AlreadyOpen => {}
        }
        Ok(outcome)
    }

    /// Record a proposal that was already announced on the bus.
    ///
    /// Nothing is broadcast. The first proposal for a problem id wins.
    pub async fn observe_proposal(&self, proposal: Proposal) -> ProposalOutcome {
        let snapshot_agents = self.live_agents().await;

        let mut problems = self.problems();
        match problems.get(&proposal.problem_id) {
            Some(existing) if existing.decision.is_some() => ProposalOutcome::AlreadyResolved,
            Some(_) => ProposalOutcome::AlreadyOpen,
            None => {
                tracing::debug!(
                    problem_id = %proposal.problem_id,
                    proposer = %proposal.proposer,
                    "Recording proposal"
                );
                problems.insert(
                    proposal.problem_id.clone(),
                    ProblemState {
                        proposal: proposal.clone(),
                        votes: HashMap::new(),
                        snapshot_agents,
                        decision: None,
                    },
                );
                ProposalOutcome::Opened(proposal)
            }
        }
    }

    /// Record `voter`'s decision, broadcast the VOTE and check for consensus.
    ///
    /// A voter's later vote replaces its earlier one.
    ///
    /// # Errors
    ///
    /// `UnknownProblem` when nobody proposed `problem_id`, `IneligibleVoter`
    /// when `voter` is not in the problem's electorate.
    pub async fn vote(&self, voter: &str, problem_id: &str, approve: bool) -> Result<VoteOutcome> {
        let vote = Vote {
            problem_id: problem_id.to_string(),
            voter: voter.to_string(),
            approve,
            cast_at: Utc::now(),
        };

        let outcome = self.record_vote(&vote).await?;
        if outcome == VoteOutcome::Closed {
            return Ok(outcome);
        }

        self.bus
            .broadcast(Message::new(MessageKind::Vote, voter, serde_json::to_value(&vote)?))
            .await?;
        self.announce(&outcome).await?;
        Ok(outcome)
    }

    /// Record a vote that was already announced on the bus.
    ///
    /// Broadcasts CONSENSUS_REACHED if the vote completes the consensus. A
    /// vote older than the one already held for its voter is ignored.
    pub async fn observe_vote(&self, vote: Vote) -> Result<VoteOutcome> {
        let outcome = self.record_vote(&vote).await?;
        self.announce(&outcome).await?;
        Ok(outcome)
    }

    async fn record_vote(&self, vote: &Vote) -> Result<VoteOutcome> {
        let live_agents = self.live_agents().await;
        let basis = self.config.quorum_basis;

        let mut problems = self.problems();
        let Some(state) = problems.get_mut(&vote.problem_id) else {
            return Err(AgoraError::UnknownProblem(vote.problem_id.clone()));
        };
        if state.decision.is_some() {
            tracing::debug!(
                problem_id = %vote.problem_id,
                voter = %vote.voter,
                "Ignoring vote for resolved problem"
            );
            return Ok(VoteOutcome::Closed);
        }
        if !state.electorate(&live_agents, basis).contains(&vote.voter) {
            return Err(AgoraError::IneligibleVoter(vote.voter.clone()));
        }

        match state.votes.get(&vote.voter) {
            Some(held) if held.cast_at > vote.cast_at => {
                tracing::debug!(problem_id = %vote.problem_id, voter = %vote.voter, "Ignoring stale vote");
            }
            _ => {
                state.votes.insert(vote.voter.clone(), vote.clone());
            }
        }

        let tally = state.tally(state.electorate(&live_agents, basis), &self.config);
        if tally.quorum_met
            && self
                .config
                .approval
                .is_exceeded_by(tally.approvals, tally.voters())
        {
            let decision = ConsensusDecision {
                problem_id: vote.problem_id.clone(),
                proposal: state.proposal.clone(),
                tally,
                reached_at: Utc::now(),
            };
            state.decision = Some(decision.clone());
            Ok(VoteOutcome::ConsensusReached(decision))
        } else {
            Ok(VoteOutcome::Recorded(tally))
        }
    }

    async fn announce(&self, outcome: &VoteOutcome) -> Result<()> {
        let VoteOutcome::ConsensusReached(decision) = outcome else {
            return Ok(());
        };
        tracing::info!(
            problem_id = %decision.problem_id,
            approvals = decision.tally.approvals,
            voters = decision.tally.voters(),
            registered = decision.tally.registered_agents,
            "Consensus reached"
        );
        self.bus
            .broadcast(Message::new(
                MessageKind::ConsensusReached,
                self.config.coordinator_id.clone(),
                serde_json::to_value(decision)?,
            ))
            .await?;
        Ok(())
    }

    /// Current tally, measured against the electorate the quorum would use now
    pub async fn tally(&self, problem_id: &str) -> Option<Tally> {
        let live_agents = self.live_agents().await;
        let problems = self.problems();
        let state = problems.get(problem_id)?;
        if let Some(decision) = &state.decision {
            return Some(decision.tally.clone());
        }
        Some(state.tally(
            state.electorate(&live_agents, self.config.quorum_basis),
            &self.config,
        ))
    }

    pub fn proposal(&self, problem_id: &str) -> Option<Proposal> {
        self.problems()
            .get(problem_id)
            .map(|state| state.proposal.clone())
    }

    pub fn is_resolved(&self, problem_id: &str) -> bool {
        self.problems()
            .get(problem_id)
            .is_some_and(|state| state.decision.is_some())
    }

    pub fn decision(&self, problem_id: &str) -> Option<ConsensusDecision> {
        self.problems()
            .get(problem_id)
            .and_then(|state| state.decision.clone())
    }

    /// Problem ids still waiting for consensus
    pub fn open_problems(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .problems()
            .iter()
            .filter(|(_, state)| state.decision.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        open.sort();
        open
    }

    /// Stop following the bus; `propose` and `vote` keep working
    pub fn shutdown(&self) {
        if let Some(handle) = self.listener().take() {
            handle.abort();
            tracing::info!(
                coordinator_id = %self.config.coordinator_id,
                "Consensus coordinator stopped"
            );
        }
    }

    async fn observe(&self, message: Message) {
        match message.kind() {
            MessageKind::Proposal => {
                match serde_json::from_value::<Proposal>(message.into_payload()) {
                    Ok(proposal) => {
                        let problem_id = proposal.problem_id.clone();
                        let outcome = self.observe_proposal(proposal).await;
                        tracing::trace!(%problem_id, ?outcome, "Observed proposal");
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed proposal"),
                }
            }
            MessageKind::Vote => {
                let sender = message.sender().to_string();
                match serde_json::from_value::<Vote>(message.into_payload()) {
                    Ok(vote) if vote.voter != sender => {
                        tracing::warn!(from = %sender, voter = %vote.voter, "Ignoring vote cast for another agent");
                    }
                    Ok(vote) => {
                        let problem_id = vote.problem_id.clone();
                        if let Err(e) = self.observe_vote(vote).await {
                            tracing::warn!(%problem_id, from = %sender, error = %e, "Vote rejected");
                        }
                    }
                    Err(e) => tracing::warn!(from = %sender, error = %e, "Ignoring malformed vote"),
                }
            }
            _ => {}
        }
    }

    async fn live_agents(&self) -> HashSet<String> {
        self.bus.agent_ids().await.into_iter().collect()
    }

    fn problems(&self) -> MutexGuard<'_, HashMap<String, ProblemState>> {
        self.problems
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ConsensusCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.listener().take() {
            handle.abort();
        }
    }
}

async fn listen(coordinator: Weak<ConsensusCoordinator>, mut tap: broadcast::Receiver<Message>) {
    loop {
        let message = match tap.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Consensus listener fell behind the bus");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        coordinator.observe(message).await;
    }
    tracing::debug!("Consensus listener stopped");
}
