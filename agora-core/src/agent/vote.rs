//! How an agent decides on proposals it receives

use async_trait::async_trait;
use std::sync::Arc;

use super::Agent;
use crate::consensus::Proposal;

/// Decides an agent's vote on a broadcast PROPOSAL
#[async_trait]
pub trait VotePolicy: Send + Sync {
    async fn decide(&self, proposal: &Proposal, agent: &Agent) -> bool;
}

/// Approves every proposal
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

#[async_trait]
impl VotePolicy for ApproveAll {
    async fn decide(&self, _proposal: &Proposal, _agent: &Agent) -> bool {
        true
    }
}

/// Rejects every proposal
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

#[async_trait]
impl VotePolicy for RejectAll {
    async fn decide(&self, _proposal: &Proposal, _agent: &Agent) -> bool {
        false
    }
}

/// Policy backed by a synchronous predicate over the proposal
pub struct FnVotePolicy<F> {
    f: F,
}

#[async_trait]
impl<F> VotePolicy for FnVotePolicy<F>
where
    F: Fn(&Proposal) -> bool + Send + Sync,
{
    async fn decide(&self, proposal: &Proposal, _agent: &Agent) -> bool {
        (self.f)(proposal)
    }
}

/// Wrap a predicate as a shared vote policy
pub fn vote_fn<F>(f: F) -> Arc<dyn VotePolicy>
where
    F: Fn(&Proposal) -> bool + Send + Sync + 'static,
{
    Arc::new(FnVotePolicy { f })
}
