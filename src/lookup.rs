//! # Iterative Closest-Node Lookup
//!
//! Drives every network-level operation. The engine keeps a candidate list
//! ordered by XOR distance to the target, repeatedly queries the closest `k`
//! unqueried candidates in parallel, and folds the contacts they return back
//! into the list until the closest `k` have all been queried. The list holds
//! `k * oversample` candidates so that a failed peer among the closest `k` is
//! replaced by the next nearest without another round of discovery.
//!
//! The engine is generic over the peer handle `P`. A [`PeerResolver`] turns a
//! contact into a handle (dialing, or signaling through the peer that reported
//! the contact), and the caller's operation callback does the actual RPC:
//!
//! - `Some(contacts)`: continue; merge these contacts
//! - `Some(vec![])`: the peer failed or knows nothing new
//! - `None`: stop the whole search now
//!
//! A single misbehaving or unreachable peer only costs its own query.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::identity::{closer_to, Contact, Identity};

/// Default candidate oversampling factor.
pub const DEFAULT_OVERSAMPLE: usize = 4;

/// Default bound on a single peer's resolution plus query.
pub const DEFAULT_PER_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default backstop on lookup rounds.
pub const DEFAULT_MAX_ROUNDS: usize = 20;

/// Produces a peer handle for a contact discovered during a lookup.
#[async_trait]
pub trait PeerResolver<P>: Send + Sync {
    /// `via` is the peer that reported `contact`, if any.
    async fn resolve(&self, contact: &Contact, via: Option<&P>) -> Option<P>;
}

#[derive(Clone, Debug)]
pub struct LookupConfig {
    pub oversample: usize,
    pub per_query_timeout: Duration,
    pub max_rounds: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            oversample: DEFAULT_OVERSAMPLE,
            per_query_timeout: DEFAULT_PER_QUERY_TIMEOUT,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("lookup fan-out must be at least 1")]
    InvalidFanout,
    #[error("routing table is empty")]
    EmptyRoutingTable,
}

#[derive(Clone, Debug)]
pub struct LookupOutcome {
    /// At most `k` responsive contacts, nearest first.
    pub closest: Vec<Contact>,
    pub rounds: usize,
    pub queried: usize,
    /// The operation callback asked to stop.
    pub stopped: bool,
}

struct Candidate<P> {
    contact: Contact,
    peer: Option<P>,
    via: Option<P>,
}

enum QueryResult<P> {
    Answered { peer: P, contacts: Vec<Contact> },
    Stop,
    Failed,
}

/// Run an iterative lookup for `target`.
///
/// `seeds` are the routing table's nearest entries, each with a ready handle
/// when one exists (the local node always has one).
pub async fn iterative_lookup<P, F, Fut>(
    target: Identity,
    k: usize,
    seeds: Vec<(Contact, Option<P>)>,
    resolver: Arc<dyn PeerResolver<P>>,
    op: F,
    config: &LookupConfig,
) -> Result<LookupOutcome, LookupError>
where
    P: Clone + Send + Sync + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Vec<Contact>>> + Send + 'static,
{
    if k < 1 {
        return Err(LookupError::InvalidFanout);
    }
    if seeds.is_empty() {
        return Err(LookupError::EmptyRoutingTable);
    }

    let width = k.saturating_mul(config.oversample.max(1));
    let op = Arc::new(op);

    let mut seen: HashSet<Identity> = HashSet::new();
    let mut candidates: Vec<Candidate<P>> = Vec::with_capacity(width);
    for (contact, peer) in seeds {
        if seen.insert(contact.identity) {
            candidates.push(Candidate { contact, peer, via: None });
        }
    }
    sort_and_truncate(&mut candidates, &target, width);

    let mut queried: HashSet<Identity> = HashSet::new();
    let mut rounds = 0;
    let mut stopped = false;

    loop {
        let chosen: Vec<usize> = candidates
            .iter()
            .enumerate()
            .take(k)
            .filter(|(_, c)| !queried.contains(&c.contact.identity))
            .map(|(idx, _)| idx)
            .collect();
        if chosen.is_empty() {
            break;
        }
        if rounds >= config.max_rounds {
            warn!(
                target = %target.short(),
                rounds,
                "iterative lookup exceeded max rounds"
            );
            break;
        }
        rounds += 1;

        let mut join_set = JoinSet::new();
        for idx in chosen {
            let candidate = &candidates[idx];
            let id = candidate.contact.identity;
            queried.insert(id);

            let contact = candidate.contact.clone();
            let peer = candidate.peer.clone();
            let via = candidate.via.clone();
            let resolver = resolver.clone();
            let op = op.clone();
            let per_query = config.per_query_timeout;

            join_set.spawn(async move {
                let query = async move {
                    let peer = match peer {
                        Some(peer) => peer,
                        None => match resolver.resolve(&contact, via.as_ref()).await {
                            Some(peer) => peer,
                            None => return QueryResult::Failed,
                        },
                    };
                    match op(peer.clone()).await {
                        Some(contacts) => QueryResult::Answered { peer, contacts },
                        None => QueryResult::Stop,
                    }
                };
                let result = timeout(per_query, query).await.unwrap_or(QueryResult::Failed);
                (id, result)
            });
        }

        let mut failed: HashSet<Identity> = HashSet::new();
        let mut discovered: Vec<(Contact, P)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((id, result)) = joined else {
                continue;
            };
            match result {
                QueryResult::Stop => {
                    stopped = true;
                    join_set.abort_all();
                    break;
                }
                QueryResult::Failed => {
                    trace!(peer = %id.short(), "lookup query yielded nothing");
                    failed.insert(id);
                }
                QueryResult::Answered { peer, contacts } => {
                    if let Some(candidate) = candidates.iter_mut().find(|c| c.contact.identity == id) {
                        candidate.peer = Some(peer.clone());
                    }
                    for contact in contacts {
                        discovered.push((contact, peer.clone()));
                    }
                }
            }
        }

        candidates.retain(|c| !failed.contains(&c.contact.identity));
        if stopped {
            break;
        }

        for (contact, via) in discovered {
            if !contact.identity.is_valid() || !contact.validate_structure() {
                continue;
            }
            if seen.insert(contact.identity) {
                candidates.push(Candidate {
                    contact,
                    peer: None,
                    via: Some(via),
                });
            }
        }
        sort_and_truncate(&mut candidates, &target, width);
    }

    let closest: Vec<Contact> = candidates.into_iter().take(k).map(|c| c.contact).collect();
    debug!(
        target = %target.short(),
        found = closest.len(),
        queried = queried.len(),
        rounds,
        stopped,
        "iterative lookup completed"
    );
    Ok(LookupOutcome {
        closest,
        rounds,
        queried: queried.len(),
        stopped,
    })
}

fn sort_and_truncate<P>(candidates: &mut Vec<Candidate<P>>, target: &Identity, width: usize) {
    candidates.sort_by(|a, b| closer_to(target, &a.contact.identity, &b.contact.identity));
    candidates.truncate(width);
}
