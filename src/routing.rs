//! # Routing Table
//!
//! 256 k-buckets indexed by the position of the first bit in which a
//! contact's identity differs from the local identity. Each bucket holds at
//! most `k` contacts ordered from least to most recently seen.
//!
//! The local node's own contact lives in bucket 255 (distance zero). It is
//! always resolvable, takes part in `closest()` like any other contact, and is
//! never evicted or removed.
//!
//! ## Admission
//!
//! ```text
//! admit(contact)
//!   ├─ already present ──▶ Refreshed (moved to tail)
//!   ├─ bucket has room ──▶ Inserted
//!   └─ bucket full ──────▶ Full(PendingAdmission)
//!                              │ caller pings every remote occupant
//!                              ▼
//!                      apply_ping_results()
//!                        replaces at most one dead occupant, oldest first
//! ```
//!
//! The table itself never does I/O; the node actor runs the pings and feeds
//! the results back.

use std::collections::BinaryHeap;

use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::{distance_cmp, Contact, Identity};

/// Default bucket capacity.
pub const DEFAULT_K: usize = 20;

/// Threshold after which a bucket is considered stale and worth refreshing.
pub const BUCKET_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

const BUCKET_COUNT: usize = 256;

/// Bucket holding the local node.
const LOCAL_BUCKET: usize = BUCKET_COUNT - 1;

#[derive(Debug, Clone)]
struct RoutingBucket {
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn position(&self, id: &Identity) -> Option<usize> {
        self.contacts.iter().position(|c| &c.identity == id)
    }

    /// Move an existing contact to the tail, taking the fresher address list.
    fn refresh_with(&mut self, pos: usize, contact: Contact) {
        let mut existing = self.contacts.remove(pos);
        if contact.has_direct_addrs() {
            existing.addrs = contact.addrs;
        }
        existing.touch();
        self.contacts.push(existing);
        self.mark_refreshed();
    }

    fn refresh(&mut self, id: &Identity) -> bool {
        match self.position(id) {
            Some(pos) => {
                let mut existing = self.contacts.remove(pos);
                existing.touch();
                self.contacts.push(existing);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &Identity) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.contacts.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Result of offering a contact to the table.
#[derive(Debug)]
pub enum Admission {
    Inserted,
    Refreshed,
    /// The bucket is full. Ping the occupants and call
    /// [`RoutingTable::apply_ping_results`].
    Full(PendingAdmission),
    /// The local node or an identity that is not a valid public key.
    Rejected,
}

#[derive(Clone, Debug)]
pub struct PendingAdmission {
    pub bucket_index: usize,
    pub candidate: Contact,
    /// Remote occupants at the time of admission, oldest first.
    pub occupants: Vec<Contact>,
}

/// Index of the first differing bit between two identities. 255 for equal ones.
pub fn bucket_index(self_id: &Identity, other: &Identity) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    LOCAL_BUCKET
}

/// A random identity that falls into `bucket_idx` relative to `self_id`.
pub fn random_id_for_bucket(self_id: &Identity, bucket_idx: usize) -> Identity {
    let self_bytes = self_id.as_bytes();
    let bucket_idx = bucket_idx.min(LOCAL_BUCKET);

    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; 32];
    for (i, byte) in target.iter_mut().enumerate() {
        *byte = self_bytes[i] ^ distance[i];
    }
    Identity::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    local: Identity,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(local: Contact, k: usize) -> Self {
        let k = k.max(1);
        let mut buckets: Vec<RoutingBucket> = (0..BUCKET_COUNT).map(|_| RoutingBucket::new()).collect();
        let local_id = local.identity;
        buckets[LOCAL_BUCKET].contacts.push(local);
        Self {
            local: local_id,
            k,
            buckets,
        }
    }

    pub fn local_identity(&self) -> Identity {
        self.local
    }

    /// Number of contacts, the local node included.
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn admit(&mut self, contact: Contact) -> Admission {
        if contact.identity == self.local {
            return Admission::Rejected;
        }
        // SECURITY: Identities that are not Ed25519 points cannot authenticate
        // and would only occupy bucket space.
        if !contact.identity.is_valid() || !contact.validate_structure() {
            return Admission::Rejected;
        }

        let idx = bucket_index(&self.local, &contact.identity);
        let k = self.k;
        let local = self.local;
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&contact.identity) {
            bucket.refresh_with(pos, contact);
            return Admission::Refreshed;
        }
        if bucket.contacts.len() < k {
            trace!(peer = %contact.identity.short(), bucket = idx, "contact inserted");
            bucket.contacts.push(contact);
            bucket.mark_refreshed();
            return Admission::Inserted;
        }

        let occupants: Vec<Contact> = bucket
            .contacts
            .iter()
            .filter(|c| c.identity != local)
            .cloned()
            .collect();
        Admission::Full(PendingAdmission {
            bucket_index: idx,
            candidate: contact,
            occupants,
        })
    }

    /// Apply liveness results for a full bucket.
    ///
    /// Live occupants are refreshed. The oldest dead occupant still present is
    /// replaced by the candidate. Returns the evicted identity, if any.
    pub fn apply_ping_results(
        &mut self,
        pending: PendingAdmission,
        results: &[(Identity, bool)],
    ) -> Option<Identity> {
        let k = self.k;
        let local = self.local;
        let bucket = &mut self.buckets[pending.bucket_index];

        let dead = pending.occupants.iter().find(|occupant| {
            occupant.identity != local
                && bucket.position(&occupant.identity).is_some()
                && results
                    .iter()
                    .any(|(id, alive)| *id == occupant.identity && !*alive)
        });

        for (id, alive) in results {
            if *alive {
                bucket.refresh(id);
            }
        }

        let Some(dead) = dead else {
            trace!(
                candidate = %pending.candidate.identity.short(),
                bucket = pending.bucket_index,
                "bucket full and all occupants alive; candidate dropped"
            );
            return None;
        };
        let evicted = dead.identity;
        bucket.remove(&evicted);

        if bucket.position(&pending.candidate.identity).is_none() && bucket.contacts.len() < k {
            bucket.contacts.push(pending.candidate);
            bucket.mark_refreshed();
        }
        debug!(peer = %evicted.short(), bucket = pending.bucket_index, "evicted unresponsive contact");
        Some(evicted)
    }

    /// Remove a remote contact. The local node cannot be removed.
    pub fn remove(&mut self, id: &Identity) -> bool {
        if *id == self.local {
            return false;
        }
        let idx = bucket_index(&self.local, id);
        self.buckets[idx].remove(id)
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.buckets[bucket_index(&self.local, id)].position(id).is_some()
    }

    /// Look up a contact by identity, the local node included.
    pub fn lookup(&self, id: &Identity) -> Option<Contact> {
        let idx = bucket_index(&self.local, id);
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| c.identity == *id)
            .cloned()
    }

    /// Up to `k` contacts closest to `target`, nearest first.
    pub fn closest(&self, target: &Identity, k: usize) -> Vec<Contact> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistContact {
            dist: [u8; 32],
            contact: Contact,
        }

        impl Ord for DistContact {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistContact {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistContact> = BinaryHeap::with_capacity(k + 1);

        for bucket in &self.buckets {
            for contact in &bucket.contacts {
                let dist = contact.identity.xor_distance(target);
                if heap.len() < k {
                    heap.push(DistContact { dist, contact: contact.clone() });
                } else if let Some(max_entry) = heap.peek()
                    && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
                {
                    heap.push(DistContact { dist, contact: contact.clone() });
                    heap.pop();
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|dc| dc.contact).collect()
    }

    /// Non-empty buckets not refreshed within `threshold`.
    pub fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(idx, bucket)| {
                *idx != LOCAL_BUCKET && !bucket.contacts.is_empty() && bucket.is_stale(threshold)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }

    #[cfg(test)]
    fn bucket_len(&self, idx: usize) -> usize {
        self.buckets[idx].contacts.len()
    }
}
