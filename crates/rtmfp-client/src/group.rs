//! NetGroup media distribution
//!
//! Media published into a group is cut into numbered fragments. Members
//! advertise the fragments they hold, pull the ones they miss from a
//! neighbor that has them, and push new fragments to neighbors up to a
//! per-neighbor limit. Readers get fragments in order; a gap that cannot be
//! filled is skipped.
//!
//! Messages on a group media flow:
//!
//! ```text
//! 0x20 fragment      [vlu id][media message]
//! 0x22 availability  [vlu first id][vlu count][bitmap, bit 0 of byte 0 = first]
//! 0x2B pull          [vlu id]
//! ```
//!
//! Membership goes through the server on a group control flow: a join
//! `[0x01][sha256(group specifier)]` is answered with
//! `[0x0B][peer id]*` listing members to connect to.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rtmfp_core::{vlu, PeerId, PEER_ID_SIZE};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::config::GroupConfig;

pub const FRAGMENT: u8 = 0x20;
pub const AVAILABILITY: u8 = 0x22;
pub const PULL: u8 = 0x2B;

pub const JOIN: u8 = 0x01;
pub const PEER_LIST: u8 = 0x0B;

/// Members the group connects to directly
pub const MAX_NEIGHBORS: usize = 8;

/// Fragment IDs further than this ahead of the newest known one are dropped
pub const MAX_FRAGMENT_SPAN: u64 = 4096;

/// Bits of one availability bitmap, small enough for a single packet
const MAX_AVAILABILITY_BITS: u64 = 8 * 1024;

/// Session ID of the neighbor a message came from or goes to
pub type NeighborId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    Send { neighbor: NeighborId, message: Bytes },
    /// Next media message for the local reader
    Deliver(Bytes),
}

#[derive(Debug)]
struct Fragment {
    data: Bytes,
    received: Instant,
}

#[derive(Debug, Default)]
struct Neighbor {
    available: BTreeSet<u64>,
    /// Pushes not yet confirmed by an availability message
    pushes: u8,
    pulled: HashMap<u64, Instant>,
}

/// Fragment window and neighbor bookkeeping of one group member
#[derive(Debug)]
pub struct GroupMedia {
    config: GroupConfig,
    fragments: BTreeMap<u64, Fragment>,
    next_id: u64,
    delivered: Option<u64>,
    neighbors: HashMap<NeighborId, Neighbor>,
    missing: HashMap<u64, Instant>,
    last_availability: Option<Instant>,
    changed: bool,
    last_media: Option<Instant>,
}

/// Join request for a group specifier
pub fn encode_join(net_group: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + PEER_ID_SIZE);
    buf.put_u8(JOIN);
    buf.put_slice(&Sha256::digest(net_group.as_bytes()));
    buf.freeze()
}

/// Peer IDs of a server's answer to a join
pub fn decode_peer_list(message: &[u8]) -> Option<Vec<PeerId>> {
    let (&kind, rest) = message.split_first()?;
    if kind != PEER_LIST {
        return None;
    }
    Some(
        rest.chunks_exact(PEER_ID_SIZE)
            .filter_map(|id| id.try_into().ok())
            .collect(),
    )
}

fn encode_fragment(id: u64, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + vlu::encoded_len(id) + data.len());
    buf.put_u8(FRAGMENT);
    vlu::write(&mut buf, id);
    buf.put_slice(data);
    buf.freeze()
}

fn encode_pull(id: u64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(PULL);
    vlu::write(&mut buf, id);
    buf.freeze()
}

/// Advertise `ids`; only the newest ones when they span more than one bitmap
fn encode_availability(ids: &BTreeSet<u64>) -> Option<Bytes> {
    let last = *ids.last()?;
    let first = (*ids.first()?).max(last.saturating_sub(MAX_AVAILABILITY_BITS - 1));
    let count = last - first + 1;
    let mut bitmap = vec![0u8; count.div_ceil(8) as usize];
    for id in ids.range(first..) {
        let bit = id - first;
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }
    let mut buf = BytesMut::new();
    buf.put_u8(AVAILABILITY);
    vlu::write(&mut buf, first);
    vlu::write(&mut buf, count);
    buf.put_slice(&bitmap);
    Some(buf.freeze())
}

fn decode_availability(mut body: Bytes) -> rtmfp_core::Result<Vec<u64>> {
    let first = vlu::read(&mut body)?;
    let count = vlu::read(&mut body)?;
    let mut ids = Vec::new();
    for bit in 0..count.min(body.len() as u64 * 8) {
        if body[(bit / 8) as usize] & (1 << (bit % 8)) != 0 {
            match first.checked_add(bit) {
                Some(id) => ids.push(id),
                None => break,
            }
        }
    }
    Ok(ids)
}

impl GroupMedia {
    pub fn new(config: GroupConfig) -> Self {
        Self {
            config,
            fragments: BTreeMap::new(),
            next_id: 1,
            delivered: None,
            neighbors: HashMap::new(),
            missing: HashMap::new(),
            last_availability: None,
            changed: false,
            last_media: None,
        }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// When the last fragment was published or received
    pub fn last_media(&self) -> Option<Instant> {
        self.last_media
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_duration as u64 + self.config.relay_margin as u64)
    }

    fn fetch_period(&self) -> Duration {
        Duration::from_millis(self.config.fetch_period as u64)
    }

    /// Whether `id` is close enough to what we know to be tracked
    fn in_window(&self, id: u64) -> bool {
        let newest = self.fragments.keys().next_back().copied().max(self.delivered);
        newest.map_or(true, |newest| id <= newest.saturating_add(MAX_FRAGMENT_SPAN))
    }

    fn availability(&self) -> Option<Bytes> {
        let ids: BTreeSet<u64> = self.fragments.keys().copied().collect();
        encode_availability(&ids)
    }

    /// Start exchanging with a neighbor; it learns what we hold right away
    pub fn add_neighbor(&mut self, neighbor: NeighborId) -> Vec<GroupAction> {
        self.neighbors.entry(neighbor).or_default();
        self.availability()
            .map(|message| vec![GroupAction::Send { neighbor, message }])
            .unwrap_or_default()
    }

    pub fn remove_neighbor(&mut self, neighbor: NeighborId) {
        self.neighbors.remove(&neighbor);
    }

    /// Publish one media message into the group
    pub fn publish(&mut self, data: Bytes, now: Instant) -> Vec<GroupAction> {
        let id = self.next_id;
        self.next_id += 1;
        self.store(id, data, now);
        self.push(id, None)
    }

    fn store(&mut self, id: u64, data: Bytes, now: Instant) {
        self.fragments.insert(id, Fragment { data, received: now });
        self.missing.remove(&id);
        self.changed = true;
        self.last_media = Some(now);
    }

    /// Push fragment `id` to neighbors that lack it, within their limit
    fn push(&mut self, id: u64, except: Option<NeighborId>) -> Vec<GroupAction> {
        let Some(fragment) = self.fragments.get(&id) else {
            return Vec::new();
        };
        let message = encode_fragment(id, &fragment.data);
        let limit = self.config.push_limit;
        let unlimited = self.config.disable_rate_control;
        let mut out = Vec::new();
        for (&neighbor, state) in self.neighbors.iter_mut() {
            if Some(neighbor) == except || state.available.contains(&id) {
                continue;
            }
            if !unlimited && state.pushes >= limit {
                continue;
            }
            state.pushes = state.pushes.saturating_add(1);
            state.available.insert(id);
            out.push(GroupAction::Send {
                neighbor,
                message: message.clone(),
            });
        }
        out
    }

    /// Handle a message from a neighbor
    pub fn on_message(&mut self, from: NeighborId, mut data: Bytes, now: Instant) -> Vec<GroupAction> {
        self.neighbors.entry(from).or_default();
        if data.is_empty() {
            return Vec::new();
        }
        let kind = data.get_u8();
        let mut out = Vec::new();
        match kind {
            FRAGMENT => {
                let Ok(id) = vlu::read(&mut data) else {
                    return out;
                };
                if !self.in_window(id) {
                    trace!("Dropping group fragment {} from {} out of window", id, from);
                    return out;
                }
                if let Some(state) = self.neighbors.get_mut(&from) {
                    state.available.insert(id);
                    state.pulled.remove(&id);
                }
                let stale = self.delivered.is_some_and(|delivered| id <= delivered);
                if !stale && !self.fragments.contains_key(&id) {
                    self.store(id, data, now);
                    out.extend(self.push(id, Some(from)));
                }
            }
            AVAILABILITY => {
                let Ok(ids) = decode_availability(data) else {
                    return out;
                };
                let oldest = self.delivered;
                let ids: Vec<u64> = ids.into_iter().filter(|id| self.in_window(*id)).collect();
                if let Some(state) = self.neighbors.get_mut(&from) {
                    state.pushes = 0;
                    for id in &ids {
                        state.available.insert(*id);
                    }
                }
                for id in ids {
                    let wanted = oldest.map_or(true, |delivered| id > delivered);
                    if wanted && !self.fragments.contains_key(&id) {
                        self.missing.entry(id).or_insert(now);
                    }
                }
            }
            PULL => {
                let Ok(id) = vlu::read(&mut data) else {
                    return out;
                };
                if let Some(fragment) = self.fragments.get(&id) {
                    out.push(GroupAction::Send {
                        neighbor: from,
                        message: encode_fragment(id, &fragment.data),
                    });
                }
            }
            other => trace!("Ignoring group message 0x{:02x} from {}", other, from),
        }
        out.extend(self.deliver(now));
        out
    }

    /// Periodic work: eviction, availability, pulls and gap skipping
    pub fn tick(&mut self, now: Instant) -> Vec<GroupAction> {
        let window = self.window();
        self.fragments
            .retain(|_, fragment| now.duration_since(fragment.received) < window);
        self.missing
            .retain(|_, since| now.duration_since(*since) < window);
        if let Some(&oldest) = self.fragments.keys().next() {
            for state in self.neighbors.values_mut() {
                state.available = state.available.split_off(&oldest);
            }
        }

        let mut out = Vec::new();
        let period = Duration::from_millis(self.config.availability_update_period as u64);
        let due = self
            .last_availability
            .map_or(true, |sent| now.duration_since(sent) >= period);
        if due && (self.changed || self.config.availability_send_to_all) {
            if let Some(message) = self.availability() {
                for &neighbor in self.neighbors.keys() {
                    out.push(GroupAction::Send {
                        neighbor,
                        message: message.clone(),
                    });
                }
            }
            self.changed = false;
            self.last_availability = Some(now);
        }

        let fetch = self.fetch_period();
        let immediate = self.config.disable_pull_timeout;
        let mut ids: Vec<u64> = self.missing.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let since = self.missing[&id];
            if !immediate && now.duration_since(since) < fetch {
                continue;
            }
            let source = self.neighbors.iter_mut().find(|(_, state)| {
                state.available.contains(&id)
                    && state
                        .pulled
                        .get(&id)
                        .map_or(true, |at| now.duration_since(*at) >= fetch)
            });
            if let Some((&neighbor, state)) = source {
                state.pulled.insert(id, now);
                out.push(GroupAction::Send {
                    neighbor,
                    message: encode_pull(id),
                });
            }
        }

        out.extend(self.deliver(now));
        out
    }

    /// In-order delivery to the local reader
    fn deliver(&mut self, now: Instant) -> Vec<GroupAction> {
        if self.config.is_publisher {
            return Vec::new();
        }
        let skip_after = (self.fetch_period() * 2).min(self.window());
        let mut out = Vec::new();
        loop {
            let next = match self.delivered {
                Some(delivered) => match delivered.checked_add(1) {
                    Some(next) => next,
                    None => break,
                },
                None => match self.fragments.keys().next() {
                    Some(&id) => id,
                    None => break,
                },
            };
            if let Some(fragment) = self.fragments.get(&next) {
                out.push(GroupAction::Deliver(fragment.data.clone()));
                self.delivered = Some(next);
                self.missing.remove(&next);
                continue;
            }
            match self.fragments.range(next..).next() {
                Some((&id, fragment)) if now.duration_since(fragment.received) >= skip_after => {
                    trace!("Skipping group fragments {}..{}", next, id);
                    self.missing.retain(|&missing, _| missing >= id);
                    self.delivered = Some(id - 1);
                }
                _ => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(publisher: bool) -> GroupConfig {
        GroupConfig {
            net_group: "G:test".to_string(),
            is_publisher: publisher,
            ..Default::default()
        }
    }

    fn sent_to(actions: &[GroupAction], target: NeighborId) -> Vec<Bytes> {
        actions
            .iter()
            .filter_map(|action| match action {
                GroupAction::Send { neighbor, message } if *neighbor == target => {
                    Some(message.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn delivered(actions: &[GroupAction]) -> Vec<Bytes> {
        actions
            .iter()
            .filter_map(|action| match action {
                GroupAction::Deliver(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_join_and_peer_list() {
        let join = encode_join("G:0101");
        assert_eq!(join.len(), 1 + PEER_ID_SIZE);
        assert_eq!(join[0], JOIN);
        assert_eq!(encode_join("G:0101"), join);

        let mut answer = vec![PEER_LIST];
        answer.extend_from_slice(&[1u8; 32]);
        answer.extend_from_slice(&[2u8; 32]);
        assert_eq!(decode_peer_list(&answer), Some(vec![[1u8; 32], [2u8; 32]]));
        assert_eq!(decode_peer_list(&join), None);
    }

    #[test]
    fn test_availability_bitmap() {
        let ids: BTreeSet<u64> = [3, 4, 9, 12].into_iter().collect();
        let message = encode_availability(&ids).unwrap();
        assert_eq!(message[0], AVAILABILITY);
        let decoded = decode_availability(message.slice(1..)).unwrap();
        assert_eq!(decoded, vec![3, 4, 9, 12]);
        assert!(encode_availability(&BTreeSet::new()).is_none());
    }

    #[test]
    fn test_publisher_pushes_within_limit() {
        let now = Instant::now();
        let mut publisher = GroupMedia::new(config(true));
        publisher.add_neighbor(1);
        let mut pushed = 0;
        for i in 0..10u8 {
            let actions = publisher.publish(Bytes::from(vec![i]), now);
            pushed += sent_to(&actions, 1).len();
            assert!(delivered(&actions).is_empty());
        }
        assert_eq!(pushed, publisher.config().push_limit as usize);
    }

    #[test]
    fn test_push_reaches_reader_in_order() {
        let now = Instant::now();
        let mut publisher = GroupMedia::new(config(true));
        let mut reader = GroupMedia::new(config(false));
        publisher.add_neighbor(2);
        reader.add_neighbor(1);

        let first = sent_to(&publisher.publish(Bytes::from_static(b"a"), now), 2);
        let second = sent_to(&publisher.publish(Bytes::from_static(b"b"), now), 2);

        assert!(delivered(&reader.on_message(1, second[0].clone(), now)).is_empty());
        let out = reader.on_message(1, first[0].clone(), now);
        assert_eq!(
            delivered(&out),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn test_missing_fragment_is_pulled() {
        let now = Instant::now();
        let mut publisher = GroupMedia::new(GroupConfig {
            push_limit: 1,
            ..config(true)
        });
        let mut reader = GroupMedia::new(config(false));
        publisher.add_neighbor(2);
        reader.add_neighbor(1);

        let pushed = sent_to(&publisher.publish(Bytes::from_static(b"a"), now), 2);
        // over the push limit: only advertised
        assert!(sent_to(&publisher.publish(Bytes::from_static(b"b"), now), 2).is_empty());
        reader.on_message(1, pushed[0].clone(), now);

        let availability = sent_to(&publisher.tick(now), 2);
        assert_eq!(availability.len(), 1);
        reader.on_message(1, availability[0].clone(), now);

        // not before the fetch period
        assert!(sent_to(&reader.tick(now), 1).iter().all(|m| m[0] != PULL));
        let later = now + Duration::from_millis(2500);
        let pulls: Vec<Bytes> = sent_to(&reader.tick(later), 1)
            .into_iter()
            .filter(|m| m[0] == PULL)
            .collect();
        assert_eq!(pulls.len(), 1);

        let answer = sent_to(&publisher.on_message(2, pulls[0].clone(), later), 2);
        let out = reader.on_message(1, answer[0].clone(), later);
        assert_eq!(delivered(&out), vec![Bytes::from_static(b"b")]);
    }

    #[test]
    fn test_fragments_expire() {
        let now = Instant::now();
        let mut publisher = GroupMedia::new(config(true));
        publisher.publish(Bytes::from_static(b"old"), now);
        let later = now + Duration::from_millis(8000 + 2000);
        publisher.tick(later);
        publisher.add_neighbor(9);
        assert!(publisher.add_neighbor(9).is_empty());
    }

    #[test]
    fn test_gap_is_skipped() {
        let now = Instant::now();
        let mut publisher = GroupMedia::new(config(true));
        let mut reader = GroupMedia::new(config(false));
        publisher.add_neighbor(2);
        reader.add_neighbor(1);

        let first = sent_to(&publisher.publish(Bytes::from_static(b"a"), now), 2);
        let _lost = publisher.publish(Bytes::from_static(b"b"), now);
        let third = sent_to(&publisher.publish(Bytes::from_static(b"c"), now), 2);

        reader.on_message(1, first[0].clone(), now);
        assert!(delivered(&reader.on_message(1, third[0].clone(), now)).is_empty());
        let out = reader.tick(now + Duration::from_millis(5000));
        assert_eq!(delivered(&out), vec![Bytes::from_static(b"c")]);
    }

    #[test]
    fn test_far_fragment_is_dropped() {
        let now = Instant::now();
        let mut reader = GroupMedia::new(config(false));
        reader.add_neighbor(7);

        let out = reader.on_message(7, encode_fragment(0, b"a"), now);
        assert_eq!(delivered(&out), vec![Bytes::from_static(b"a")]);
        assert!(reader.on_message(7, encode_fragment(u64::MAX, b"z"), now).is_empty());
        assert!(reader
            .on_message(7, encode_fragment(MAX_FRAGMENT_SPAN + 1, b"z"), now)
            .is_empty());

        let availability = sent_to(&reader.tick(now), 7);
        assert_eq!(availability.len(), 1);
        assert_eq!(decode_availability(availability[0].slice(1..)).unwrap(), vec![0]);
    }

    #[test]
    fn test_availability_near_id_limit() {
        let mut message = BytesMut::new();
        vlu::write(&mut message, u64::MAX - 1);
        vlu::write(&mut message, 8);
        message.put_u8(0xFF);
        let ids = decode_availability(message.freeze()).unwrap();
        assert_eq!(ids, vec![u64::MAX - 1, u64::MAX]);

        let wide: BTreeSet<u64> = [0, 100_000].into_iter().collect();
        let encoded = encode_availability(&wide).unwrap();
        assert!(encoded.len() <= 1 + 2 * 10 + (MAX_AVAILABILITY_BITS / 8) as usize);
        assert_eq!(decode_availability(encoded.slice(1..)).unwrap(), vec![100_000]);
    }
}
