//! Clock ring over every resident pair.
//!
//! Nodes live in a slot vector and link to each other by index; freed slots
//! are recycled through a free list. The ring is circular with two
//! independent hands: the evictor's and the cleaner's. New pairs are linked
//! just behind the evictor hand so that they are visited last.

use std::collections::HashMap;
use std::sync::Arc;

use crate::pair::Pair;
use crate::types::BlockKey;

struct ClockNode<V> {
    pair: Arc<Pair<V>>,
    prev: usize,
    next: usize,
}

/// Circular list of pairs with evictor and cleaner hands.
pub(crate) struct ClockRing<V> {
    map: HashMap<BlockKey, usize>,
    nodes: Vec<Option<ClockNode<V>>>,
    free_list: Vec<usize>,
    evictor_hand: Option<usize>,
    cleaner_hand: Option<usize>,
}

impl<V> ClockRing<V> {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free_list: Vec::new(),
            evictor_hand: None,
            cleaner_hand: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn contains(&self, key: &BlockKey) -> bool {
        self.map.contains_key(key)
    }

    fn allocate_node(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(None);
            idx
        }
    }

    fn node(&self, idx: usize) -> &ClockNode<V> {
        match self.nodes[idx].as_ref() {
            Some(node) => node,
            None => unreachable!("clock slot {} is linked but empty", idx),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut ClockNode<V> {
        match self.nodes[idx].as_mut() {
            Some(node) => node,
            None => unreachable!("clock slot {} is linked but empty", idx),
        }
    }

    /// Link a pair behind the evictor hand.
    pub(crate) fn insert(&mut self, pair: Arc<Pair<V>>) {
        debug_assert!(!self.map.contains_key(&pair.key), "{} already in clock", pair.key);
        let key = pair.key;
        let idx = self.allocate_node();

        match self.evictor_hand {
            None => {
                self.nodes[idx] = Some(ClockNode {
                    pair,
                    prev: idx,
                    next: idx,
                });
                self.evictor_hand = Some(idx);
                self.cleaner_hand = Some(idx);
            }
            Some(hand) => {
                let prev = self.node(hand).prev;
                self.nodes[idx] = Some(ClockNode {
                    pair,
                    prev,
                    next: hand,
                });
                self.node_mut(prev).next = idx;
                self.node_mut(hand).prev = idx;
            }
        }

        self.map.insert(key, idx);
    }

    /// Unlink a pair. Returns whether it was present.
    pub(crate) fn remove(&mut self, key: &BlockKey) -> bool {
        let idx = match self.map.remove(key) {
            Some(idx) => idx,
            None => return false,
        };

        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };

        if next == idx {
            // Last node.
            self.evictor_hand = None;
            self.cleaner_hand = None;
        } else {
            self.node_mut(prev).next = next;
            self.node_mut(next).prev = prev;
            if self.evictor_hand == Some(idx) {
                self.evictor_hand = Some(next);
            }
            if self.cleaner_hand == Some(idx) {
                self.cleaner_hand = Some(next);
            }
        }

        self.nodes[idx] = None;
        self.free_list.push(idx);
        true
    }

    /// Pair under the evictor hand; the hand moves on.
    pub(crate) fn advance_evictor(&mut self) -> Option<Arc<Pair<V>>> {
        let idx = self.evictor_hand?;
        let node = self.node(idx);
        let pair = Arc::clone(&node.pair);
        self.evictor_hand = Some(node.next);
        Some(pair)
    }

    /// Up to `n` distinct pairs under the cleaner hand; the hand moves past
    /// them.
    pub(crate) fn advance_cleaner(&mut self, n: usize) -> Vec<Arc<Pair<V>>> {
        let n = n.min(self.len());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let idx = match self.cleaner_hand {
                Some(idx) => idx,
                None => break,
            };
            let node = self.node(idx);
            out.push(Arc::clone(&node.pair));
            self.cleaner_hand = Some(node.next);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair::test_util::{key, put_pair};

    fn ring_of(n: u64) -> ClockRing<u64> {
        let mut ring = ClockRing::new();
        for i in 0..n {
            ring.insert(put_pair(i));
        }
        ring
    }

    #[test]
    fn test_evictor_visits_in_insertion_order() {
        let mut ring = ring_of(4);
        let visited: Vec<u64> = (0..8)
            .map(|_| ring.advance_evictor().unwrap().key.block_num.0)
            .collect();
        assert_eq!(visited, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_new_pairs_visited_last() {
        let mut ring = ring_of(3);
        assert_eq!(ring.advance_evictor().unwrap().key, key(0));
        ring.insert(put_pair(9));
        let visited: Vec<u64> = (0..4)
            .map(|_| ring.advance_evictor().unwrap().key.block_num.0)
            .collect();
        assert_eq!(visited, vec![1, 2, 0, 9]);
    }

    #[test]
    fn test_remove_under_hand() {
        let mut ring = ring_of(3);
        assert!(ring.remove(&key(0)));
        assert!(!ring.remove(&key(0)));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.advance_evictor().unwrap().key, key(1));
        assert_eq!(ring.advance_evictor().unwrap().key, key(2));
        assert_eq!(ring.advance_evictor().unwrap().key, key(1));
    }

    #[test]
    fn test_remove_all_and_reuse_slots() {
        let mut ring = ring_of(3);
        for i in 0..3 {
            assert!(ring.remove(&key(i)));
        }
        assert_eq!(ring.len(), 0);
        assert!(ring.advance_evictor().is_none());
        assert!(ring.advance_cleaner(8).is_empty());

        ring.insert(put_pair(7));
        assert_eq!(ring.nodes.len(), 3);
        assert_eq!(ring.advance_evictor().unwrap().key, key(7));
        assert!(ring.contains(&key(7)));
    }

    #[test]
    fn test_cleaner_hand_is_independent() {
        let mut ring = ring_of(5);
        ring.advance_evictor();
        ring.advance_evictor();

        let batch: Vec<u64> = ring
            .advance_cleaner(3)
            .iter()
            .map(|p| p.key.block_num.0)
            .collect();
        assert_eq!(batch, vec![0, 1, 2]);

        // Batches never repeat a pair even when larger than the ring.
        let batch = ring.advance_cleaner(8);
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0].key, key(3));
    }
}
