use std::collections::{BTreeSet, HashMap};

use crate::core::ExchangeKind;

struct PatternNode {
    children: HashMap<String, PatternNode>,
    wildcard_child: Option<Box<PatternNode>>, // "*" matches exactly one word
    multi_wildcard: Option<Box<PatternNode>>, // "#" matches zero or more words
    queues: BTreeSet<String>,
}

impl PatternNode {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            wildcard_child: None,
            multi_wildcard: None,
            queues: BTreeSet::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.queues.is_empty()
            && self.children.is_empty()
            && self.wildcard_child.is_none()
            && self.multi_wildcard.is_none()
    }
}

/// Bindings of one exchange, matched the way the exchange kind dictates.
pub struct RoutingTable {
    kind: ExchangeKind,
    pattern_trie: PatternNode,
    exact: HashMap<String, BTreeSet<String>>,
}

impl RoutingTable {
    pub fn new(kind: ExchangeKind) -> Self {
        Self {
            kind,
            pattern_trie: PatternNode::new(),
            exact: HashMap::new(),
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn bind(&mut self, pattern: &str, queue: &str) {
        match self.kind {
            ExchangeKind::Topic => {
                let segments = pattern.split('.').collect::<Vec<_>>();
                Self::add_binding(&mut self.pattern_trie, &segments, queue);
            }
            ExchangeKind::Direct | ExchangeKind::Fanout => {
                self.exact
                    .entry(pattern.to_string())
                    .or_default()
                    .insert(queue.to_string());
            }
        }
    }

    /// Returns whether the binding existed.
    pub fn unbind(&mut self, pattern: &str, queue: &str) -> bool {
        match self.kind {
            ExchangeKind::Topic => {
                let segments = pattern.split('.').collect::<Vec<_>>();
                Self::remove_binding(&mut self.pattern_trie, &segments, queue)
            }
            ExchangeKind::Direct | ExchangeKind::Fanout => {
                let Some(queues) = self.exact.get_mut(pattern) else {
                    return false;
                };
                let removed = queues.remove(queue);
                if queues.is_empty() {
                    self.exact.remove(pattern);
                }
                removed
            }
        }
    }

    pub fn remove_queue(&mut self, queue: &str) {
        self.exact.retain(|_, queues| {
            queues.remove(queue);
            !queues.is_empty()
        });
        Self::purge_queue(&mut self.pattern_trie, queue);
    }

    /// Queues a message published with `routing_key` lands in, each at most once.
    pub fn route(&self, routing_key: &str) -> Vec<String> {
        let mut result = BTreeSet::new();
        match self.kind {
            ExchangeKind::Fanout => {
                for queues in self.exact.values() {
                    result.extend(queues.iter().cloned());
                }
            }
            ExchangeKind::Direct => {
                if let Some(queues) = self.exact.get(routing_key) {
                    result.extend(queues.iter().cloned());
                }
            }
            ExchangeKind::Topic => {
                let segments = routing_key.split('.').collect::<Vec<_>>();
                Self::collect_queues(&self.pattern_trie, &segments, &mut result);
            }
        }
        result.into_iter().collect()
    }

    fn add_binding(node: &mut PatternNode, segments: &[&str], queue: &str) {
        let Some((segment, remaining)) = segments.split_first() else {
            node.queues.insert(queue.to_string());
            return;
        };

        let child = match *segment {
            "*" => &mut **node
                .wildcard_child
                .get_or_insert_with(|| Box::new(PatternNode::new())),
            "#" => &mut **node
                .multi_wildcard
                .get_or_insert_with(|| Box::new(PatternNode::new())),
            word => node
                .children
                .entry(word.to_string())
                .or_insert_with(PatternNode::new),
        };
        Self::add_binding(child, remaining, queue);
    }

    fn remove_binding(node: &mut PatternNode, segments: &[&str], queue: &str) -> bool {
        let Some((segment, remaining)) = segments.split_first() else {
            return node.queues.remove(queue);
        };

        match *segment {
            "*" => Self::remove_from_boxed(&mut node.wildcard_child, remaining, queue),
            "#" => Self::remove_from_boxed(&mut node.multi_wildcard, remaining, queue),
            word => {
                let Some(child) = node.children.get_mut(word) else {
                    return false;
                };
                let removed = Self::remove_binding(child, remaining, queue);
                if child.is_empty() {
                    node.children.remove(word);
                }
                removed
            }
        }
    }

    fn remove_from_boxed(slot: &mut Option<Box<PatternNode>>, segments: &[&str], queue: &str) -> bool {
        let Some(child) = slot.as_mut() else {
            return false;
        };
        let removed = Self::remove_binding(child, segments, queue);
        if child.is_empty() {
            *slot = None;
        }
        removed
    }

    fn purge_queue(node: &mut PatternNode, queue: &str) {
        node.queues.remove(queue);
        for child in node.children.values_mut() {
            Self::purge_queue(child, queue);
        }
        node.children.retain(|_, child| !child.is_empty());
        for slot in [&mut node.wildcard_child, &mut node.multi_wildcard] {
            if let Some(child) = slot.as_mut() {
                Self::purge_queue(child, queue);
                if child.is_empty() {
                    *slot = None;
                }
            }
        }
    }

    fn collect_queues(node: &PatternNode, segments: &[&str], result: &mut BTreeSet<String>) {
        // "#" may swallow any number of the remaining words, including none
        if let Some(multi) = &node.multi_wildcard {
            for skip in 0..=segments.len() {
                Self::collect_queues(multi, &segments[skip..], result);
            }
        }

        let Some((segment, remaining)) = segments.split_first() else {
            result.extend(node.queues.iter().cloned());
            return;
        };

        if let Some(child) = node.children.get(*segment) {
            Self::collect_queues(child, remaining, result);
        }
        if let Some(wildcard) = &node.wildcard_child {
            Self::collect_queues(wildcard, remaining, result);
        }
    }
}
