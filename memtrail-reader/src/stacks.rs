// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interning of interpreted stacks. The reader replays frame push/pop
//! records per thread; every distinct stack becomes one node chain in a
//! prefix tree, so an allocation's whole stack is a single u32 and equal
//! stacks across allocations share an id.

use rustc_hash::FxHashMap;

/// One interpreted frame as replay sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub code_id: u64,
    pub offset: u32,
    pub is_entry: bool,
}

struct Node {
    frame: FrameKey,
    parent: u32,
}

/// Prefix tree of stacks. Id 0 is the empty stack; ids grow densely from
/// 1 as new (parent, frame) pairs appear.
#[derive(Default)]
pub struct StackInterner {
    nodes: Vec<Node>,
    index: FxHashMap<(u32, FrameKey), u32>,
}

impl StackInterner {
    /// The stack `parent` extended by `frame`.
    pub fn push(&mut self, parent: u32, frame: FrameKey) -> u32 {
        if let Some(&id) = self.index.get(&(parent, frame)) {
            return id;
        }
        self.nodes.push(Node { frame, parent });
        let id = self.nodes.len() as u32;
        self.index.insert((parent, frame), id);
        id
    }

    /// The stack `id` without its top frame. Unknown ids collapse to the
    /// empty stack.
    pub fn parent(&self, id: u32) -> u32 {
        match id.checked_sub(1).and_then(|i| self.nodes.get(i as usize)) {
            Some(node) => node.parent,
            None => 0,
        }
    }

    /// Frames of stack `id`, outermost first.
    pub fn frames(&self, id: u32) -> Vec<FrameKey> {
        let mut frames = Vec::new();
        let mut current = id;
        while current != 0 {
            let Some(node) = current
                .checked_sub(1)
                .and_then(|i| self.nodes.get(i as usize))
            else {
                break;
            };
            frames.push(node.frame);
            current = node.parent;
        }
        frames.reverse();
        frames
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
