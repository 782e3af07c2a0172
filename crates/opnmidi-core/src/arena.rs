//! Fixed-capacity ordered arena with stable integer handles.
//!
//! Backing store for every per-slot claim list and per-channel note list in
//! the engine. Nodes live in one flat allocation; insertion order is kept by
//! an intrusive doubly-linked list threaded through node indices, and free
//! nodes are chained through the same links. No node ever moves, so a
//! [`Handle`] stays valid until the entry is removed.
//!
//! The structure is deliberately small: push to the back, remove anywhere,
//! walk in order. Capacity is fixed at construction and insertion into a
//! full arena fails without mutating anything.

/// Sentinel index terminating the intrusive lists.
const NIL: u16 = u16::MAX;

/// Stable handle to an entry in a [`ClaimArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(u16);

impl Handle {
    /// Raw slot index, mainly useful for diagnostics.
    #[inline]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

#[derive(Debug, Clone)]
struct Node<T> {
    value: Option<T>,
    prev: u16,
    next: u16,
}

/// Fixed-capacity arena preserving insertion order.
#[derive(Debug, Clone)]
pub struct ClaimArena<T> {
    nodes: Box<[Node<T>]>,
    head: u16,
    tail: u16,
    free: u16,
    len: usize,
}

impl<T> ClaimArena<T> {
    /// Creates an empty arena holding at most `capacity` entries.
    ///
    /// # Panics
    /// Panics if `capacity` cannot be indexed by the 16-bit links.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity < usize::from(NIL), "arena capacity too large");
        let mut nodes = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity { (i + 1) as u16 } else { NIL };
            nodes.push(Node {
                value: None,
                prev: NIL,
                next,
            });
        }
        Self {
            nodes: nodes.into_boxed_slice(),
            head: NIL,
            tail: NIL,
            free: if capacity > 0 { 0 } else { NIL },
            len: 0,
        }
    }

    /// Maximum number of entries.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Current number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when no entries are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `value` at the back of the order.
    ///
    /// # Returns
    /// The new entry's handle, or `None` when the arena is full (nothing is
    /// mutated in that case).
    pub fn push_back(&mut self, value: T) -> Option<Handle> {
        if self.free == NIL {
            return None;
        }
        let idx = self.free;
        self.free = self.nodes[usize::from(idx)].next;

        let node = &mut self.nodes[usize::from(idx)];
        node.value = Some(value);
        node.prev = self.tail;
        node.next = NIL;

        if self.tail == NIL {
            self.head = idx;
        } else {
            self.nodes[usize::from(self.tail)].next = idx;
        }
        self.tail = idx;
        self.len += 1;
        Some(Handle(idx))
    }

    /// Removes the entry behind `handle`, keeping the order of the rest.
    ///
    /// # Returns
    /// The removed value, or `None` for a stale handle.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let idx = handle.0;
        let node = self.nodes.get_mut(usize::from(idx))?;
        let value = node.value.take()?;
        let (prev, next) = (node.prev, node.next);

        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[usize::from(prev)].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[usize::from(next)].prev = prev;
        }

        let node = &mut self.nodes[usize::from(idx)];
        node.prev = NIL;
        node.next = self.free;
        self.free = idx;
        self.len -= 1;
        Some(value)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        while let Some(h) = self.first() {
            self.remove(h);
        }
    }

    /// Shared access to the entry behind `handle`.
    #[inline]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.nodes
            .get(usize::from(handle.0))
            .and_then(|n| n.value.as_ref())
    }

    /// Mutable access to the entry behind `handle`.
    #[inline]
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.nodes
            .get_mut(usize::from(handle.0))
            .and_then(|n| n.value.as_mut())
    }

    /// Handle of the oldest entry.
    #[inline]
    pub fn first(&self) -> Option<Handle> {
        (self.head != NIL).then_some(Handle(self.head))
    }

    /// Handle of the most recent entry.
    #[inline]
    pub fn last(&self) -> Option<Handle> {
        (self.tail != NIL).then_some(Handle(self.tail))
    }

    /// Handle of the entry after `handle` in insertion order.
    ///
    /// Safe to use for hand-rolled iteration that removes entries along the
    /// way: fetch the successor before removing.
    #[inline]
    pub fn next(&self, handle: Handle) -> Option<Handle> {
        let node = self.nodes.get(usize::from(handle.0))?;
        node.value.as_ref()?;
        (node.next != NIL).then_some(Handle(node.next))
    }

    /// In-order iterator over handles and values.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            arena: self,
            cursor: self.head,
        }
    }

    /// Handle of the first entry matching `pred`, in insertion order.
    pub fn find<F>(&self, mut pred: F) -> Option<Handle>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }
}

/// In-order iterator returned by [`ClaimArena::iter`].
pub struct Iter<'a, T> {
    arena: &'a ClaimArena<T>,
    cursor: u16,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let idx = self.cursor;
        let node = &self.arena.nodes[usize::from(idx)];
        self.cursor = node.next;
        node.value.as_ref().map(|v| (Handle(idx), v))
    }
}
