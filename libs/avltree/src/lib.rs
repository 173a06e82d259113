// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An arena-indexed AVL tree with external comparators.
//!
//! Like its sibling `linked-list` crate, this tree owns no elements: nodes
//! are `u32` indices into a caller-owned store, and every participating
//! record embeds a [`Links`] field (parent/left/right indices plus a balance
//! factor) that an [`Adapter`] implementation locates. One record can be a
//! member of several trees through several `Links` fields.
//!
//! Ordering is not a property of the elements but of the *call*: insertion
//! takes a node/node comparator, lookups take a key/node comparator, both as
//! closures over the store. The caller must use one total order per tree;
//! mixing comparators breaks the structure. Equal keys are allowed and land
//! on the right of their equal chain, so `find_first_eq`/`find_last_eq`
//! bracket runs of duplicates.
//!
//! Rebalancing follows the classical AVL presentation: insertion walks parent
//! links until a balance factor reaches zero or one single/double rotation
//! restores the invariant; deletion of a two-child node swaps links *and*
//! balance factors with its in-order successor, then deletes it as a
//! 0/1-child node and walks upward until a balance of ±1 is reached.

#![cfg_attr(not(test), no_std)]

use core::cmp::Ordering;
use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;

/// Maps `(store, node index)` pairs to the [`Links`] field used by one
/// particular family of trees.
pub trait Adapter {
    /// The external store the node records live in.
    type Store: ?Sized;

    fn links(store: &Self::Store, node: u32) -> &Links;
    fn links_mut(store: &mut Self::Store, node: u32) -> &mut Links;
}

/// The link field embedded in every record that can join a [`Tree`].
///
/// The balance factor is `height(right) - height(left)` and stays in
/// `{-1, 0, 1}`; values of ±2 exist only transiently inside rebalancing.
#[derive(Clone)]
pub struct Links {
    parent: Option<u32>,
    left: Option<u32>,
    right: Option<u32>,
    balance: i8,
    in_tree: bool,
}

/// An AVL tree of nodes resolved through the adapter `A`.
pub struct Tree<A: Adapter> {
    root: Option<u32>,
    count: usize,
    _adapter: PhantomData<fn() -> A>,
}

// === impl Links ===

impl Links {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            parent: None,
            left: None,
            right: None,
            balance: 0,
            in_tree: false,
        }
    }

    /// Returns `true` if this node is currently a member of a tree.
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.in_tree
    }

    fn unlink(&mut self) {
        self.parent = None;
        self.left = None;
        self.right = None;
        self.balance = 0;
        self.in_tree = false;
    }
}

impl Default for Links {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Links {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Links")
            .field("parent", &self.parent)
            .field("left", &self.left)
            .field("right", &self.right)
            .field("balance", &self.balance)
            .field("in_tree", &self.in_tree)
            .finish()
    }
}

// === impl Tree ===

impl<A: Adapter> Default for Tree<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Adapter> Tree<A> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: None,
            count: 0,
            _adapter: PhantomData,
        }
    }

    /// Returns the number of nodes in the tree.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Returns `true` if `node` is linked into a tree of this family.
    pub fn contains(store: &A::Store, node: u32) -> bool {
        A::links(store, node).in_tree
    }

    // -- link field shorthands ------------------------------------------------

    fn parent(store: &A::Store, node: u32) -> Option<u32> {
        A::links(store, node).parent
    }

    fn left(store: &A::Store, node: u32) -> Option<u32> {
        A::links(store, node).left
    }

    fn right(store: &A::Store, node: u32) -> Option<u32> {
        A::links(store, node).right
    }

    fn balance(store: &A::Store, node: u32) -> i8 {
        A::links(store, node).balance
    }

    fn set_parent(store: &mut A::Store, node: u32, parent: Option<u32>) {
        A::links_mut(store, node).parent = parent;
    }

    fn set_left(store: &mut A::Store, node: u32, left: Option<u32>) {
        A::links_mut(store, node).left = left;
    }

    fn set_right(store: &mut A::Store, node: u32, right: Option<u32>) {
        A::links_mut(store, node).right = right;
    }

    fn set_balance(store: &mut A::Store, node: u32, balance: i8) {
        A::links_mut(store, node).balance = balance;
    }

    fn set_root(&mut self, store: &mut A::Store, root: Option<u32>) {
        self.root = root;
        if let Some(root) = root {
            Self::set_parent(store, root, None);
        }
    }

    /// Replaces `parent`'s child edge pointing at `old` with `new`; a `None`
    /// parent means `old` was the root. This stands in for the sentinel base
    /// node of the textbook formulation.
    fn replace_child(&mut self, store: &mut A::Store, parent: Option<u32>, old: u32, new: u32) {
        match parent {
            Some(parent) => {
                if Self::left(store, parent) == Some(old) {
                    Self::set_left(store, parent, Some(new));
                } else {
                    Self::set_right(store, parent, Some(new));
                }
            }
            None => self.set_root(store, Some(new)),
        }
    }

    // -- extrema and neighbors ------------------------------------------------

    /// The minimum node under the tree's order.
    pub fn first(&self, store: &A::Store) -> Option<u32> {
        let mut node = self.root?;
        while let Some(left) = Self::left(store, node) {
            node = left;
        }
        Some(node)
    }

    /// The maximum node under the tree's order.
    pub fn last(&self, store: &A::Store) -> Option<u32> {
        let mut node = self.root?;
        while let Some(right) = Self::right(store, node) {
            node = right;
        }
        Some(node)
    }

    /// The in-order successor of `node`.
    pub fn successor(store: &A::Store, node: u32) -> Option<u32> {
        if let Some(mut next) = Self::right(store, node) {
            while let Some(left) = Self::left(store, next) {
                next = left;
            }
            return Some(next);
        }
        let mut current = node;
        while let Some(parent) = Self::parent(store, current) {
            if Self::right(store, parent) == Some(current) {
                current = parent;
            } else {
                return Some(parent);
            }
        }
        None
    }

    /// The in-order predecessor of `node`.
    pub fn predecessor(store: &A::Store, node: u32) -> Option<u32> {
        if let Some(mut prev) = Self::left(store, node) {
            while let Some(right) = Self::right(store, prev) {
                prev = right;
            }
            return Some(prev);
        }
        let mut current = node;
        while let Some(parent) = Self::parent(store, current) {
            if Self::left(store, parent) == Some(current) {
                current = parent;
            } else {
                return Some(parent);
            }
        }
        None
    }

    // -- insertion ------------------------------------------------------------

    /// Inserts `node` using the node/node comparator `cmp`. Nodes comparing
    /// equal to an existing member land on its right.
    ///
    /// The node must not currently be linked; callers that move nodes between
    /// trees (or re-key them) remove them first.
    pub fn insert<C>(&mut self, store: &mut A::Store, node: u32, cmp: C)
    where
        C: Fn(&A::Store, u32, u32) -> Ordering,
    {
        debug_assert!(
            !A::links(store, node).in_tree,
            "node {node} is already in a tree"
        );

        {
            let links = A::links_mut(store, node);
            links.left = None;
            links.right = None;
            links.balance = 0;
            links.in_tree = true;
        }
        self.count += 1;

        let Some(root) = self.root else {
            self.set_root(store, Some(node));
            return;
        };

        // descend to the insert position
        let mut pos = root;
        let ordering = loop {
            let ordering = cmp(store, node, pos);
            let child = if ordering == Ordering::Less {
                Self::left(store, pos)
            } else {
                Self::right(store, pos)
            };
            match child {
                Some(child) => pos = child,
                None => break ordering,
            }
        };

        Self::set_parent(store, node, Some(pos));
        if ordering == Ordering::Less {
            Self::set_left(store, pos, Some(node));
        } else {
            Self::set_right(store, pos, Some(node));
        }
        self.balance_after_insert(store, node);
    }

    /// Looks for a node equal to `node` under `cmp`; if one exists it is
    /// returned and nothing is inserted, otherwise `node` is inserted and
    /// `None` is returned.
    ///
    /// `cmp` must be the same total order used by [`Tree::insert`] on this
    /// tree, or the structure breaks.
    pub fn find_or_insert<C>(&mut self, store: &mut A::Store, node: u32, cmp: C) -> Option<u32>
    where
        C: Fn(&A::Store, u32, u32) -> Ordering,
    {
        debug_assert!(!A::links(store, node).in_tree);

        let Some(root) = self.root else {
            {
                let links = A::links_mut(store, node);
                links.left = None;
                links.right = None;
                links.balance = 0;
                links.in_tree = true;
            }
            self.set_root(store, Some(node));
            self.count += 1;
            return None;
        };

        let mut pos = root;
        let ordering = loop {
            match cmp(store, node, pos) {
                Ordering::Less => match Self::left(store, pos) {
                    Some(child) => pos = child,
                    None => break Ordering::Less,
                },
                Ordering::Equal => return Some(pos),
                Ordering::Greater => match Self::right(store, pos) {
                    Some(child) => pos = child,
                    None => break Ordering::Greater,
                },
            }
        };

        {
            let links = A::links_mut(store, node);
            links.left = None;
            links.right = None;
            links.balance = 0;
            links.in_tree = true;
            links.parent = Some(pos);
        }
        if ordering == Ordering::Less {
            Self::set_left(store, pos, Some(node));
        } else {
            Self::set_right(store, pos, Some(node));
        }
        self.balance_after_insert(store, node);
        self.count += 1;
        None
    }

    fn balance_after_insert(&mut self, store: &mut A::Store, mut node: u32) {
        while let Some(parent) = Self::parent(store, node) {
            if Self::left(store, parent) == Some(node) {
                let balance = Self::balance(store, parent) - 1;
                Self::set_balance(store, parent, balance);
                if balance == 0 {
                    return;
                }
                if balance == -1 {
                    node = parent;
                    continue;
                }
                // balance == -2: the left subtree grew too tall
                if Self::balance(store, node) == -1 {
                    self.rotate_right(store, parent);
                    Self::set_balance(store, node, 0);
                    Self::set_balance(store, parent, 0);
                } else {
                    let old_right =
                        Self::right(store, node).expect("left-right case requires a right child");
                    let old_right_balance = Self::balance(store, old_right);
                    self.rotate_left(store, node);
                    self.rotate_right(store, parent);
                    Self::set_balance(store, node, if old_right_balance <= 0 { 0 } else { -1 });
                    Self::set_balance(store, parent, if old_right_balance == -1 { 1 } else { 0 });
                    Self::set_balance(store, old_right, 0);
                }
                return;
            }

            let balance = Self::balance(store, parent) + 1;
            Self::set_balance(store, parent, balance);
            if balance == 0 {
                return;
            }
            if balance == 1 {
                node = parent;
                continue;
            }
            // balance == 2: the right subtree grew too tall
            if Self::balance(store, node) == 1 {
                self.rotate_left(store, parent);
                Self::set_balance(store, node, 0);
                Self::set_balance(store, parent, 0);
            } else {
                let old_left =
                    Self::left(store, node).expect("right-left case requires a left child");
                let old_left_balance = Self::balance(store, old_left);
                self.rotate_right(store, node);
                self.rotate_left(store, parent);
                Self::set_balance(store, node, if old_left_balance >= 0 { 0 } else { 1 });
                Self::set_balance(store, parent, if old_left_balance == 1 { -1 } else { 0 });
                Self::set_balance(store, old_left, 0);
            }
            return;
        }
    }

    // -- removal --------------------------------------------------------------

    /// Removes `node` from the tree. Does nothing if the node is detached.
    pub fn remove(&mut self, store: &mut A::Store, node: u32) {
        if !A::links(store, node).in_tree {
            return;
        }

        if Self::left(store, node).is_some() && Self::right(store, node).is_some() {
            let successor = Self::successor(store, node)
                .expect("a node with two children has an in-order successor");
            self.switch_position_with_successor(store, node, successor);
        }

        let old_parent = Self::parent(store, node);
        let child = Self::left(store, node).or(Self::right(store, node));
        if let Some(child) = child {
            Self::set_parent(store, child, old_parent);
        }

        if let Some(parent) = old_parent {
            if Self::left(store, parent) == Some(node) {
                Self::set_left(store, parent, child);
                Self::set_balance(store, parent, Self::balance(store, parent) + 1);
            } else {
                Self::set_right(store, parent, child);
                Self::set_balance(store, parent, Self::balance(store, parent) - 1);
            }
            self.balance_after_delete(store, parent);
        } else {
            self.set_root(store, child);
        }

        self.count -= 1;
        A::links_mut(store, node).unlink();
    }

    /// Exchanges the tree positions (links *and* balance factors) of `node`
    /// and its in-order successor, reducing two-child deletion to the simple
    /// case.
    fn switch_position_with_successor(
        &mut self,
        store: &mut A::Store,
        node: u32,
        successor: u32,
    ) {
        let node_balance = Self::balance(store, node);
        Self::set_balance(store, node, Self::balance(store, successor));
        Self::set_balance(store, successor, node_balance);

        let old_parent = Self::parent(store, node);
        let old_left = Self::left(store, node);
        let old_right = Self::right(store, node);
        let old_succ_parent = Self::parent(store, successor);
        let old_succ_left = Self::left(store, successor);
        let old_succ_right = Self::right(store, successor);

        self.replace_child(store, old_parent, node, successor);
        Self::set_parent(store, successor, old_parent);

        if old_succ_parent != Some(node) {
            let succ_parent =
                old_succ_parent.expect("the successor of an internal node has a parent");
            if Self::left(store, succ_parent) == Some(successor) {
                Self::set_left(store, succ_parent, Some(node));
            } else {
                Self::set_right(store, succ_parent, Some(node));
            }
            Self::set_right(store, successor, old_right);
            Self::set_parent(store, node, old_succ_parent);
            if let Some(old_right) = old_right {
                Self::set_parent(store, old_right, Some(successor));
            }
        } else {
            Self::set_right(store, successor, Some(node));
            Self::set_parent(store, node, Some(successor));
        }

        Self::set_left(store, node, old_succ_left);
        if let Some(old_succ_left) = old_succ_left {
            Self::set_parent(store, old_succ_left, Some(node));
        }
        Self::set_right(store, node, old_succ_right);
        if let Some(old_succ_right) = old_succ_right {
            Self::set_parent(store, old_succ_right, Some(node));
        }
        Self::set_left(store, successor, old_left);
        if let Some(old_left) = old_left {
            Self::set_parent(store, old_left, Some(successor));
        }
    }

    fn balance_after_delete(&mut self, store: &mut A::Store, mut node: u32) {
        loop {
            let balance = Self::balance(store, node);
            if balance == 1 || balance == -1 {
                return;
            }
            let old_parent = Self::parent(store, node);

            if balance == 0 {
                // this subtree shrank; propagate to the parent
                let Some(parent) = old_parent else { return };
                if Self::left(store, parent) == Some(node) {
                    Self::set_balance(store, parent, Self::balance(store, parent) + 1);
                } else {
                    Self::set_balance(store, parent, Self::balance(store, parent) - 1);
                }
                node = parent;
            } else if balance == 2 {
                let old_right =
                    Self::right(store, node).expect("balance 2 requires a right child");
                let old_right_balance = Self::balance(store, old_right);
                if old_right_balance >= 0 {
                    self.rotate_left(store, node);
                    Self::set_balance(store, node, 1 - old_right_balance);
                    Self::set_balance(store, old_right, old_right_balance - 1);
                    node = old_right;
                } else {
                    let old_right_left = Self::left(store, old_right)
                        .expect("a right child with balance -1 has a left child");
                    let old_right_left_balance = Self::balance(store, old_right_left);
                    self.rotate_right(store, old_right);
                    self.rotate_left(store, node);
                    Self::set_balance(
                        store,
                        node,
                        if old_right_left_balance <= 0 { 0 } else { -1 },
                    );
                    Self::set_balance(
                        store,
                        old_right,
                        if old_right_left_balance >= 0 { 0 } else { 1 },
                    );
                    Self::set_balance(store, old_right_left, 0);
                    node = old_right_left;
                }
            } else {
                let old_left = Self::left(store, node).expect("balance -2 requires a left child");
                let old_left_balance = Self::balance(store, old_left);
                if old_left_balance <= 0 {
                    self.rotate_right(store, node);
                    Self::set_balance(store, node, -1 - old_left_balance);
                    Self::set_balance(store, old_left, old_left_balance + 1);
                    node = old_left;
                } else {
                    let old_left_right = Self::right(store, old_left)
                        .expect("a left child with balance 1 has a right child");
                    let old_left_right_balance = Self::balance(store, old_left_right);
                    self.rotate_left(store, old_left);
                    self.rotate_right(store, node);
                    Self::set_balance(
                        store,
                        node,
                        if old_left_right_balance >= 0 { 0 } else { 1 },
                    );
                    Self::set_balance(
                        store,
                        old_left,
                        if old_left_right_balance <= 0 { 0 } else { -1 },
                    );
                    Self::set_balance(store, old_left_right, 0);
                    node = old_left_right;
                }
            }
        }
    }

    // -- rotations ------------------------------------------------------------

    fn rotate_left(&mut self, store: &mut A::Store, node: u32) {
        let old_right = Self::right(store, node).expect("rotate_left requires a right child");
        let old_right_left = Self::left(store, old_right);
        let parent = Self::parent(store, node);

        self.replace_child(store, parent, node, old_right);
        Self::set_parent(store, old_right, parent);
        Self::set_parent(store, node, Some(old_right));
        Self::set_right(store, node, old_right_left);
        if let Some(old_right_left) = old_right_left {
            Self::set_parent(store, old_right_left, Some(node));
        }
        Self::set_left(store, old_right, Some(node));
    }

    fn rotate_right(&mut self, store: &mut A::Store, node: u32) {
        let old_left = Self::left(store, node).expect("rotate_right requires a left child");
        let old_left_right = Self::right(store, old_left);
        let parent = Self::parent(store, node);

        self.replace_child(store, parent, node, old_left);
        Self::set_parent(store, old_left, parent);
        Self::set_parent(store, node, Some(old_left));
        Self::set_left(store, node, old_left_right);
        if let Some(old_left_right) = old_left_right {
            Self::set_parent(store, old_left_right, Some(node));
        }
        Self::set_right(store, old_left, Some(node));
    }

    // -- lookups --------------------------------------------------------------

    /// Finds a node comparing equal to the key baked into `cmp`, which
    /// returns the ordering of the key relative to its node argument.
    pub fn find<C>(&self, store: &A::Store, cmp: C) -> Option<u32>
    where
        C: Fn(&A::Store, u32) -> Ordering,
    {
        let mut node = self.root;
        while let Some(current) = node {
            node = match cmp(store, current) {
                Ordering::Equal => return Some(current),
                Ordering::Less => Self::left(store, current),
                Ordering::Greater => Self::right(store, current),
            };
        }
        None
    }

    /// Like [`Tree::find`], but when no node matches, returns the last node
    /// visited on the search path instead of `None`.
    pub fn find_nearest<C>(&self, store: &A::Store, cmp: C) -> Option<u32>
    where
        C: Fn(&A::Store, u32) -> Ordering,
    {
        let mut node = self.root?;
        loop {
            let child = match cmp(store, node) {
                Ordering::Equal => return Some(node),
                Ordering::Less => Self::left(store, node),
                Ordering::Greater => Self::right(store, node),
            };
            match child {
                Some(child) => node = child,
                None => return Some(node),
            }
        }
    }

    /// The leftmost node whose key is `>=` the key baked into `cmp`.
    pub fn find_first_ge<C>(&self, store: &A::Store, cmp: C) -> Option<u32>
    where
        C: Fn(&A::Store, u32) -> Ordering,
    {
        let mut result = None;
        let mut node = self.root;
        while let Some(current) = node {
            node = if cmp(store, current) == Ordering::Greater {
                Self::right(store, current)
            } else {
                result = Some(current);
                Self::left(store, current)
            };
        }
        result
    }

    /// The rightmost node whose key is `<=` the key baked into `cmp`.
    pub fn find_last_le<C>(&self, store: &A::Store, cmp: C) -> Option<u32>
    where
        C: Fn(&A::Store, u32) -> Ordering,
    {
        let mut result = None;
        let mut node = self.root;
        while let Some(current) = node {
            node = if cmp(store, current) == Ordering::Less {
                Self::left(store, current)
            } else {
                result = Some(current);
                Self::right(store, current)
            };
        }
        result
    }

    /// The leftmost node comparing equal to the key baked into `cmp`.
    pub fn find_first_eq<C>(&self, store: &A::Store, cmp: C) -> Option<u32>
    where
        C: Fn(&A::Store, u32) -> Ordering,
    {
        let mut result = None;
        let mut node = self.root;
        while let Some(current) = node {
            node = match cmp(store, current) {
                Ordering::Greater => Self::right(store, current),
                ordering => {
                    if ordering == Ordering::Equal {
                        result = Some(current);
                    }
                    Self::left(store, current)
                }
            };
        }
        result
    }

    /// The rightmost node comparing equal to the key baked into `cmp`.
    pub fn find_last_eq<C>(&self, store: &A::Store, cmp: C) -> Option<u32>
    where
        C: Fn(&A::Store, u32) -> Ordering,
    {
        let mut result = None;
        let mut node = self.root;
        while let Some(current) = node {
            node = match cmp(store, current) {
                Ordering::Less => Self::left(store, current),
                ordering => {
                    if ordering == Ordering::Equal {
                        result = Some(current);
                    }
                    Self::right(store, current)
                }
            };
        }
        result
    }

    // -- traversal ------------------------------------------------------------

    /// In-order iterator over the node indices; double-ended.
    pub fn iter<'a>(&self, store: &'a A::Store) -> Iter<'a, A> {
        Iter {
            store,
            head: self.first(store),
            tail: self.last(store),
            done: self.root.is_none(),
            _adapter: PhantomData,
        }
    }

    /// Visits every node in post order (children before parents), which makes
    /// it safe for `f` to tear down per-node state.
    pub fn post_order<F>(&self, store: &A::Store, mut f: F)
    where
        F: FnMut(u32),
    {
        fn visit<A: Adapter>(store: &A::Store, node: u32, f: &mut impl FnMut(u32)) {
            if let Some(left) = Tree::<A>::left(store, node) {
                visit::<A>(store, left, f);
            }
            if let Some(right) = Tree::<A>::right(store, node) {
                visit::<A>(store, right, f);
            }
            f(node);
        }

        if let Some(root) = self.root {
            visit::<A>(store, root, &mut f);
        }
    }
}

impl<A: Adapter> fmt::Debug for Tree<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root)
            .field("count", &self.count)
            .finish()
    }
}

/// Double-ended in-order iterator returned by [`Tree::iter`].
pub struct Iter<'a, A: Adapter> {
    store: &'a A::Store,
    head: Option<u32>,
    tail: Option<u32>,
    done: bool,
    _adapter: PhantomData<fn() -> A>,
}

impl<A: Adapter> Iterator for Iter<'_, A> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let node = self.head?;
        if self.head == self.tail {
            self.done = true;
        } else {
            self.head = Tree::<A>::successor(self.store, node);
        }
        Some(node)
    }
}

impl<A: Adapter> DoubleEndedIterator for Iter<'_, A> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let node = self.tail?;
        if self.head == self.tail {
            self.done = true;
        } else {
            self.tail = Tree::<A>::predecessor(self.store, node);
        }
        Some(node)
    }
}

impl<A: Adapter> FusedIterator for Iter<'_, A> {}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use alloc::vec::Vec;

    struct TestNode {
        links: Links,
        key: u64,
    }

    struct ByKey;

    impl Adapter for ByKey {
        type Store = Vec<TestNode>;

        fn links(store: &Self::Store, node: u32) -> &Links {
            &store[node as usize].links
        }

        fn links_mut(store: &mut Self::Store, node: u32) -> &mut Links {
            &mut store[node as usize].links
        }
    }

    fn store_with_keys(keys: &[u64]) -> Vec<TestNode> {
        keys.iter()
            .map(|&key| TestNode {
                links: Links::new(),
                key,
            })
            .collect()
    }

    fn node_cmp(store: &Vec<TestNode>, a: u32, b: u32) -> Ordering {
        store[a as usize].key.cmp(&store[b as usize].key)
    }

    fn by_key(key: u64) -> impl Fn(&Vec<TestNode>, u32) -> Ordering {
        move |store, node| key.cmp(&store[node as usize].key)
    }

    /// Recomputes subtree heights and checks the AVL invariant, the stored
    /// balance factors, and the parent links.
    fn check_subtree(store: &Vec<TestNode>, node: u32, expected_parent: Option<u32>) -> i64 {
        let links = &store[node as usize].links;
        assert_eq!(links.parent, expected_parent, "bad parent link of {node}");
        assert!(links.in_tree);

        let left_height = links
            .left
            .map_or(0, |left| check_subtree(store, left, Some(node)));
        let right_height = links
            .right
            .map_or(0, |right| check_subtree(store, right, Some(node)));

        let balance = right_height - left_height;
        assert!(balance.abs() <= 1, "AVL invariant violated at {node}");
        assert_eq!(
            i64::from(store[node as usize].links.balance),
            balance,
            "stale balance factor at {node}"
        );
        1 + left_height.max(right_height)
    }

    fn check_tree(tree: &Tree<ByKey>, store: &Vec<TestNode>) {
        if let Some(root) = tree.first(store).map(|_| tree.root.unwrap()) {
            check_subtree(store, root, None);
        }
        let keys: Vec<u64> = tree.iter(store).map(|n| store[n as usize].key).collect();
        assert_eq!(keys.len(), tree.len());
        assert!(keys.windows(2).all(|w| w[0] <= w[1]), "in-order not sorted");
    }

    /// Splitmix-style generator so the stress test is deterministic.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn insert_keeps_order_and_invariants() {
        let keys = [50, 20, 70, 10, 30, 60, 80, 25, 35, 5];
        let mut store = store_with_keys(&keys);
        let mut tree = Tree::<ByKey>::new();

        for node in 0..keys.len() as u32 {
            tree.insert(&mut store, node, node_cmp);
            check_tree(&tree, &store);
        }

        let in_order: Vec<u64> = tree.iter(&store).map(|n| store[n as usize].key).collect();
        assert_eq!(in_order, [5, 10, 20, 25, 30, 35, 50, 60, 70, 80]);
        assert_eq!(tree.first(&store), Some(9));
        assert_eq!(tree.last(&store), Some(6));
    }

    #[test]
    fn stress_insert_remove() {
        let mut rng = Rng(0x5eed);
        let keys: Vec<u64> = (0..256).map(|_| rng.next() % 1000).collect();
        let mut store = store_with_keys(&keys);
        let mut tree = Tree::<ByKey>::new();

        for node in 0..keys.len() as u32 {
            tree.insert(&mut store, node, node_cmp);
            check_tree(&tree, &store);
        }
        assert_eq!(tree.len(), keys.len());

        // remove in a scrambled order
        let mut order: Vec<u32> = (0..keys.len() as u32).collect();
        for i in (1..order.len()).rev() {
            let j = (rng.next() as usize) % (i + 1);
            order.swap(i, j);
        }
        for node in order {
            tree.remove(&mut store, node);
            assert!(!store[node as usize].links.is_linked());
            check_tree(&tree, &store);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn remove_detached_node_is_noop() {
        let mut store = store_with_keys(&[1, 2]);
        let mut tree = Tree::<ByKey>::new();
        tree.insert(&mut store, 0, node_cmp);

        tree.remove(&mut store, 1);

        assert_eq!(tree.len(), 1);
        check_tree(&tree, &store);
    }

    #[test]
    fn find_variants() {
        let mut store = store_with_keys(&[10, 20, 30, 40]);
        let mut tree = Tree::<ByKey>::new();
        for node in 0..4 {
            tree.insert(&mut store, node, node_cmp);
        }

        assert_eq!(tree.find(&store, by_key(30)), Some(2));
        assert_eq!(tree.find(&store, by_key(35)), None);

        // the nearest node is the last one visited on the search path
        let nearest = tree.find_nearest(&store, by_key(35)).unwrap();
        assert!(matches!(store[nearest as usize].key, 30 | 40));

        assert_eq!(tree.find_first_ge(&store, by_key(25)), Some(2));
        assert_eq!(tree.find_first_ge(&store, by_key(30)), Some(2));
        assert_eq!(tree.find_first_ge(&store, by_key(41)), None);
        assert_eq!(tree.find_last_le(&store, by_key(25)), Some(1));
        assert_eq!(tree.find_last_le(&store, by_key(10)), Some(0));
        assert_eq!(tree.find_last_le(&store, by_key(9)), None);
    }

    #[test]
    fn duplicate_keys_form_a_run() {
        let mut store = store_with_keys(&[5, 3, 5, 5, 1]);
        let mut tree = Tree::<ByKey>::new();
        for node in 0..5 {
            tree.insert(&mut store, node, node_cmp);
        }

        let first = tree.find_first_eq(&store, by_key(5)).unwrap();
        let last = tree.find_last_eq(&store, by_key(5)).unwrap();
        assert_eq!(store[first as usize].key, 5);
        assert_eq!(store[last as usize].key, 5);

        // walking successors from the leftmost equal covers all three fives
        let mut run = 0;
        let mut cursor = Some(first);
        while let Some(node) = cursor {
            if store[node as usize].key != 5 {
                break;
            }
            run += 1;
            cursor = Tree::<ByKey>::successor(&store, node);
        }
        assert_eq!(run, 3);
    }

    #[test]
    fn find_or_insert_returns_existing() {
        let mut store = store_with_keys(&[7, 7, 9]);
        let mut tree = Tree::<ByKey>::new();
        assert_eq!(tree.find_or_insert(&mut store, 0, node_cmp), None);
        assert_eq!(tree.find_or_insert(&mut store, 1, node_cmp), Some(0));
        assert_eq!(tree.find_or_insert(&mut store, 2, node_cmp), None);

        assert_eq!(tree.len(), 2);
        assert!(!store[1].links.is_linked());
        check_tree(&tree, &store);
    }

    #[test]
    fn iter_is_double_ended() {
        let mut store = store_with_keys(&[4, 2, 6, 1, 3, 5, 7]);
        let mut tree = Tree::<ByKey>::new();
        for node in 0..7 {
            tree.insert(&mut store, node, node_cmp);
        }

        let forward: Vec<u64> = tree.iter(&store).map(|n| store[n as usize].key).collect();
        assert_eq!(forward, [1, 2, 3, 4, 5, 6, 7]);

        let backward: Vec<u64> = tree
            .iter(&store)
            .rev()
            .map(|n| store[n as usize].key)
            .collect();
        assert_eq!(backward, [7, 6, 5, 4, 3, 2, 1]);

        // meeting in the middle terminates cleanly
        let mut iter = tree.iter(&store);
        let mut seen = Vec::new();
        loop {
            match iter.next() {
                Some(n) => seen.push(n),
                None => break,
            }
            match iter.next_back() {
                Some(n) => seen.push(n),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn post_order_visits_children_first() {
        let mut store = store_with_keys(&[4, 2, 6, 1, 3, 5, 7]);
        let mut tree = Tree::<ByKey>::new();
        for node in 0..7 {
            tree.insert(&mut store, node, node_cmp);
        }

        let mut visited = Vec::new();
        tree.post_order(&store, |node| {
            let links = &store[node as usize].links;
            for child in [links.left, links.right].into_iter().flatten() {
                assert!(visited.contains(&child), "child {child} after parent {node}");
            }
            visited.push(node);
        });
        assert_eq!(visited.len(), 7);
    }
}
