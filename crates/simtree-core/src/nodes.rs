//! # State Node Store
//!
//! Persistence and retrieval of immutable [`StateNode`]s.
//!
//! Nodes form a forest: each node names at most one parent, and a parent
//! must exist before its child is created. Nodes are never updated or
//! deleted through this API.

use crate::primitives::PAGE_SIZE;
use crate::repository::{IdKind, ReadTxn, Repository, WriteTxn};
use crate::types::{NewState, SimtreeError, StateId, StateNode};
use chrono::Utc;
use std::collections::BTreeSet;

/// Operations on the state forest.
pub struct StateStore;

impl StateStore {
    /// Record a new state and return it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns `SimtreeError::InvalidParent` if `parent_id` names a state
    /// that does not exist.
    pub fn create<R: Repository>(repo: &R, new: NewState) -> Result<StateNode, SimtreeError> {
        let node = repo.write(|txn| Self::create_in(txn, new))?;
        tracing::debug!(state_id = %node.id, parent_id = ?node.parent_id, "state created");
        Ok(node)
    }

    pub(crate) fn create_in<T: WriteTxn + ?Sized>(
        txn: &mut T,
        new: NewState,
    ) -> Result<StateNode, SimtreeError> {
        if let Some(parent) = new.parent_id
            && txn.state(parent)?.is_none()
        {
            return Err(SimtreeError::InvalidParent(parent));
        }
        let id = StateId(txn.allocate_id(IdKind::State)?);
        let node = StateNode::from_new(id, new, Utc::now());
        txn.put_state(&node)?;
        Ok(node)
    }

    pub fn get<R: Repository>(repo: &R, id: StateId) -> Result<StateNode, SimtreeError> {
        repo.read(|txn| Self::require_in(txn, id))
    }

    pub(crate) fn require_in<T: ReadTxn + ?Sized>(
        txn: &T,
        id: StateId,
    ) -> Result<StateNode, SimtreeError> {
        txn.state(id)?.ok_or(SimtreeError::StateNotFound(id))
    }

    /// Direct children of `id`, ordered by `(step_number, id)`.
    ///
    /// A state without children yields an empty list.
    pub fn children_of<R: Repository>(
        repo: &R,
        id: StateId,
    ) -> Result<Vec<StateNode>, SimtreeError> {
        repo.read(|txn| {
            Self::require_in(txn, id)?;
            Self::children_in(txn, id)
        })
    }

    pub(crate) fn children_in<T: ReadTxn + ?Sized>(
        txn: &T,
        id: StateId,
    ) -> Result<Vec<StateNode>, SimtreeError> {
        txn.child_ids(id)?
            .into_iter()
            .map(|child| Self::require_in(txn, child))
            .collect()
    }

    pub fn count<R: Repository>(repo: &R) -> Result<u64, SimtreeError> {
        repo.read(|txn| txn.state_count())
    }

    /// Check that no parent chain revisits a state.
    ///
    /// Every chain is walked at most once; chains that reach an already
    /// verified node stop there. A walk longer than the number of stored
    /// states must contain a cycle.
    ///
    /// # Errors
    ///
    /// Returns `SimtreeError::CycleDetected` naming the state whose chain
    /// loops.
    pub fn verify_acyclic<R: Repository>(repo: &R) -> Result<(), SimtreeError> {
        repo.read(|txn| {
            let bound = txn.state_count()?;
            let mut verified: BTreeSet<StateId> = BTreeSet::new();

            for_each_state(txn, |node| {
                let mut path = Vec::new();
                let mut current = node.clone();
                while !verified.contains(&current.id) {
                    path.push(current.id);
                    if path.len() as u64 > bound {
                        return Err(SimtreeError::CycleDetected(node.id));
                    }
                    let Some(parent) = current.parent_id else {
                        break;
                    };
                    match txn.state(parent)? {
                        Some(next) => current = next,
                        // Dangling parent: an orphan, not a cycle.
                        None => break,
                    }
                }
                verified.extend(path);
                Ok(())
            })
        })
    }

    /// States whose `parent_id` names a missing state.
    ///
    /// Always empty for stores written only through this crate.
    pub fn orphans<R: Repository>(repo: &R) -> Result<Vec<StateNode>, SimtreeError> {
        repo.read(|txn| {
            let mut orphans = Vec::new();
            for_each_state(txn, |node| {
                if let Some(parent) = node.parent_id
                    && txn.state(parent)?.is_none()
                {
                    orphans.push(node.clone());
                }
                Ok(())
            })?;
            Ok(orphans)
        })
    }
}

/// Visit every state in id order, one page at a time.
fn for_each_state<T, F>(txn: &T, mut visit: F) -> Result<(), SimtreeError>
where
    T: ReadTxn + ?Sized,
    F: FnMut(&StateNode) -> Result<(), SimtreeError>,
{
    let mut next = StateId(0);
    loop {
        let page = txn.states_from(next, PAGE_SIZE)?;
        for node in &page {
            visit(node)?;
        }
        match page.last() {
            Some(last) if page.len() == PAGE_SIZE => next = StateId(last.id.0.saturating_add(1)),
            _ => return Ok(()),
        }
    }
}
