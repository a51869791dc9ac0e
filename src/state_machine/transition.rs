//! Transition path computation: the lowest-common-ancestor walk that decides
//! which states exit (leaf-first) and which enter (root-first) for a move
//! from one state to another, including self/ancestor transitions that
//! re-enter a whole subtree.

use std::collections::HashMap;

use super::state::{StateConfig, StateKind};

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("an on_async chain targets a state that isn't configured")]
    InvalidChain,
    #[error("duplicate state configuration")]
    DuplicateState,
    #[error("action '{0}' referenced by a state is not configured on the workflow")]
    MissingAction(String),
    #[error("category '{0}' referenced by a state is not defined on the table")]
    MissingCategory(String),
    #[error("restoration diverged from persisted history")]
    RestoreMismatch,
}

/// Root-first chain of ancestors of `state`, inclusive.
pub fn ancestor_chain<S: StateKind>(states: &HashMap<S, StateConfig<S>>, state: &S) -> Vec<S> {
    let mut chain = vec![state.clone()];
    let mut cursor = state.clone();
    while let Some(parent) = states.get(&cursor).and_then(|c| c.parent.clone()) {
        chain.push(parent.clone());
        cursor = parent;
    }
    chain.reverse();
    chain
}

/// Compute the exit path (leaf-first) and enter path (root-first) for a
/// transition from `from` to `to`. When `to` is `from` itself or an ancestor
/// of it, the whole subtree under (and including) `to` is re-entered: every
/// state from `from` up through `to` exits, then `to` and nothing else
/// enters (its own `on_enter` chain is responsible for descending again).
pub fn compute_path<S: StateKind>(
    states: &HashMap<S, StateConfig<S>>,
    from: &S,
    to: &S,
) -> (Vec<S>, Vec<S>) {
    let from_chain = ancestor_chain(states, from);
    let to_chain = ancestor_chain(states, to);

    if from_chain.contains(to) {
        let exit: Vec<S> = from_chain.iter().rev().cloned().collect();
        return (exit, vec![to.clone()]);
    }

    let lca_len = from_chain.iter().zip(to_chain.iter()).take_while(|(a, b)| a == b).count();
    let exit: Vec<S> = from_chain[lca_len..].iter().rev().cloned().collect();
    let enter: Vec<S> = to_chain[lca_len..].to_vec();
    (exit, enter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StateBuilder;

    fn table() -> HashMap<&'static str, StateConfig<&'static str>> {
        // Root
        //  +-- A
        //  |    +-- A1
        //  |    +-- A2
        //  +-- B
        let mut table = HashMap::new();
        table.insert("Root", StateBuilder::new().build());
        table.insert("A", StateBuilder::new().substate_of("Root").build());
        table.insert("A1", StateBuilder::new().substate_of("A").build());
        table.insert("A2", StateBuilder::new().substate_of("A").build());
        table.insert("B", StateBuilder::new().substate_of("Root").build());
        table
    }

    #[test]
    fn sibling_transition_shares_common_parent() {
        let table = table();
        let (exit, enter) = compute_path(&table, &"A1", &"A2");
        assert_eq!(exit, vec!["A1"]);
        assert_eq!(enter, vec!["A2"]);
    }

    #[test]
    fn cross_branch_transition_exits_and_enters_through_root() {
        let table = table();
        let (exit, enter) = compute_path(&table, &"A1", &"B");
        assert_eq!(exit, vec!["A1", "A"]);
        assert_eq!(enter, vec!["B"]);
    }

    #[test]
    fn self_transition_reenters_whole_subtree() {
        let table = table();
        let (exit, enter) = compute_path(&table, &"A1", &"A");
        assert_eq!(exit, vec!["A1", "A"]);
        assert_eq!(enter, vec!["A"]);
    }

    #[test]
    fn transition_to_same_state_reenters_it() {
        let table = table();
        let (exit, enter) = compute_path(&table, &"A1", &"A1");
        assert_eq!(exit, vec!["A1"]);
        assert_eq!(enter, vec!["A1"]);
    }
}
