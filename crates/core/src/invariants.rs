//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible projected states during
//! development. These checks are compiled out in release builds.
//!
//! The merged document itself may transiently break the queue rules after
//! concurrent edits (a name queued twice, a deleted person still referenced).
//! [`document_violations`] reports those; the projection hides them.

use std::collections::HashSet;

use crate::document::{Document, SeqId};
use crate::projection::{TimerState, ViewState};

/// Validate that a projected view obeys the queue rules
pub fn assert_view_invariants(view: &ViewState) {
    // A name appears in at most one of on-deck, in-progress and done
    let mut seen = HashSet::new();
    let names = view
        .on_deck
        .iter()
        .chain(view.in_progress.iter().map(|s| &s.name))
        .chain(view.done.iter().map(|s| &s.name));
    for name in names {
        debug_assert!(seen.insert(name), "Name '{}' appears twice in the view", name);
    }

    // Everything shown resolves to an active roster entry
    for name in view.on_deck.iter().chain(view.in_progress.iter().map(|s| &s.name)) {
        debug_assert!(
            view.people.iter().any(|p| &p.name == name && p.active),
            "Queued name '{}' is not an active person",
            name
        );
    }

    debug_assert!(
        (view.timer_state == TimerState::Playing) == view.in_progress.is_some(),
        "Timer state {:?} disagrees with in-progress {:?}",
        view.timer_state,
        view.in_progress
    );

    debug_assert!(
        view.totals.completed == view.done.len() + usize::from(view.in_progress.is_some()),
        "Completed count {} is out of step with the view",
        view.totals.completed
    );
}

/// Describe every way the raw document breaks the queue rules
pub fn document_violations(document: &Document) -> Vec<String> {
    let mut violations = Vec::new();
    let on_deck = document.sequence(SeqId::OnDeck).to_vec();
    let done = document.sequence(SeqId::Done).to_vec();
    let in_progress = document.in_progress().map(|ip| ip.name.clone());

    let mut seen = HashSet::new();
    for name in on_deck.iter().chain(in_progress.iter()).chain(done.iter()) {
        if !seen.insert(name.as_str()) {
            violations.push(format!("'{}' is referenced more than once", name));
        }
        match document.person(name) {
            None => violations.push(format!("'{}' does not resolve to a person", name)),
            Some(p) if !p.active && !done.contains(name) => {
                violations.push(format!("'{}' is queued but inactive", name))
            }
            Some(_) => {}
        }
    }

    violations
}
