//! Queue rotation policy
//!
//! Each intent is expressed as primitive edits against a [`Transaction`], so
//! the caller decides how intents are grouped into commits. Reads happen
//! inside the transaction, which makes every decision here re-validated
//! against the latest merged state.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::clock::elapsed_secs;
use crate::document::{InProgress, PersonRecord, SeqId};
use crate::error::{Error, Result};
use crate::projection::project;
use crate::transaction::Transaction;

/// Longest accepted name, in bytes
pub const MAX_NAME_LEN: usize = 256;

/// Normalize a user-entered name
pub fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidOperation("Name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidOperation(format!(
            "Name is too long: {} bytes (max {})",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Add a person and queue them.
///
/// Returns `false` if the person already exists.
pub fn add(tx: &mut Transaction, name: &str) -> Result<bool> {
    let name = normalize_name(name)?;
    if tx.person(&name).is_some() {
        return Ok(false);
    }

    tx.set_person(&PersonRecord::new(name.clone()))?;
    if !tx.contains(SeqId::OnDeck, &name) {
        tx.push(SeqId::OnDeck, &name)?;
    }
    Ok(true)
}

/// Remove a person everywhere they are referenced.
///
/// A deleted speaker is not replaced.
pub fn delete(tx: &mut Transaction, name: &str) -> Result<bool> {
    if tx.person(name).is_none() {
        return Ok(false);
    }

    tx.remove_all(SeqId::OnDeck, name)?;
    tx.remove_all(SeqId::Done, name)?;
    if tx.in_progress().map(|ip| ip.name == name).unwrap_or(false) {
        tx.set_in_progress(None)?;
    }
    tx.delete_person(name)?;
    Ok(true)
}

/// Whether the person is speaking or has spoken this round
pub fn is_locked(tx: &Transaction, name: &str) -> bool {
    tx.in_progress().map(|ip| ip.name == name).unwrap_or(false) || tx.contains(SeqId::Done, name)
}

/// Flip a person's active flag, queueing or unqueueing them.
///
/// Returns `false` without changes if the person is missing or locked.
pub fn toggle_active(tx: &mut Transaction, name: &str) -> Result<bool> {
    let Some(person) = tx.person(name) else {
        return Ok(false);
    };
    if is_locked(tx, name) {
        debug!(name, "Ignoring toggle of locked person");
        return Ok(false);
    }

    let activate = !person.active;
    tx.set_active(name, activate)?;
    if activate {
        if !tx.contains(SeqId::OnDeck, name) {
            tx.push(SeqId::OnDeck, name)?;
        }
    } else {
        tx.remove_all(SeqId::OnDeck, name)?;
    }
    Ok(true)
}

fn is_eligible(tx: &Transaction, name: &str) -> bool {
    tx.person(name).map(|p| p.active).unwrap_or(false) && !tx.contains(SeqId::Done, name)
}

/// Finish the current speaker and start the next eligible one.
///
/// Returns the new speaker, or `None` when the queue ran out.
pub fn advance(tx: &mut Transaction) -> Result<Option<String>> {
    let now = tx.now();

    if let Some(current) = tx.in_progress() {
        if let Some(person) = tx.person(&current.name) {
            let spoken = elapsed_secs(current.start, now);
            tx.set_time(&current.name, person.time.saturating_add(spoken))?;
            if !tx.contains(SeqId::Done, &current.name) {
                tx.push(SeqId::Done, &current.name)?;
            }
        }
    }

    while let Some(name) = tx.sequence(SeqId::OnDeck).into_iter().next() {
        tx.delete_range(SeqId::OnDeck, 0, 1)?;
        if !is_eligible(tx, &name) {
            debug!(name = %name, "Skipping ineligible queue entry");
            continue;
        }

        tx.remove_all(SeqId::OnDeck, &name)?;
        tx.set_in_progress(Some(InProgress {
            name: name.clone(),
            start: now,
        }))?;
        return Ok(Some(name));
    }

    if tx.in_progress().is_some() {
        tx.set_in_progress(None)?;
    }
    Ok(None)
}

/// The queue as the projection shows it, with the raw position of each entry.
///
/// A merge can leave duplicates, inactive or deleted people, and names that
/// already spoke in the raw sequence. Only the first occurrence of each name
/// the projection keeps is listed.
fn visible_queue(tx: &Transaction) -> Vec<(usize, String)> {
    let shown: HashSet<String> = project(tx.document(), tx.now()).on_deck.into_iter().collect();
    let mut listed = HashSet::new();
    tx.sequence(SeqId::OnDeck)
        .into_iter()
        .enumerate()
        .filter(|(_, name)| shown.contains(name) && listed.insert(name.clone()))
        .collect()
}

/// Move the queue entry shown at `from` so it ends up shown at `to`
pub fn reorder(tx: &mut Transaction, from: usize, to: usize) -> Result<()> {
    let queue = visible_queue(tx);
    if from >= queue.len() || to >= queue.len() {
        return Err(Error::Structural(format!(
            "Cannot move {} to {} in a queue of {}",
            from,
            to,
            queue.len()
        )));
    }
    if from == to {
        return Ok(());
    }

    let name = queue[from].1.clone();
    tx.remove_all(SeqId::OnDeck, &name)?;

    // Land right before whatever is now shown at `to`, or at the end
    let index = match visible_queue(tx).get(to) {
        Some((index, _)) => *index,
        None => tx.len(SeqId::OnDeck),
    };
    tx.insert(SeqId::OnDeck, index, &name)
}

/// Replace the queue with a permutation of what is shown
pub fn replace_order(tx: &mut Transaction, order: &[String]) -> Result<()> {
    let mut expected: Vec<String> = visible_queue(tx).into_iter().map(|(_, name)| name).collect();
    let mut proposed = order.to_vec();
    expected.sort();
    proposed.sort();
    if expected != proposed {
        return Err(Error::InvalidOperation(
            "New order must contain exactly the queued names".to_string(),
        ));
    }

    if tx.sequence(SeqId::OnDeck).as_slice() == order {
        return Ok(());
    }
    // Rewrites every raw entry, hidden ones included
    tx.replace(SeqId::OnDeck, order)
}

pub fn shuffle(tx: &mut Transaction, rng: &mut impl Rng) -> Result<()> {
    let mut order: Vec<String> = visible_queue(tx).into_iter().map(|(_, name)| name).collect();
    order.shuffle(rng);
    replace_order(tx, &order)
}

/// Start a new round: everyone active queued by name, all times zeroed
pub fn reset(tx: &mut Transaction) -> Result<()> {
    if tx.in_progress().is_some() {
        tx.set_in_progress(None)?;
    }

    let done = tx.len(SeqId::Done);
    tx.delete_range(SeqId::Done, 0, done)?;

    let people = tx.people();
    for person in &people {
        if person.time != 0 {
            tx.set_time(&person.name, 0)?;
        }
    }

    let queue: Vec<String> = people
        .into_iter()
        .filter(|p| p.active)
        .map(|p| p.name)
        .collect();
    if tx.sequence(SeqId::OnDeck) != queue {
        tx.replace(SeqId::OnDeck, &queue)?;
    }
    Ok(())
}
