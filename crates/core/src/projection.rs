//! Render-ready projection of a room document
//!
//! [`project`] is a pure function of the document and the current wall time.
//! It also hides anything a concurrent merge can leave behind: names that no
//! longer resolve to a person, duplicates, and names that show up in more
//! than one of on-deck, in-progress and done.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::clock::{elapsed_secs, TimeSource};
use crate::document::{Document, Target};
use crate::invariants::assert_view_invariants;
use crate::replica::Replica;

/// Phase of the rotation as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerState {
    /// Nobody queued and nobody has spoken
    Waiting,
    /// People queued, nobody speaking
    Ready,
    /// Someone is speaking
    Playing,
    /// Everyone has spoken
    Done,
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimerState::Waiting => "Waiting",
            TimerState::Ready => "Ready",
            TimerState::Playing => "Playing",
            TimerState::Done => "Done",
        };
        write!(f, "{}", label)
    }
}

/// One row of the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub active: bool,
    pub time: u64,
    /// Speaking or already spoken this round; toggling is disabled
    pub locked: bool,
}

/// A speaker with a resolved time in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaker {
    pub name: String,
    pub time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Done times plus the running timer; `None` before anyone has started
    pub total_time: Option<u64>,
    /// Done plus in-progress count
    pub completed: usize,
    /// Completed plus on-deck count
    pub total: usize,
    pub average: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    pub people: Vec<RosterEntry>,
    pub on_deck: Vec<String>,
    pub in_progress: Option<Speaker>,
    pub done: Vec<Speaker>,
    pub timer_state: TimerState,
    pub totals: Totals,
}

impl Default for ViewState {
    fn default() -> Self {
        project(&Document::new(), Utc::now())
    }
}

/// Build the view for `document` as of `now`
pub fn project(document: &Document, now: DateTime<Utc>) -> ViewState {
    let in_progress = document
        .in_progress()
        .filter(|ip| document.person(&ip.name).map(|p| p.active).unwrap_or(false))
        .map(|ip| Speaker {
            name: ip.name.clone(),
            time: elapsed_secs(ip.start, now),
        });

    let mut seen = HashSet::new();
    let done: Vec<Speaker> = document
        .sequence(crate::document::SeqId::Done)
        .iter()
        .filter(|name| in_progress.as_ref().map(|s| &s.name) != Some(*name))
        .filter_map(|name| document.person(name))
        .filter(|p| seen.insert(p.name.clone()))
        .map(|p| Speaker {
            name: p.name,
            time: p.time,
        })
        .collect();

    if let Some(speaker) = &in_progress {
        seen.insert(speaker.name.clone());
    }
    let on_deck: Vec<String> = document
        .sequence(crate::document::SeqId::OnDeck)
        .iter()
        .filter(|name| document.person(name).map(|p| p.active).unwrap_or(false))
        .filter(|name| seen.insert((*name).clone()))
        .cloned()
        .collect();

    let locked: HashSet<&str> = done
        .iter()
        .chain(in_progress.iter())
        .map(|s| s.name.as_str())
        .collect();
    let mut people: Vec<RosterEntry> = document
        .people()
        .map(|p| RosterEntry {
            locked: locked.contains(p.name.as_str()),
            name: p.name,
            active: p.active,
            time: p.time,
        })
        .collect();
    people.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });

    let timer_state = if in_progress.is_some() {
        TimerState::Playing
    } else if on_deck.is_empty() && done.is_empty() {
        TimerState::Waiting
    } else if on_deck.is_empty() {
        TimerState::Done
    } else {
        TimerState::Ready
    };

    let totals = totals(&on_deck, in_progress.as_ref(), &done);

    let view = ViewState {
        people,
        on_deck,
        in_progress,
        done,
        timer_state,
        totals,
    };
    assert_view_invariants(&view);
    view
}

fn totals(on_deck: &[String], in_progress: Option<&Speaker>, done: &[Speaker]) -> Totals {
    let completed = done.len() + usize::from(in_progress.is_some());
    let total = completed + on_deck.len();

    let total_time = if in_progress.is_none() && done.is_empty() {
        None
    } else {
        let done_time: u64 = done.iter().map(|s| s.time).sum();
        Some(done_time.saturating_add(in_progress.map(|s| s.time).unwrap_or(0)))
    };

    let average = match (total_time, completed) {
        (Some(time), n) if n > 0 => Some(time / n as u64),
        _ => None,
    };

    Totals {
        total_time,
        completed,
        total,
        average,
    }
}

/// Format seconds as `MM:SS`.
///
/// Minutes are not wrapped into hours.
pub fn format_time(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Keeps the latest [`ViewState`] published on a watch channel
pub struct ProjectionLayer {
    tx: watch::Sender<ViewState>,
    time: Arc<dyn TimeSource>,
}

impl ProjectionLayer {
    pub fn new(document: &Document, time: Arc<dyn TimeSource>) -> Self {
        let (tx, _) = watch::channel(project(document, time.now()));
        Self { tx, time }
    }

    /// Create a layer for `replica` that refreshes on every committed update
    pub fn attach(replica: &mut Replica) -> Arc<Self> {
        let layer = Arc::new(Self::new(replica.document(), replica.time_source()));
        let observer = layer.clone();
        replica.observe(Target::Any, move |_, document| {
            observer.refresh(document);
        });
        layer
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ViewState {
        self.tx.borrow().clone()
    }

    /// Recompute the view; subscribers are woken only if it changed
    pub fn refresh(&self, document: &Document) -> bool {
        let view = project(document, self.time.now());
        self.tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::document::{InProgress, SeqId};
    use crate::room::RoomId;
    use crate::transaction::Transaction;
    use chrono::Duration;
    use uuid::Uuid;

    fn build(now: DateTime<Utc>, f: impl FnOnce(&mut Transaction)) -> Document {
        let mut tx = Transaction::new(Uuid::from_u128(1), 0, Document::new(), now);
        f(&mut tx);
        tx.finish().0
    }

    fn person(tx: &mut Transaction, name: &str, active: bool, time: u64) {
        tx.set_person(&crate::document::PersonRecord {
            name: name.to_string(),
            active,
            time,
        })
        .unwrap();
    }

    #[test]
    fn test_empty_document_is_waiting() {
        let view = project(&Document::new(), Utc::now());
        assert_eq!(view.timer_state, TimerState::Waiting);
        assert_eq!(view.totals, Totals::default());
    }

    #[test]
    fn test_playing_view_resolves_times() {
        let start = Utc::now();
        let doc = build(start, |tx| {
            person(tx, "Andrew", true, 30);
            person(tx, "Brian", true, 0);
            person(tx, "Greg", true, 0);
            tx.push(SeqId::Done, "Andrew").unwrap();
            tx.push(SeqId::OnDeck, "Greg").unwrap();
            tx.set_in_progress(Some(InProgress {
                name: "Brian".into(),
                start,
            }))
            .unwrap();
        });

        let view = project(&doc, start + Duration::seconds(15));
        assert_eq!(view.timer_state, TimerState::Playing);
        assert_eq!(
            view.in_progress,
            Some(Speaker {
                name: "Brian".into(),
                time: 15
            })
        );
        assert_eq!(view.done[0].time, 30);
        assert_eq!(view.totals.total_time, Some(45));
        assert_eq!(view.totals.completed, 2);
        assert_eq!(view.totals.total, 3);
        assert_eq!(view.totals.average, Some(22));

        let locked: Vec<_> = view
            .people
            .iter()
            .filter(|p| p.locked)
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(locked, vec!["Andrew", "Brian"]);
    }

    #[test]
    fn test_dangling_and_duplicate_names_hidden() {
        let doc = build(Utc::now(), |tx| {
            person(tx, "Andrew", true, 0);
            person(tx, "Brian", false, 0);
            tx.push(SeqId::OnDeck, "Andrew").unwrap();
            tx.push(SeqId::OnDeck, "Andrew").unwrap();
            tx.push(SeqId::OnDeck, "Brian").unwrap();
            tx.push(SeqId::OnDeck, "Ghost").unwrap();
            tx.push(SeqId::Done, "Ghost").unwrap();
        });

        let view = project(&doc, Utc::now());
        assert_eq!(view.on_deck, vec!["Andrew"]);
        assert!(view.done.is_empty());
        assert_eq!(view.timer_state, TimerState::Ready);
    }

    #[test]
    fn test_name_in_done_is_dropped_from_on_deck() {
        let doc = build(Utc::now(), |tx| {
            person(tx, "Greg", true, 12);
            tx.push(SeqId::Done, "Greg").unwrap();
            tx.push(SeqId::OnDeck, "Greg").unwrap();
        });

        let view = project(&doc, Utc::now());
        assert!(view.on_deck.is_empty());
        assert_eq!(view.timer_state, TimerState::Done);
        assert_eq!(view.totals.average, Some(12));
    }

    #[test]
    fn test_roster_sorted_case_insensitively() {
        let doc = build(Utc::now(), |tx| {
            person(tx, "brian", true, 0);
            person(tx, "Andrew", true, 0);
            person(tx, "Carl", true, 0);
        });
        let names: Vec<_> = project(&doc, Utc::now())
            .people
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Andrew", "brian", "Carl"]);
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0), "00:00");
        assert_eq!(format_time(65), "01:05");
        assert_eq!(format_time(3725), "62:05");
    }

    #[test]
    fn test_layer_publishes_only_changes() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let layer = ProjectionLayer::new(&Document::new(), clock.clone());
        let rx = layer.subscribe();

        assert!(!layer.refresh(&Document::new()));

        let doc = build(start, |tx| {
            person(tx, "Andrew", true, 0);
            tx.set_in_progress(Some(InProgress {
                name: "Andrew".into(),
                start,
            }))
            .unwrap();
        });
        assert!(layer.refresh(&doc));
        assert!(rx.has_changed().unwrap());

        // Same document, later time: the running timer moves
        clock.advance(3);
        assert!(layer.refresh(&doc));
        assert_eq!(layer.current().in_progress.unwrap().time, 3);
    }

    #[test]
    fn test_attached_layer_follows_commits() {
        let time = Arc::new(SystemClock);
        let mut replica = Replica::new(Uuid::from_u128(1), RoomId::default(), time);
        let layer = ProjectionLayer::attach(&mut replica);
        let rx = layer.subscribe();

        replica.add("Andrew").unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(layer.current().on_deck, vec!["Andrew"]);
        assert_eq!(layer.current().timer_state, TimerState::Ready);
    }
}
