//! Line-based console front-end
//!
//! Reads one command per line from stdin, applies it to the replica and
//! prints the resulting view. Remote changes are printed as they land.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use huddle_core::{format_time, lock, ProjectionLayer, SharedReplica, TimerState, ViewState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::AppResult;

const HELP: &str = "\
Commands:
  add NAME        add someone to the room
  delete NAME     remove someone entirely
  toggle NAME     mark someone present or away
  next            finish the current speaker and start the next
  reset           start a new round
  shuffle         shuffle who is on deck
  move FROM TO    move an on-deck entry (positions as listed)
  order A,B,C     set the on-deck order
  show            print the current view
  quit            leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(String),
    Delete(String),
    Toggle(String),
    Next,
    Reset,
    Shuffle,
    /// Zero-based positions in the on-deck list
    Move { from: usize, to: usize },
    Order(Vec<String>),
    Show,
    Help,
    Quit,
}

/// Parse one input line; blank lines yield `None`
pub fn parse_line(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let name = |usage: &str| {
        if rest.is_empty() {
            Err(format!("usage: {}", usage))
        } else {
            Ok(rest.to_string())
        }
    };

    let command = match verb.to_lowercase().as_str() {
        "add" => Command::Add(name("add NAME")?),
        "delete" | "rm" => Command::Delete(name("delete NAME")?),
        "toggle" => Command::Toggle(name("toggle NAME")?),
        "next" | "n" => Command::Next,
        "reset" => Command::Reset,
        "shuffle" => Command::Shuffle,
        "move" | "mv" => {
            let positions: Vec<&str> = rest.split_whitespace().collect();
            match positions.as_slice() {
                [from, to] => Command::Move {
                    from: position(from)?,
                    to: position(to)?,
                },
                _ => return Err("usage: move FROM TO".into()),
            }
        }
        "order" => {
            let names: Vec<String> = rest
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            Command::Order(names)
        }
        "show" | "ls" => Command::Show,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command '{}', try 'help'", other)),
    };

    Ok(Some(command))
}

/// One-based position as listed, to a zero-based index
fn position(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n - 1),
        _ => Err(format!("'{}' is not a position", s)),
    }
}

/// Apply a mutating command; returns a line to show the user
pub fn execute(replica: &SharedReplica, command: &Command) -> huddle_core::Result<Option<String>> {
    let mut r = lock(replica);
    let message = match command {
        Command::Add(name) => {
            if r.add(name)? {
                format!("Added {}", name)
            } else {
                format!("{} is already here", name)
            }
        }
        Command::Delete(name) => {
            if r.delete(name)? {
                format!("Removed {}", name)
            } else {
                format!("No one named {}", name)
            }
        }
        Command::Toggle(name) => {
            if r.toggle_active(name)? {
                format!("Toggled {}", name)
            } else {
                format!("{} can't be toggled right now", name)
            }
        }
        Command::Next => match r.advance()? {
            Some(name) => format!("Now speaking: {}", name),
            None => "Nobody left on deck".to_string(),
        },
        Command::Reset => {
            r.reset()?;
            "Round reset".to_string()
        }
        Command::Shuffle => {
            r.shuffle()?;
            "Shuffled".to_string()
        }
        Command::Move { from, to } => {
            r.reorder(*from, *to)?;
            "Moved".to_string()
        }
        Command::Order(names) => {
            r.replace_order(names)?;
            "Order updated".to_string()
        }
        Command::Show | Command::Help | Command::Quit => return Ok(None),
    };
    Ok(Some(message))
}

/// Render a view as plain text
pub fn render(view: &ViewState) -> String {
    let mut out = String::new();

    let _ = write!(out, "[{}]", view.timer_state);
    if let Some(speaker) = &view.in_progress {
        let _ = write!(out, " speaking: {} {}", speaker.name, format_time(speaker.time));
    }
    out.push('\n');

    if !view.on_deck.is_empty() {
        out.push_str("On deck:\n");
        for (i, name) in view.on_deck.iter().enumerate() {
            let _ = writeln!(out, "  {}. {}", i + 1, name);
        }
    }

    if !view.done.is_empty() {
        out.push_str("Done:\n");
        for speaker in &view.done {
            let _ = writeln!(out, "  {} {}", speaker.name, format_time(speaker.time));
        }
    }

    let roster: Vec<String> = view
        .people
        .iter()
        .map(|p| {
            if p.active {
                p.name.clone()
            } else {
                format!("({})", p.name)
            }
        })
        .collect();
    let _ = writeln!(out, "People: {}", roster.join(", "));

    let totals = &view.totals;
    let _ = write!(
        out,
        "Total {} | {}/{} | avg {}",
        totals.total_time.map(format_time).unwrap_or_else(|| "--:--".into()),
        totals.completed,
        totals.total,
        totals.average.map(format_time).unwrap_or_else(|| "--:--".into()),
    );

    out
}

/// Whether two views differ only in running time
fn same_layout(a: &ViewState, b: &ViewState) -> bool {
    let roster = |v: &ViewState| -> Vec<(String, bool)> {
        v.people.iter().map(|p| (p.name.clone(), p.active)).collect()
    };
    let done = |v: &ViewState| -> Vec<String> { v.done.iter().map(|s| s.name.clone()).collect() };

    a.timer_state == b.timer_state
        && a.on_deck == b.on_deck
        && a.in_progress.as_ref().map(|s| &s.name) == b.in_progress.as_ref().map(|s| &s.name)
        && done(a) == done(b)
        && roster(a) == roster(b)
}

/// Refresh the projection every second while someone is speaking
pub fn spawn_timer(replica: SharedReplica, projection: Arc<ProjectionLayer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            if projection.current().timer_state == TimerState::Playing {
                projection.refresh(lock(&replica).document());
            }
        }
    })
}

/// Run the console until `quit` or end of input
pub async fn run(replica: SharedReplica, projection: Arc<ProjectionLayer>) -> AppResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut views = projection.subscribe();

    let mut shown = views.borrow_and_update().clone();
    println!("{}", render(&shown));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("End of input");
                    break;
                };

                let command = match parse_line(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };

                match command {
                    Command::Quit => break,
                    Command::Help => println!("{}", HELP),
                    Command::Show => {
                        shown = views.borrow_and_update().clone();
                        println!("{}", render(&shown));
                    }
                    command => {
                        match execute(&replica, &command) {
                            Ok(Some(message)) => println!("{}", message),
                            Ok(None) => {}
                            Err(e) => println!("Error: {}", e),
                        }
                        shown = views.borrow_and_update().clone();
                        println!("{}", render(&shown));
                    }
                }
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                if !same_layout(&shown, &view) {
                    println!("{}", render(&view));
                    shown = view;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{Replica, ReplicaId, RoomId, SystemClock};
    use std::sync::Mutex;

    fn replica() -> SharedReplica {
        Arc::new(Mutex::new(Replica::new(
            ReplicaId::new_v4(),
            RoomId::from("standup"),
            Arc::new(SystemClock),
        )))
    }

    fn run_line(replica: &SharedReplica, line: &str) -> Option<String> {
        let command = parse_line(line).unwrap().unwrap();
        execute(replica, &command).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("  ").unwrap(), None);
        assert_eq!(
            parse_line("add Ana Lee").unwrap(),
            Some(Command::Add("Ana Lee".into()))
        );
        assert_eq!(parse_line("NEXT").unwrap(), Some(Command::Next));
        assert_eq!(
            parse_line("move 3 1").unwrap(),
            Some(Command::Move { from: 2, to: 0 })
        );
        assert_eq!(
            parse_line("order Bo, Ana ,Cy").unwrap(),
            Some(Command::Order(vec!["Bo".into(), "Ana".into(), "Cy".into()]))
        );
        assert_eq!(parse_line("q").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_line("add").is_err());
        assert!(parse_line("move 0 1").is_err());
        assert!(parse_line("move 1").is_err());
        assert!(parse_line("dance").is_err());
    }

    #[test]
    fn test_commands_drive_the_round() {
        let replica = replica();
        run_line(&replica, "add Ana");
        run_line(&replica, "add Bo");
        assert_eq!(
            run_line(&replica, "add Ana"),
            Some("Ana is already here".to_string())
        );

        run_line(&replica, "move 2 1");
        assert_eq!(
            lock(&replica).project().on_deck,
            vec!["Bo".to_string(), "Ana".to_string()]
        );

        assert_eq!(
            run_line(&replica, "next"),
            Some("Now speaking: Bo".to_string())
        );
        assert_eq!(
            run_line(&replica, "toggle Bo"),
            Some("Bo can't be toggled right now".to_string())
        );

        run_line(&replica, "next");
        assert_eq!(
            run_line(&replica, "next"),
            Some("Nobody left on deck".to_string())
        );
        assert_eq!(lock(&replica).project().timer_state, TimerState::Done);
    }

    #[test]
    fn test_invalid_order_reported() {
        let replica = replica();
        run_line(&replica, "add Ana");
        let command = parse_line("order Ana,Zed").unwrap().unwrap();
        assert!(execute(&replica, &command).is_err());
    }

    #[test]
    fn test_render_lists_queue() {
        let replica = replica();
        run_line(&replica, "add Ana");
        run_line(&replica, "add Bo");
        run_line(&replica, "toggle Bo");

        let text = render(&lock(&replica).project());
        assert!(text.starts_with("[Ready]"));
        assert!(text.contains("1. Ana"));
        assert!(text.contains("People: Ana, (Bo)"));
        assert!(text.contains("avg --:--"));
    }

    #[test]
    fn test_layout_ignores_running_time() {
        let replica = replica();
        run_line(&replica, "add Ana");
        run_line(&replica, "next");

        let before = lock(&replica).project();
        let mut later = before.clone();
        if let Some(speaker) = later.in_progress.as_mut() {
            speaker.time += 5;
        }
        assert!(same_layout(&before, &later));

        run_line(&replica, "reset");
        assert!(!same_layout(&before, &lock(&replica).project()));
    }
}
