//! Day-scoped identifiers of the form `YYMMDD-NNN`.
//!
//! Each kind (task, run, notification) has its own daily counter. Once a
//! kind passes 999 ids in a day the generator falls back to a
//! second-resolution timestamp (`YYMMDD_HHMMSS`), suffixed `-02`, `-03`, ...
//! on collision.

use std::collections::{HashMap, HashSet};
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

pub const MAX_DAILY_SEQ: u32 = 999;

static SHORT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{6})-(\d{3})$").expect("valid regex"));
static FALLBACK_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{6}_\d{6}(-\d+)?$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Task,
    Run,
    Notification,
}

#[derive(Debug, Default)]
struct IdState {
    counters: HashMap<(IdKind, NaiveDate), u32>,
    fallbacks: HashMap<IdKind, HashSet<String>>,
}

#[derive(Debug, Default)]
pub struct IdGenerator {
    state: Mutex<IdState>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an id that already exists so later ids never collide with it.
    pub fn observe(&self, kind: IdKind, id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(caps) = SHORT_ID.captures(id) {
            let Ok(day) = NaiveDate::parse_from_str(&caps[1], "%y%m%d") else {
                return;
            };
            let Ok(seq) = caps[2].parse::<u32>() else {
                return;
            };
            let counter = state.counters.entry((kind, day)).or_insert(0);
            *counter = (*counter).max(seq);
        } else if FALLBACK_ID.is_match(id) {
            state.fallbacks.entry(kind).or_default().insert(id.to_string());
        }
    }

    pub fn next_id(&self, kind: IdKind, at: DateTime<Utc>) -> String {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let counter = state.counters.entry((kind, at.date_naive())).or_insert(0);
        if *counter < MAX_DAILY_SEQ {
            *counter += 1;
            return format!("{}-{:03}", at.format("%y%m%d"), counter);
        }

        let base = at.format("%y%m%d_%H%M%S").to_string();
        let issued = state.fallbacks.entry(kind).or_default();
        let mut candidate = base.clone();
        let mut suffix = 1;
        while issued.contains(&candidate) {
            suffix += 1;
            candidate = format!("{base}-{suffix:02}");
        }
        issued.insert(candidate.clone());
        candidate
    }
}
