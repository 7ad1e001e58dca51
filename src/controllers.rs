use anyhow::{ensure, Result};
use chrono::{Timelike, Utc};
use rand::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::clock::{self, Clock};
use crate::markers::MarkerStore;
use crate::models::{Phase, Question, VisitorIdentity, Winner, WindowConfig};

/// Classification outcome for one page view, plus everything the render
/// layer needs to draw it. The question is withheld unless the window is
/// open and this identity has not played yet.
#[derive(Clone, Debug)]
pub struct DayState {
    pub phase: Phase,
    pub day_index: i64,
    /// 1-based label value, clamped to the run: "Day N of M".
    pub day_number: u32,
    pub winner: Option<Winner>,
    pub question: Option<Question>,
    pub already_played: bool,
    /// Window closed with zero entries; nothing was persisted.
    pub no_entries: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnswerOutcome {
    /// Outside the open window, or before/after the run.
    NotOpen,
    /// A marker already exists for this identity; no attempt recorded.
    AlreadyPlayed,
    Scored {
        correct: bool,
        explain: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum EntryOutcome {
    /// Name was empty after trimming; nothing was sent to the backend.
    EmptyName,
    NotOpen,
    Recorded,
    /// Backend write failed; the caller shows a retry-later notice.
    WriteFailed,
}

/// Pure window classification. Evaluated in order, first match wins.
pub fn classify(day_index: i64, hour: u32, winner_exists: bool, window: &WindowConfig) -> Phase {
    if day_index < 0 {
        Phase::NotStarted
    } else if day_index >= i64::from(window.total_days) {
        Phase::Finished
    } else if winner_exists {
        Phase::WinnerAnnounced
    } else if !clock::in_window(hour, window.open_hour, window.close_hour) {
        if hour < window.open_hour {
            Phase::Waiting
        } else {
            Phase::Closed
        }
    } else {
        Phase::Open
    }
}

#[derive(Clone, Debug)]
pub struct QuizController {
    window: WindowConfig,
    questions: Arc<Vec<Question>>,
    clock: Clock,
    backend: Backend,
    markers: MarkerStore,
}

impl QuizController {
    pub fn new(
        window: WindowConfig,
        questions: Vec<Question>,
        clock: Clock,
        backend: Backend,
        markers: MarkerStore,
    ) -> Result<QuizController> {
        ensure!(!questions.is_empty(), "no questions configured");
        ensure!(
            window.open_hour < window.close_hour && window.close_hour <= 24,
            "window hours out of order"
        );

        Ok(QuizController {
            window,
            questions: Arc::new(questions),
            clock,
            backend,
            markers,
        })
    }

    pub fn window(&self) -> &WindowConfig {
        &self.window
    }

    /// One classification pass, as run on every page view. Lazily draws
    /// the winner the first time anyone looks after the close hour.
    pub async fn state(&self, identity: &VisitorIdentity) -> Result<DayState> {
        let now = self.clock.now();
        let idx = clock::day_index(self.window.start_date, now);
        let hour = now.hour();
        let in_run = idx >= 0 && idx < i64::from(self.window.total_days);

        let winner = if in_run {
            self.backend.winner(idx as u32).await?
        } else {
            None
        };
        let phase = classify(idx, hour, winner.is_some(), &self.window);

        let mut state = DayState {
            phase,
            day_index: idx,
            day_number: (idx + 1).clamp(0, i64::from(self.window.total_days)) as u32,
            winner,
            question: None,
            already_played: false,
            no_entries: false,
        };

        match phase {
            Phase::Closed => match self.select_winner(idx as u32).await? {
                Some(winner) => {
                    state.phase = Phase::WinnerAnnounced;
                    state.winner = Some(winner);
                }
                None => state.no_entries = true,
            },
            Phase::Open => {
                if self.markers.any(idx as u32, identity)? {
                    state.already_played = true;
                } else {
                    state.question = Some(self.question_for(idx as u32).clone());
                }
            }
            _ => {}
        }

        Ok(state)
    }

    /// Scores the first choice activation for this identity. Both markers
    /// are recorded before the comparison, so a wrong answer still spends
    /// the day's attempt.
    pub async fn answer(&self, identity: &VisitorIdentity, choice: usize) -> Result<AnswerOutcome> {
        let now = self.clock.now();
        let idx = clock::day_index(self.window.start_date, now);
        if idx < 0 || idx >= i64::from(self.window.total_days) {
            return Ok(AnswerOutcome::NotOpen);
        }

        let winner = self.backend.winner(idx as u32).await?;
        if classify(idx, now.hour(), winner.is_some(), &self.window) != Phase::Open {
            return Ok(AnswerOutcome::NotOpen);
        }

        let day = idx as u32;
        if self.markers.any(day, identity)? {
            return Ok(AnswerOutcome::AlreadyPlayed);
        }
        self.markers.record(day, identity)?;

        let question = self.question_for(day);
        let correct = choice == question.answer_index;
        let explain = if correct {
            None
        } else {
            Some(question.explain.clone())
        };

        Ok(AnswerOutcome::Scored { correct, explain })
    }

    /// Forwards a trimmed, non-empty name to the backend. Entries are only
    /// accepted while the window is open; the close-hour draw must see a
    /// fixed entry list. Write failures are caught here; the visitor gets
    /// a generic retry-later reply and no automatic retry happens.
    pub async fn submit_entry(&self, identity: &VisitorIdentity, name: &str) -> Result<EntryOutcome> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(EntryOutcome::EmptyName);
        }

        let now = self.clock.now();
        let idx = clock::day_index(self.window.start_date, now);
        if idx < 0 || idx >= i64::from(self.window.total_days) {
            return Ok(EntryOutcome::NotOpen);
        }

        let winner = self.backend.winner(idx as u32).await?;
        if classify(idx, now.hour(), winner.is_some(), &self.window) != Phase::Open {
            return Ok(EntryOutcome::NotOpen);
        }

        match self.backend.add_entry(idx as u32, name, &identity.ip).await {
            Ok(()) => {
                info!(day = idx, name, "entry recorded");
                Ok(EntryOutcome::Recorded)
            }
            Err(err) => {
                warn!(day = idx, error = %err, "entry write failed");
                Ok(EntryOutcome::WriteFailed)
            }
        }
    }

    /// Full winner history, ascending by day index. Pure read, rendered
    /// on every load regardless of phase.
    pub async fn archive(&self) -> Result<Vec<(u32, Winner)>> {
        let mut rows = self.backend.winners_archive(self.window.total_days).await?;
        rows.sort_by_key(|(day, _winner)| *day);
        Ok(rows)
    }

    /// Discrete uniform draw over the day's entries. Zero entries means
    /// no winner record at all; the next load re-attempts. Two visitors
    /// racing past the close hour can both reach `set_winner`; the
    /// backend read wins on the next pass.
    async fn select_winner(&self, day: u32) -> Result<Option<Winner>> {
        let entries = self.backend.entries(day).await?;

        let name = {
            let mut rng = thread_rng();
            match entries.choose(&mut rng) {
                Some(entry) => entry.name.clone(),
                None => {
                    info!(day, "entries closed with no valid entries");
                    return Ok(None);
                }
            }
        };

        let winner = Winner {
            name,
            ts: Utc::now(),
        };
        self.backend.set_winner(day, &winner).await?;
        info!(day, winner = %winner.name, "winner drawn");

        Ok(Some(winner))
    }

    fn question_for(&self, day: u32) -> &Question {
        // Days past the configured list fall back to the last question.
        match self.questions.get(day as usize) {
            Some(question) => question,
            None => &self.questions[self.questions.len() - 1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalStore;
    use chrono::NaiveDate;
    use std::{collections::BTreeSet, env, fs, path::PathBuf};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!(
            "daily-draw-ctrl-{}-{:x}",
            tag,
            rand::random::<u64>()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn window() -> WindowConfig {
        WindowConfig {
            start_date: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            total_days: 24,
            tz: "Europe/London".into(),
            open_hour: 10,
            close_hour: 16,
        }
    }

    fn questions(n: usize) -> Vec<Question> {
        (0..n)
            .map(|i| Question {
                question: format!("Question {}", i + 1),
                choices: vec!["A".into(), "B".into(), "C".into(), "D".into()],
                answer_index: i % 4,
                explain: format!("Explanation {}", i + 1),
            })
            .collect()
    }

    struct Fixture {
        controller: QuizController,
        backend: Backend,
        dir: PathBuf,
        override_path: PathBuf,
    }

    /// Controller over a fresh local store, with the clock pinned through
    /// the override file so tests control the wall clock.
    fn fixture(tag: &str, date: &str, time: &str) -> Fixture {
        let dir = temp_dir(tag);
        let override_path = dir.join("override.json");
        fs::write(
            &override_path,
            format!(r#"{{"date":"{}","time":"{}"}}"#, date, time),
        )
        .unwrap();

        let clock = Clock::with_override_path(chrono_tz::Europe::London, &override_path);
        let backend = Backend::Local(LocalStore::open(dir.join("store")).unwrap());
        let markers = MarkerStore::open(dir.join("markers.json")).unwrap();
        let controller =
            QuizController::new(window(), questions(24), clock, backend.clone(), markers).unwrap();

        Fixture {
            controller,
            backend,
            dir,
            override_path,
        }
    }

    fn visitor() -> VisitorIdentity {
        VisitorIdentity::new("203.0.113.7", Some("dev-1".into()))
    }

    #[test]
    fn classification_bounds_ignore_the_hour() {
        let window = window();
        for hour in 0..24 {
            assert_eq!(classify(-1, hour, false, &window), Phase::NotStarted);
            assert_eq!(classify(-40, hour, true, &window), Phase::NotStarted);
            assert_eq!(classify(24, hour, false, &window), Phase::Finished);
            assert_eq!(classify(100, hour, true, &window), Phase::Finished);
        }
    }

    #[test]
    fn classification_order_within_the_run() {
        let window = window();
        assert_eq!(classify(3, 12, true, &window), Phase::WinnerAnnounced);
        // An existing winner wins over the hour, even mid-window.
        assert_eq!(classify(3, 9, true, &window), Phase::WinnerAnnounced);
        assert_eq!(classify(3, 9, false, &window), Phase::Waiting);
        assert_eq!(classify(3, 16, false, &window), Phase::Closed);
        assert_eq!(classify(3, 23, false, &window), Phase::Closed);
        assert_eq!(classify(3, 10, false, &window), Phase::Open);
        assert_eq!(classify(3, 15, false, &window), Phase::Open);
    }

    #[tokio::test]
    async fn before_start_is_not_started() {
        let f = fixture("notstarted", "2024-11-30", "09:00");
        let state = f.controller.state(&visitor()).await.unwrap();
        assert_eq!(state.phase, Phase::NotStarted);
        assert_eq!(state.day_index, -1);
        assert_eq!(state.day_number, 0);
        assert!(state.question.is_none());
    }

    #[tokio::test]
    async fn after_last_day_is_finished() {
        let f = fixture("finished", "2024-12-25", "12:00");
        let state = f.controller.state(&visitor()).await.unwrap();
        assert_eq!(state.phase, Phase::Finished);
        assert_eq!(state.day_index, 24);
        assert_eq!(state.day_number, 24);
    }

    #[tokio::test]
    async fn mid_window_renders_the_day_question() {
        let f = fixture("open", "2024-12-04", "12:00");
        let state = f.controller.state(&visitor()).await.unwrap();
        assert_eq!(state.phase, Phase::Open);
        assert_eq!(state.day_index, 3);
        assert_eq!(state.day_number, 4);
        let question = state.question.unwrap();
        assert_eq!(question.question, "Question 4");
        assert_eq!(question.choices.len(), 4);
        assert!(!state.already_played);
    }

    #[tokio::test]
    async fn post_close_with_no_entries_persists_nothing() {
        let f = fixture("noentries", "2024-12-04", "17:00");
        let state = f.controller.state(&visitor()).await.unwrap();
        assert_eq!(state.phase, Phase::Closed);
        assert!(state.no_entries);
        assert!(state.winner.is_none());
        assert!(f.backend.winner(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_entry_always_wins() {
        let f = fixture("alice", "2024-12-04", "17:00");
        f.backend.add_entry(3, "Alice", "203.0.113.7").await.unwrap();

        let state = f.controller.state(&visitor()).await.unwrap();
        assert_eq!(state.phase, Phase::WinnerAnnounced);
        assert_eq!(state.winner.unwrap().name, "Alice");
        assert_eq!(f.backend.winner(3).await.unwrap().unwrap().name, "Alice");
    }

    #[tokio::test]
    async fn drawn_winner_is_one_of_the_entrants() {
        let f = fixture("uniform", "2024-12-04", "16:30");
        for name in ["Alice", "Bob", "Carol"] {
            f.backend.add_entry(3, name, "203.0.113.7").await.unwrap();
        }

        let state = f.controller.state(&visitor()).await.unwrap();
        let names: BTreeSet<&str> = ["Alice", "Bob", "Carol"].into();
        assert!(names.contains(state.winner.unwrap().name.as_str()));
    }

    #[tokio::test]
    async fn winner_is_never_rerolled() {
        let f = fixture("idempotent", "2024-12-04", "17:00");
        f.backend.add_entry(3, "Alice", "203.0.113.7").await.unwrap();

        let first = f.controller.state(&visitor()).await.unwrap();
        let picked = first.winner.unwrap();

        // Later entries must not change an announced winner.
        f.backend.add_entry(3, "Mallory", "198.51.100.1").await.unwrap();
        for _ in 0..3 {
            let again = f.controller.state(&visitor()).await.unwrap();
            assert_eq!(again.phase, Phase::WinnerAnnounced);
            assert_eq!(again.winner.as_ref().unwrap().name, picked.name);
        }
    }

    #[tokio::test]
    async fn correct_answer_reveals_no_explanation() {
        let f = fixture("correct", "2024-12-04", "12:00");
        // Day 3's configured answer index is 3.
        let outcome = f.controller.answer(&visitor(), 3).await.unwrap();
        assert_eq!(
            outcome,
            AnswerOutcome::Scored {
                correct: true,
                explain: None
            }
        );
    }

    #[tokio::test]
    async fn wrong_answer_carries_the_explanation() {
        let f = fixture("wrong", "2024-12-04", "12:00");
        let outcome = f.controller.answer(&visitor(), 0).await.unwrap();
        assert_eq!(
            outcome,
            AnswerOutcome::Scored {
                correct: false,
                explain: Some("Explanation 4".into())
            }
        );
    }

    #[tokio::test]
    async fn one_attempt_per_identity_per_day() {
        let f = fixture("gate", "2024-12-04", "12:00");
        let id = visitor();

        assert!(matches!(
            f.controller.answer(&id, 3).await.unwrap(),
            AnswerOutcome::Scored { .. }
        ));

        // Second activation is a no-op.
        assert_eq!(
            f.controller.answer(&id, 3).await.unwrap(),
            AnswerOutcome::AlreadyPlayed
        );

        // A fresh view short-circuits to "already played", no choices.
        let state = f.controller.state(&id).await.unwrap();
        assert_eq!(state.phase, Phase::Open);
        assert!(state.already_played);
        assert!(state.question.is_none());

        // Same IP on another device is still gated.
        let same_ip = VisitorIdentity::new("203.0.113.7", Some("dev-9".into()));
        assert_eq!(
            f.controller.answer(&same_ip, 3).await.unwrap(),
            AnswerOutcome::AlreadyPlayed
        );
    }

    #[tokio::test]
    async fn answering_outside_the_window_is_refused() {
        let f = fixture("closedanswer", "2024-12-04", "09:00");
        assert_eq!(
            f.controller.answer(&visitor(), 3).await.unwrap(),
            AnswerOutcome::NotOpen
        );
    }

    #[tokio::test]
    async fn entries_are_refused_outside_the_window() {
        let f = fixture("entrywindow", "2024-12-04", "09:00");

        // Before opening: nothing is recorded.
        assert_eq!(
            f.controller.submit_entry(&visitor(), "Alice").await.unwrap(),
            EntryOutcome::NotOpen
        );
        assert!(f.backend.entries(3).await.unwrap().is_empty());

        // After close the draw list is fixed; still refused.
        fs::write(
            &f.override_path,
            r#"{"date":"2024-12-04","time":"17:00"}"#,
        )
        .unwrap();
        assert_eq!(
            f.controller.submit_entry(&visitor(), "Alice").await.unwrap(),
            EntryOutcome::NotOpen
        );
        assert!(f.backend.entries(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entries_are_refused_once_a_winner_is_announced() {
        let f = fixture("entrywinner", "2024-12-04", "12:00");
        f.backend
            .set_winner(
                3,
                &Winner {
                    name: "Alice".into(),
                    ts: Utc::now(),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            f.controller.submit_entry(&visitor(), "Bob").await.unwrap(),
            EntryOutcome::NotOpen
        );
        assert!(f.backend.entries(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_entry_write_reports_retry_and_persists_nothing() {
        let f = fixture("writefail", "2024-12-04", "12:00");

        // A directory where the data file belongs makes every write fail.
        let data_file = f.dir.join("store").join("store.json");
        fs::create_dir_all(&data_file).unwrap();

        assert_eq!(
            f.controller
                .submit_entry(&visitor(), "Alice")
                .await
                .unwrap(),
            EntryOutcome::WriteFailed
        );
        assert!(f.backend.entries(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_name_never_reaches_the_backend() {
        let f = fixture("emptyname", "2024-12-04", "12:00");
        assert_eq!(
            f.controller.submit_entry(&visitor(), "   ").await.unwrap(),
            EntryOutcome::EmptyName
        );
        assert!(f.backend.entries(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entry_submission_trims_and_records() {
        let f = fixture("entry", "2024-12-04", "12:00");
        assert_eq!(
            f.controller
                .submit_entry(&visitor(), "  Alice ")
                .await
                .unwrap(),
            EntryOutcome::Recorded
        );

        let entries = f.backend.entries(3).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Alice");
        assert_eq!(entries[0].ip, "203.0.113.7");
    }

    #[tokio::test]
    async fn archive_is_sorted_ascending() {
        let f = fixture("archive", "2024-12-04", "12:00");
        for day in [5u32, 1, 3] {
            f.backend
                .set_winner(
                    day,
                    &Winner {
                        name: format!("Winner {}", day),
                        ts: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let archive = f.controller.archive().await.unwrap();
        let days: Vec<u32> = archive.iter().map(|(day, _winner)| *day).collect();
        assert_eq!(days, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn nudging_the_override_moves_the_day() {
        let f = fixture("nudge", "2024-12-04", "12:00");
        assert_eq!(f.controller.state(&visitor()).await.unwrap().day_index, 3);

        fs::write(
            &f.override_path,
            r#"{"date":"2024-12-05","time":"12:00"}"#,
        )
        .unwrap();
        assert_eq!(f.controller.state(&visitor()).await.unwrap().day_index, 4);
    }
}
