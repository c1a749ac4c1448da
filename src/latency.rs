// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Turn latency instrumentation.
//!
//! Stages record named marks on a shared [`TimingTracker`]; the pipeline
//! supervisor derives the per-turn response delay (bot started speaking minus
//! user stopped speaking) when the bot's first audio goes out. Purely
//! observational — nothing in the control path reads these values.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Named per-turn timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimingMark {
    UserStoppedSpeaking,
    ModelFirstToken,
    ModelLastToken,
    TtsFirstAudio,
    BotStartedSpeaking,
}

/// Quality band for a turn's response delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBand {
    /// Under 0.5 s.
    Excellent,
    /// Under 1.0 s.
    Good,
    /// Under 1.5 s.
    Acceptable,
    NeedsImprovement,
}

impl ResponseBand {
    pub fn classify(delay: Duration) -> Self {
        if delay < Duration::from_millis(500) {
            ResponseBand::Excellent
        } else if delay < Duration::from_millis(1000) {
            ResponseBand::Good
        } else if delay < Duration::from_millis(1500) {
            ResponseBand::Acceptable
        } else {
            ResponseBand::NeedsImprovement
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseBand::Excellent => "excellent",
            ResponseBand::Good => "good",
            ResponseBand::Acceptable => "acceptable",
            ResponseBand::NeedsImprovement => "needs improvement",
        }
    }
}

impl std::fmt::Display for ResponseBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared collection of per-turn timing marks.
pub struct TimingTracker {
    marks: Mutex<HashMap<TimingMark, Instant>>,
}

impl TimingTracker {
    pub fn new() -> Self {
        Self {
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Record a mark at now. Re-marking overwrites; each turn's marks
    /// supersede the previous turn's.
    pub fn mark(&self, mark: TimingMark) {
        self.lock().insert(mark, Instant::now());
    }

    /// Elapsed time between two recorded marks, if both exist.
    pub fn elapsed_between(&self, from: TimingMark, to: TimingMark) -> Option<Duration> {
        let marks = self.lock();
        let from = *marks.get(&from)?;
        let to = *marks.get(&to)?;
        Some(to.saturating_duration_since(from))
    }

    /// Compute this turn's response delay and clear the turn's marks so a
    /// stale value never leaks into the next turn. Returns `None` when either
    /// endpoint is missing (e.g. the greeting turn has no user speech).
    pub fn take_response_delay(&self) -> Option<(Duration, ResponseBand)> {
        let mut marks = self.lock();
        let user = *marks.get(&TimingMark::UserStoppedSpeaking)?;
        let bot = *marks.get(&TimingMark::BotStartedSpeaking)?;
        marks.clear();
        let delay = bot.saturating_duration_since(user);
        Some((delay, ResponseBand::classify(delay)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TimingMark, Instant>> {
        self.marks.lock().expect("timing tracker lock poisoned")
    }
}

impl Default for TimingTracker {
    fn default() -> Self {
        Self::new()
    }
}
