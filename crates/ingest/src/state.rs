use serde::{Deserialize, Serialize};
use std::fmt;

/// Step of a single file ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum IngestState {
    Reading,
    Chunking,
    Hashing,
    StoreLookup,
    Linking,
    Finalizing,
    Done,
    Failed(String),
}

impl IngestState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// Position in the happy path; terminal failure has none
    const fn step(&self) -> Option<u8> {
        match self {
            Self::Reading => Some(0),
            Self::Chunking => Some(1),
            Self::Hashing => Some(2),
            Self::StoreLookup => Some(3),
            Self::Linking => Some(4),
            Self::Finalizing => Some(5),
            Self::Done => Some(6),
            Self::Failed(_) => None,
        }
    }

    /// Forward moves along the happy path, or failure from any
    /// non-terminal state
    #[must_use]
    pub fn can_advance_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.step(), next.step()) {
            (Some(from), Some(to)) => to > from,
            (_, None) => true,
            (None, _) => false,
        }
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reading => f.write_str("reading"),
            Self::Chunking => f.write_str("chunking"),
            Self::Hashing => f.write_str("hashing"),
            Self::StoreLookup => f.write_str("looking up atoms"),
            Self::Linking => f.write_str("linking"),
            Self::Finalizing => f.write_str("finalizing"),
            Self::Done => f.write_str("done"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Tracks the state of one ingestion and logs each transition
pub(crate) struct StateTracker<'a> {
    filename: &'a str,
    state: IngestState,
}

impl<'a> StateTracker<'a> {
    pub(crate) fn new(filename: &'a str) -> Self {
        log::debug!("{filename}: {}", IngestState::Reading);
        Self {
            filename,
            state: IngestState::Reading,
        }
    }

    pub(crate) fn current(&self) -> &IngestState {
        &self.state
    }

    pub(crate) fn advance(&mut self, next: IngestState) {
        debug_assert!(
            self.state.can_advance_to(&next),
            "illegal transition {} -> {next}",
            self.state
        );
        log::debug!("{}: {} -> {next}", self.filename, self.state);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_moves_forward_only() {
        assert!(IngestState::Reading.can_advance_to(&IngestState::Chunking));
        assert!(IngestState::Chunking.can_advance_to(&IngestState::StoreLookup));
        assert!(!IngestState::Linking.can_advance_to(&IngestState::Hashing));
        assert!(!IngestState::Done.can_advance_to(&IngestState::Failed("late".into())));
    }

    #[test]
    fn failure_reachable_from_any_step() {
        for state in [
            IngestState::Reading,
            IngestState::Hashing,
            IngestState::Finalizing,
        ] {
            assert!(state.can_advance_to(&IngestState::Failed("io".into())));
        }
        assert!(!IngestState::Failed("x".into()).can_advance_to(&IngestState::Done));
    }

    #[test]
    fn serializes_with_reason() {
        let json = serde_json::to_string(&IngestState::Failed("disk full".into())).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"disk full"}"#);
        let json = serde_json::to_string(&IngestState::StoreLookup).unwrap();
        assert_eq!(json, r#"{"state":"store_lookup"}"#);
    }
}
