//! Tracking state machine.

use std::fmt;

/// State of the tracking thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingState {
    /// An inertial frame arrived without samples since the previous one.
    SystemNotReady,
    /// Nothing processed since construction or the last reset.
    NoImagesYet,
    /// Waiting for enough data to build the initial map.
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Tracking failed; relocalization is attempted on every frame.
    Lost,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self::NoImagesYet
    }
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SystemNotReady => "SYSTEM_NOT_READY",
            Self::NoImagesYet => "NO_IMAGES_YET",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::Ok => "OK",
            Self::Lost => "LOST",
        };
        f.write_str(name)
    }
}

/// What one tracking cycle produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleOutcome {
    /// The frame had no keypoints and was skipped.
    EmptyFrame,
    /// The frame is older than the last processed one and was skipped.
    OutOfOrder,
    /// Inertial samples are missing for this frame.
    ImuMissing,
    /// Initialization could not be completed with this frame.
    InitializationPending,
    Initialized,
    Tracked,
    TrackingFailed,
    Relocalized,
    RelocalizationFailed,
}

impl CycleOutcome {
    pub const ALL: [CycleOutcome; 9] = [
        Self::EmptyFrame,
        Self::OutOfOrder,
        Self::ImuMissing,
        Self::InitializationPending,
        Self::Initialized,
        Self::Tracked,
        Self::TrackingFailed,
        Self::Relocalized,
        Self::RelocalizationFailed,
    ];
}

impl TrackingState {
    pub const ALL: [TrackingState; 5] = [
        Self::SystemNotReady,
        Self::NoImagesYet,
        Self::NotInitialized,
        Self::Ok,
        Self::Lost,
    ];

    /// Next state after a cycle ended with `outcome`.
    ///
    /// A skipped frame (empty or out of order) never changes the state. A
    /// failed initialization keeps a lost tracker lost, since the map it lost
    /// track of still exists.
    pub fn next(self, outcome: CycleOutcome) -> TrackingState {
        match (self, outcome) {
            (state, CycleOutcome::EmptyFrame | CycleOutcome::OutOfOrder) => state,
            (_, CycleOutcome::ImuMissing) => Self::SystemNotReady,
            (Self::Lost, CycleOutcome::InitializationPending) => Self::Lost,
            (_, CycleOutcome::InitializationPending) => Self::NotInitialized,
            (_, CycleOutcome::Initialized | CycleOutcome::Tracked | CycleOutcome::Relocalized) => Self::Ok,
            (_, CycleOutcome::TrackingFailed | CycleOutcome::RelocalizationFailed) => Self::Lost,
        }
    }

    /// Whether an initial map still has to be built in this state.
    pub fn needs_initialization(self) -> bool {
        matches!(self, Self::NoImagesYet | Self::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_total() {
        for state in TrackingState::ALL {
            for outcome in CycleOutcome::ALL {
                let next = state.next(outcome);
                assert!(TrackingState::ALL.contains(&next));
                assert_eq!(next, state.next(outcome));
            }
        }
    }

    #[test]
    fn test_skipped_frames_keep_state() {
        for state in TrackingState::ALL {
            assert_eq!(state.next(CycleOutcome::EmptyFrame), state);
            assert_eq!(state.next(CycleOutcome::OutOfOrder), state);
        }
    }

    #[test]
    fn test_typical_lifecycle() {
        let s = TrackingState::default();
        assert_eq!(s, TrackingState::NoImagesYet);
        let s = s.next(CycleOutcome::InitializationPending);
        assert_eq!(s, TrackingState::NotInitialized);
        let s = s.next(CycleOutcome::Initialized);
        assert_eq!(s, TrackingState::Ok);
        let s = s.next(CycleOutcome::TrackingFailed);
        assert_eq!(s, TrackingState::Lost);
        let s = s.next(CycleOutcome::RelocalizationFailed);
        assert_eq!(s, TrackingState::Lost);
        assert_eq!(s.next(CycleOutcome::Relocalized), TrackingState::Ok);
        assert_eq!(TrackingState::Ok.to_string(), "OK");
    }
}
