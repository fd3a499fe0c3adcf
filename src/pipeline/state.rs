//! Pipeline state management

/// Lifecycle state of a pipeline and of each stage in it
///
/// States are ordered: `Null < Ready < Paused < Playing`. A change of more
/// than one level is carried out as a sequence of adjacent steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum State {
    /// Nothing allocated, initial and final state
    #[default]
    Null,

    /// Resources acquired (files opened, configs validated), no data flowing
    Ready,

    /// Ready to stream, streaming thread not started or stopped
    Paused,

    /// Data is flowing through the pipeline
    Playing,
}

/// One adjacent step of a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: State,
    pub to: State,
}

impl std::fmt::Display for StateChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

impl State {
    const ORDER: [State; 4] = [State::Null, State::Ready, State::Paused, State::Playing];

    fn level(self) -> usize {
        self as usize
    }

    /// Adjacent steps leading from this state to `target`
    pub fn steps_to(self, target: State) -> Vec<StateChange> {
        let from = self.level();
        let to = target.level();

        let path: Vec<State> = if from <= to {
            Self::ORDER[from..=to].to_vec()
        } else {
            Self::ORDER[to..=from].iter().rev().copied().collect()
        };

        path.windows(2)
            .map(|pair| StateChange {
                from: pair[0],
                to: pair[1],
            })
            .collect()
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            State::Null => "NULL",
            State::Ready => "READY",
            State::Paused => "PAUSED",
            State::Playing => "PLAYING",
        }
    }

    /// Check if resources are held (anything above `Null`)
    pub fn is_active(&self) -> bool {
        !matches!(self, State::Null)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_up_and_down() {
        let up = State::Null.steps_to(State::Playing);
        assert_eq!(
            up,
            vec![
                StateChange { from: State::Null, to: State::Ready },
                StateChange { from: State::Ready, to: State::Paused },
                StateChange { from: State::Paused, to: State::Playing },
            ]
        );

        let down = State::Playing.steps_to(State::Null);
        assert_eq!(down.len(), 3);
        assert_eq!(down[0], StateChange { from: State::Playing, to: State::Paused });
        assert_eq!(down[2], StateChange { from: State::Ready, to: State::Null });

        assert!(State::Paused.steps_to(State::Paused).is_empty());
        assert_eq!(
            State::Ready.steps_to(State::Playing),
            vec![
                StateChange { from: State::Ready, to: State::Paused },
                StateChange { from: State::Paused, to: State::Playing },
            ]
        );
    }

    #[test]
    fn test_state_checks() {
        assert!(State::Playing.is_active());
        assert!(State::Paused.is_active());
        assert!(!State::Null.is_active());
        assert_eq!(State::default(), State::Null);
        assert_eq!(State::Ready.to_string(), "READY");
    }
}
