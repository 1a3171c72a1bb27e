/// Progress of one backend response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultState {
    Init,
    Fields,
    FieldsEOF,
    Parameters,
    ParametersEOF,
    Rows,
    OK,
    Error,
    EOF,
    Abort,
}

impl ResultState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            ResultState::OK | ResultState::Error | ResultState::EOF | ResultState::Abort
        )
    }

    pub fn is_error(self) -> bool {
        self == ResultState::Error
    }

    pub fn is_abort(self) -> bool {
        self == ResultState::Abort
    }

    pub fn is_ok(self) -> bool {
        matches!(self, ResultState::OK | ResultState::EOF)
    }
}

impl std::fmt::Display for ResultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        for state in [ResultState::OK, ResultState::Error, ResultState::EOF, ResultState::Abort] {
            assert!(state.is_done());
        }
        for state in [
            ResultState::Init,
            ResultState::Fields,
            ResultState::FieldsEOF,
            ResultState::Parameters,
            ResultState::ParametersEOF,
            ResultState::Rows,
        ] {
            assert!(!state.is_done());
            assert!(!state.is_ok());
        }
        assert!(ResultState::Error.is_error());
        assert!(ResultState::Abort.is_abort());
        assert!(!ResultState::Abort.is_ok());
    }
}
