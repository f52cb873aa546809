use crate::CoreError;
use stagecraft_store::StageState;

pub fn validate_transition(from: StageState, to: StageState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (StageState::Available, StageState::Created)
            | (StageState::Created, StageState::Staged)
            | (StageState::Staged, StageState::Applying)
            | (StageState::Applying, StageState::Applied)
            | (
                StageState::Created
                    | StageState::Staged
                    | StageState::Applying
                    | StageState::Applied,
                StageState::Destroyed
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidStageState { from, to })
    }
}
