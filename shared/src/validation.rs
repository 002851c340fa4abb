use crate::models::{CreatePollRequest, SubmitVoteRequest};

pub const MAX_QUESTION_LENGTH: usize = 200;
pub const MAX_OPTION_LENGTH: usize = 100;
pub const MAX_NAME_LENGTH: usize = 100;
pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Question is required")]
    MissingQuestion,
    #[error("Question cannot exceed {MAX_QUESTION_LENGTH} characters")]
    QuestionTooLong,
    #[error("Question and {MIN_OPTIONS}-{MAX_OPTIONS} options are required")]
    OptionCount,
    #[error("All options must have text")]
    EmptyOption,
    #[error("Option text cannot exceed {MAX_OPTION_LENGTH} characters")]
    OptionTooLong,
    #[error("Option index is required")]
    MissingOptionIndex,
    #[error("Voter name is required")]
    MissingName,
    #[error("Voter name cannot exceed {MAX_NAME_LENGTH} characters")]
    NameTooLong,
}

/// A vote submission that passed field validation. The index is still
/// unchecked against the poll's option count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteInput {
    pub option_index: i64,
    pub display_name: String,
}

pub fn validate_poll_request(request: &CreatePollRequest) -> Result<(), ValidationError> {
    let question = request.question.trim();
    if question.is_empty() { return Err(ValidationError::MissingQuestion); }
    if question.chars().count() > MAX_QUESTION_LENGTH { return Err(ValidationError::QuestionTooLong); }

    if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&request.options.len()) {
        return Err(ValidationError::OptionCount);
    }
    if request.options.iter().any(|opt| opt.text.trim().is_empty()) {
        return Err(ValidationError::EmptyOption);
    }
    if request.options.iter().any(|opt| opt.text.trim().chars().count() > MAX_OPTION_LENGTH) {
        return Err(ValidationError::OptionTooLong);
    }

    Ok(())
}

pub fn validate_vote_request(request: &SubmitVoteRequest) -> Result<VoteInput, ValidationError> {
    let option_index = request.option_index.ok_or(ValidationError::MissingOptionIndex)?;

    let display_name = request.name.as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(ValidationError::MissingName)?;
    if display_name.chars().count() > MAX_NAME_LENGTH {
        return Err(ValidationError::NameTooLong);
    }

    Ok(VoteInput {
        option_index,
        display_name: display_name.to_string(),
    })
}
