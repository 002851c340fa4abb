use rocket::http::Status;
use rocket::response::Responder;
use rocket::serde::json::Json;
use shared::{Error, ErrorCode};
use thiserror::Error;
use tracing::error;
use crate::processor::VoteError;
use crate::rate_limiter::RateLimitError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid poll ID")]
    InvalidId,
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error(transparent)]
    Vote(#[from] VoteError),
}

impl ApiError {
    pub fn status(&self) -> Status {
        Status::from_code(self.body().code.http_status()).unwrap_or(Status::InternalServerError)
    }

    /// JSON body for the client. Internal details are logged, never returned.
    pub fn body(&self) -> Error {
        match self {
            ApiError::InvalidId => Error::new(ErrorCode::InvalidInput, self.to_string()),
            ApiError::RateLimited(RateLimitError::Exceeded { retry_after_minutes }) => Error::with_details(
                ErrorCode::RateLimited,
                self.to_string(),
                format!("retryAfterMinutes={retry_after_minutes}"),
            ),
            ApiError::RateLimited(RateLimitError::LockFailed) => Error::internal(),
            ApiError::Vote(e) => match e {
                VoteError::Validation(_) => Error::new(ErrorCode::InvalidInput, e.to_string()),
                VoteError::InvalidOption => Error::new(ErrorCode::InvalidOption, e.to_string()),
                VoteError::Unauthenticated => Error::new(ErrorCode::Unauthorized, e.to_string()),
                VoteError::Forbidden(_) => Error::new(ErrorCode::Forbidden, e.to_string()),
                VoteError::NotFound => Error::new(ErrorCode::NotFound, e.to_string()),
                VoteError::AlreadyVoted => Error::new(ErrorCode::AlreadyVoted, e.to_string()),
                VoteError::Internal(_) => Error::internal(),
            },
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'o> {
        let status = self.status();
        if status == Status::InternalServerError {
            error!("{} {} failed: {}", req.method(), req.uri(), self);
        }

        rocket::Response::build_from(Json(self.body()).respond_to(req)?)
            .status(status)
            .ok()
    }
}
