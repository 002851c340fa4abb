use rocket::{Request, catch, http::Status, serde::json::Json};
use shared::{Error, ErrorCode};

#[catch(400)]
pub fn bad_request(_req: &Request) -> Json<Error> {
    Json(Error::new(ErrorCode::InvalidInput, "Invalid request parameters."))
}

#[catch(401)]
pub fn unauthorized(_req: &Request) -> Json<Error> {
    Json(Error::new(ErrorCode::Unauthorized, "Authentication required or invalid."))
}

#[catch(403)]
pub fn forbidden(_req: &Request) -> Json<Error> {
    Json(Error::new(ErrorCode::Forbidden, "Access denied."))
}

#[catch(404)]
pub fn not_found(_req: &Request) -> Json<Error> {
    Json(Error::new(ErrorCode::NotFound, "The requested resource was not found."))
}

#[catch(409)]
pub fn conflict(_req: &Request) -> Json<Error> {
    Json(Error::new(ErrorCode::AlreadyVoted, "You have already voted on this poll."))
}

/// Well-formed JSON with wrongly typed fields is still a bad request.
#[catch(422)]
pub fn unprocessable(_req: &Request) -> (Status, Json<Error>) {
    (Status::BadRequest, Json(Error::new(ErrorCode::InvalidInput, "Malformed request body.")))
}

#[catch(429)]
pub fn too_many_requests(_req: &Request) -> Json<Error> {
    Json(Error::new(ErrorCode::RateLimited, "Rate limit exceeded. Please wait before trying again."))
}

#[catch(500)]
pub fn internal_error(_req: &Request) -> Json<Error> {
    Json(Error::new(ErrorCode::SystemError, "An internal server error occurred."))
}
