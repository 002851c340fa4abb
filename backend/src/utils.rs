use crate::error::ApiError;
use uuid::Uuid;

pub fn parse_poll_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::InvalidId)
}

pub fn rate_limit_key(action: &str, client: &str) -> String {
    format!("{action}:{client}")
}
