use std::sync::Arc;
use rocket::{State, Shutdown, get, post, http::Status, serde::json::Json};
use rocket::response::status::Created;
use rocket::response::stream::{Event, EventStream};
use rocket::tokio::select;
use tracing::{debug, instrument};
use shared::{models::*, Caller};
use crate::{
    config::AppConfig,
    error::ApiError,
    processor::VoteProcessor,
    publisher::Publisher,
    rate_limiter::RateLimiter,
    store::PollStore,
    utils::{parse_poll_id, rate_limit_key},
};

pub const POLL_UPDATED_EVENT: &str = "poll-updated";

pub struct AppState {
    pub processor: VoteProcessor,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(store: Arc<dyn PollStore>, config: &AppConfig) -> Self {
        let publisher = Arc::new(Publisher::new(config.broadcast_capacity));
        Self {
            processor: VoteProcessor::new(store, publisher, config.store_timeout),
            limiter: RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window_minutes),
        }
    }
}

#[get("/health")]
pub fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "OK".into(),
        message: "Quick Polls API is running".into(),
    })
}

#[rocket::options("/<_..>")]
pub async fn all_options() -> Status {
    Status::Ok
}

#[instrument(skip(state, request, caller))]
#[post("/polls", data = "<request>")]
pub async fn create_poll(
    state: &State<AppState>,
    request: Json<CreatePollRequest>,
    caller: Caller,
) -> Result<Created<Json<PollResponse>>, ApiError> {
    state.limiter.check(&rate_limit_key("create_poll", &caller.origin))?;

    let poll = state.processor.create_poll(&caller.identity, &request).await?;
    let location = format!("/api/polls/{}", poll.id);

    Ok(Created::new(location).body(Json(PollResponse {
        message: "Poll created successfully".into(),
        poll,
    })))
}

#[get("/polls")]
pub async fn list_polls(state: &State<AppState>, caller: Caller) -> Result<Json<PollList>, ApiError> {
    let polls = state.processor.list_polls(&caller.identity).await?;
    Ok(Json(PollList { polls }))
}

#[get("/polls/<id>")]
pub async fn get_poll(state: &State<AppState>, id: &str, caller: Caller) -> Result<Json<PollEnvelope>, ApiError> {
    let poll_id = parse_poll_id(id)?;
    let poll = state.processor.public_aggregate(poll_id, Some(&caller.identity)).await?;
    Ok(Json(PollEnvelope { poll }))
}

/// Live results as Server-Sent Events. The subscription lives inside the stream,
/// so a closed connection drops it and unsubscribes.
#[get("/polls/<id>/events")]
pub async fn poll_events(
    state: &State<AppState>,
    id: &str,
    caller: Caller,
    mut shutdown: Shutdown,
) -> Result<EventStream![], ApiError> {
    let poll_id = parse_poll_id(id)?;
    let mut subscription = state.processor.subscribe(poll_id, Some(&caller.identity)).await?;
    debug!(%poll_id, "Realtime subscriber connected");

    Ok(EventStream! {
        loop {
            let update = select! {
                update = subscription.next() => match update {
                    Some(update) => update,
                    None => break,
                },
                _ = &mut shutdown => break,
            };
            yield Event::json(&update).event(POLL_UPDATED_EVENT);
        }
    })
}

#[instrument(skip(state, request, caller), fields(poll_id = %id))]
#[post("/votes/<id>/vote", data = "<request>")]
pub async fn submit_vote(
    state: &State<AppState>,
    id: &str,
    request: Json<SubmitVoteRequest>,
    caller: Caller,
) -> Result<Json<PollResponse>, ApiError> {
    let poll_id = parse_poll_id(id)?;
    state.limiter.check(&rate_limit_key("submit_vote", &caller.origin))?;

    let poll = state.processor.submit_vote(poll_id, &request, &caller.identity).await?;

    Ok(Json(PollResponse {
        message: "Vote submitted successfully".into(),
        poll,
    }))
}

#[get("/votes/<id>/voters")]
pub async fn get_voters(state: &State<AppState>, id: &str, caller: Caller) -> Result<Json<BreakdownEnvelope>, ApiError> {
    let poll_id = parse_poll_id(id)?;
    let breakdown = state.processor.voter_breakdown(poll_id, &caller.identity).await?;
    Ok(Json(BreakdownEnvelope { breakdown }))
}
