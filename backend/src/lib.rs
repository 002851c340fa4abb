pub mod processor;
pub mod routes;
pub mod store;
pub mod queries;
pub mod publisher;
pub mod config;
pub mod cors;
pub mod error;
pub mod utils;
pub mod rate_limiter;
pub mod catchers;
pub use shared::{models::*, identity::*};

use rocket::{catchers, routes, Build, Rocket};
use crate::{config::AppConfig, cors::Cors, routes::AppState};

/// Assembles the API around an already constructed state.
pub fn build_rocket(state: AppState, config: &AppConfig) -> Rocket<Build> {
    rocket::build()
        .attach(Cors::new(config.allowed_origins.clone()))
        .manage(state)
        .mount(
            "/api",
            routes![
                routes::health,
                routes::all_options,
                routes::create_poll,
                routes::list_polls,
                routes::get_poll,
                routes::poll_events,
                routes::submit_vote,
                routes::get_voters,
            ],
        )
        .register(
            "/",
            catchers![
                catchers::bad_request,
                catchers::unauthorized,
                catchers::forbidden,
                catchers::not_found,
                catchers::conflict,
                catchers::unprocessable,
                catchers::too_many_requests,
                catchers::internal_error,
            ],
        )
}

#[cfg(test)]
mod tests;
