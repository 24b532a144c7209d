/// Upstream data provider clients.
///
/// - `open_meteo`: current weather conditions per coordinate pair.
/// - `waze`: traffic feed fetch and summarization.
///
/// Each client exposes a `fetch_*` function doing the HTTP call and a pure
/// `parse_*` function that the fetch delegates to, so response handling is
/// testable without the network.

pub mod open_meteo;
pub mod waze;

use std::time::Duration;

use crate::model::ProviderError;

/// Builds a blocking client with a per-provider request timeout.
pub fn build_client(timeout_secs: u64) -> Result<reqwest::blocking::Client, ProviderError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("stagemon_service/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(ProviderError::from)
}
