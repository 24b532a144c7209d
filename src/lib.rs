/// Operational stage classification for a city.
///
/// Collectors pull weather (Open-Meteo) and traffic (Waze partner feed) into
/// a store. The decision engine combines the meteorology, incidents,
/// mobility and events groups into a level from 1 (normal) to 5 (crisis)
/// and appends every decision to an immutable history.

pub mod alert;
pub mod analysis;
pub mod collector;
pub mod config;
pub mod db;
pub mod engine;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod stations;
pub mod store;
