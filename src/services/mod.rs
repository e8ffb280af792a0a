pub mod ingest;
pub mod owm;
pub mod tiles;
pub mod trend;
