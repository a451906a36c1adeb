use crate::api::config_dto::LimiterConfigDto;
use crate::domain::config::LimiterConfig;
use crate::error::Result;
use crate::loader::parser::parse_json_file;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

pub use crate::domain::availability::{Availability, ChangeReason};
pub use crate::domain::coordinator::{CoordinatorOptions, RateLimitCoordinator};
pub use crate::domain::scheduler::job::{JobContext, JobOutcome, JobRequest, JobSuccess};
pub use crate::domain::usage::{TokenUsage, UsageReport};

/// Loads and validates a limiter configuration from a JSON file.
pub fn load_config(file_path: &str) -> Result<LimiterConfig> {
    let dto: LimiterConfigDto = parse_json_file::<LimiterConfigDto>(file_path)?;
    log::info!("Configuration file parsed successfully.");

    let config = dto.into_domain()?;
    log::info!(
        "Limiter configuration validated: {} model(s), {} job type(s).",
        config.models.len(),
        config.estimations.len()
    );

    Ok(config)
}
