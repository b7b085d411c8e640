use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppCfg {
    pub database: DbCfg,
    pub scheduler: SchedulerCfg,
    #[serde(default)]
    pub prediction: PredictionCfg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbCfg {
    pub url: String,
    #[serde(rename = "maxConnections", default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DbCfg {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/agora".to_string(),
            max_connections: default_max_connections(),
        }
    }
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerCfg {
    /// How often the scheduler scans for crossed phase boundaries.
    #[serde(with = "humantime_serde", default = "default_tick")]
    pub tick: Duration,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            tick: default_tick(),
        }
    }
}
fn default_tick() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Deserialize, Clone)]
pub struct PredictionCfg {
    /// Magnitude of the random off-diagonal perturbation applied when the
    /// error covariance matrix is singular.
    #[serde(rename = "regularizationEpsilon", default = "default_epsilon")]
    pub regularization_epsilon: f64,
    /// How many perturbations to try before declaring the matrix degenerate
    /// and falling back to the unweighted mean.
    #[serde(rename = "regularizationAttempts", default = "default_attempts")]
    pub regularization_attempts: u32,
}

impl Default for PredictionCfg {
    fn default() -> Self {
        Self {
            regularization_epsilon: default_epsilon(),
            regularization_attempts: default_attempts(),
        }
    }
}
fn default_epsilon() -> f64 {
    1e-7
}
fn default_attempts() -> u32 {
    100
}

impl AppCfg {
    pub fn load(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path))
            .add_source(config::Environment::default().separator("__"))
            .build()
            .context("building config")?;

        let app: AppCfg = cfg.try_deserialize().context("deserializing config")?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.database.url.is_empty(), "database.url missing");
        anyhow::ensure!(
            self.database.max_connections > 0,
            "database.maxConnections must be > 0"
        );
        anyhow::ensure!(
            !self.scheduler.tick.is_zero(),
            "scheduler.tick must be > 0"
        );
        anyhow::ensure!(
            self.prediction.regularization_epsilon > 0.0,
            "prediction.regularizationEpsilon must be > 0"
        );
        anyhow::ensure!(
            self.prediction.regularization_attempts > 0,
            "prediction.regularizationAttempts must be > 0"
        );
        Ok(())
    }
}
