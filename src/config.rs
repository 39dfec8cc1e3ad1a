use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::Path;

fn default_environment() -> String {
    "dev".to_string()
}

fn default_status_interval() -> u64 {
    2
}

fn default_stats_interval() -> u64 {
    10
}

fn default_resync_interval() -> u64 {
    30
}

fn default_transit_grace() -> u64 {
    10
}

fn default_health_port() -> u16 {
    8080
}

#[derive(Deserialize, Debug, Clone)]
pub struct Poll {
    /// Seconds between container status collections.
    #[serde(default = "default_status_interval")]
    pub status_interval: u64,
    /// Seconds between container statistics collections.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    /// Seconds between full Kubernetes re-lists.
    #[serde(default = "default_resync_interval")]
    pub resync_interval: u64,
}

impl Default for Poll {
    fn default() -> Self {
        Self {
            status_interval: default_status_interval(),
            stats_interval: default_stats_interval(),
            resync_interval: default_resync_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Camel {
    /// Port the application health endpoint listens on.
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

impl Default for Camel {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Kubernetes namespace to watch; ignored in Docker mode.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub poll: Poll,
    /// Seconds the cleanup sweep shields a just-issued command.
    #[serde(default = "default_transit_grace")]
    pub transit_grace: u64,
    #[serde(default)]
    pub camel: Camel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            namespace: None,
            poll: Poll::default(),
            transit_grace: default_transit_grace(),
            camel: Camel::default(),
        }
    }
}

pub fn load_config(config_path: &Path) -> Result<Config, figment::Error> {
    Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("CARAVEL_"))
        .extract()
}

#[test]
fn test_load_config() {
    use figment::Jail;
    Jail::expect_with(|jail: &mut Jail| {
        jail.create_file(
            "config-test.toml",
            r#"
            environment = "dev"

            [poll]
            status_interval = 3
            stats_interval = 15
            "#,
        )?;

        jail.set_env("CARAVEL_environment", "staging");
        jail.set_env("CARAVEL_transit_grace", "20");

        let config = load_config("config-test.toml".as_ref()).expect("failed to load config");

        assert_eq!(config.environment, "staging");
        assert_eq!(config.poll.status_interval, 3);
        assert_eq!(config.poll.stats_interval, 15);
        assert_eq!(config.poll.resync_interval, 30);
        assert_eq!(config.transit_grace, 20);
        assert_eq!(config.camel.health_port, 8080);

        Ok(())
    });
}
