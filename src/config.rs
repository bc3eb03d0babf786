use dotenvy::dotenv;
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub evolution: EvolutionConfig,
    pub webhook: WebhookConfig,
    pub session_secret: String,
    /// When true, POST /instance/connect answers 202 immediately and runs
    /// the provider interaction on a detached task.
    pub deferred_connect: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvolutionConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Optional bearer token the provider must present on POST /webhook.
    pub secret: Option<String>,
    /// Downstream consumer every raw event is forwarded to, if configured.
    pub brain_url: Option<String>,
    pub brain_secret: Option<String>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
            },
            evolution: EvolutionConfig {
                base_url: env::var("EVOLUTION_API_URL")
                    .unwrap_or_else(|_| "http://localhost:8080".to_string()),
                api_key: env::var("EVOLUTION_API_KEY").unwrap_or_default(),
                timeout_secs: env::var("EVOLUTION_API_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()?,
            },
            webhook: WebhookConfig {
                secret: env::var("WEBHOOK_SECRET").ok(),
                brain_url: env::var("BRAIN_WEBHOOK_URL").ok(),
                brain_secret: env::var("BRAIN_WEBHOOK_SECRET").ok(),
            },
            session_secret: env::var("SESSION_SECRET")?,
            deferred_connect: env::var("CONNECT_DEFERRED")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
        })
    }
}
