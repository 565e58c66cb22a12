//! Per-user scan configuration persistence.

use std::str::FromStr;

use anyhow::{Error, Result};
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::server::planner::types::{PortPreset, ScanConfig, ScanOptions};

pub struct ConfigStore {
    pool: PgPool,
}

impl ConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scan_configs (
                user_id TEXT PRIMARY KEY,
                network_cidrs TEXT[] NOT NULL,
                ports INT[] NOT NULL,
                port_preset TEXT NOT NULL,
                options JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<ScanConfig>> {
        let row = sqlx::query(
            "SELECT network_cidrs, ports, port_preset, options
             FROM scan_configs WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::from_row(&r)).transpose()
    }

    pub async fn upsert(&self, user_id: &str, config: &ScanConfig) -> Result<ScanConfig> {
        let ports: Vec<i32> = config.ports.iter().map(|&p| i32::from(p)).collect();
        let options = serde_json::to_value(config.options)?;

        sqlx::query(
            "INSERT INTO scan_configs
                 (user_id, network_cidrs, ports, port_preset, options, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (user_id) DO UPDATE SET
                 network_cidrs = EXCLUDED.network_cidrs,
                 ports = EXCLUDED.ports,
                 port_preset = EXCLUDED.port_preset,
                 options = EXCLUDED.options,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(user_id)
        .bind(&config.network_cidrs)
        .bind(&ports)
        .bind(config.port_preset.to_string())
        .bind(options)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, "Stored scan config");
        Ok(config.clone())
    }

    fn from_row(row: &PgRow) -> Result<ScanConfig> {
        let network_cidrs: Vec<String> = row.get("network_cidrs");
        let ports: Vec<i32> = row.get("ports");
        let preset: String = row.get("port_preset");
        let port_preset = PortPreset::from_str(&preset)
            .map_err(|_| Error::msg(format!("Unknown port preset '{preset}'")))?;
        let options: ScanOptions =
            serde_json::from_value(row.get::<serde_json::Value, _>("options"))
                .map_err(|_| Error::msg("Failed to deserialize scan options"))?;

        Ok(ScanConfig {
            network_cidrs,
            ports: ports.into_iter().map(|p| p as u16).collect(),
            port_preset,
            options,
        })
    }
}
