use std::str::FromStr;

use anyhow::{Context, Error};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};

use crate::domain::{
    model::{Application, ContainerRef, DeploymentEvent, EventAction, ImageRef, Language, Status},
    port::PersistenceGateway,
};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS apps (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        repo_url TEXT NOT NULL,
        language TEXT,
        port INTEGER NOT NULL,
        container_id TEXT,
        image_id TEXT,
        status TEXT NOT NULL DEFAULT 'idle',
        error_msg TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deployment_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_id TEXT NOT NULL,
        action TEXT NOT NULL,
        message TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );
    "#,
    r#"CREATE INDEX IF NOT EXISTS deployment_logs_app_id ON deployment_logs(app_id);"#,
];

/// Application records and the deployment log in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database url {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Can't open database {url}"))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        info!("Database ready at {}", url);
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), Error> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Can't create database schema")?;
        }
        Ok(())
    }

    fn timestamp(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, Error> {
        Ok(DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("Invalid stored timestamp {raw:?}"))?
            .with_timezone(&Utc))
    }

    fn application(row: &SqliteRow) -> Result<Application, Error> {
        let language: Option<String> = row.try_get("language")?;
        let port: i64 = row.try_get("port")?;
        let container: Option<String> = row.try_get("container_id")?;
        let image: Option<String> = row.try_get("image_id")?;
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Application {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            repo_url: row.try_get("repo_url")?,
            language: language.as_deref().map(Language::from_str).transpose()?,
            port: u16::try_from(port).with_context(|| format!("Invalid stored port {port}"))?,
            container_ref: container.map(ContainerRef),
            image_ref: image.map(ImageRef),
            status: Status::from_str(&status)?,
            error_message: row.try_get("error_msg")?,
            created_at: Self::parse_timestamp(&created_at)?,
            updated_at: Self::parse_timestamp(&updated_at)?,
        })
    }
}

#[async_trait]
impl PersistenceGateway for SqliteStore {
    async fn save(&self, app: &Application) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO apps (id, name, repo_url, language, port, container_id, image_id, status, error_msg, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                language = excluded.language,
                port = excluded.port,
                container_id = excluded.container_id,
                image_id = excluded.image_id,
                status = excluded.status,
                error_msg = excluded.error_msg,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&app.id)
        .bind(&app.name)
        .bind(&app.repo_url)
        .bind(app.language.map(|language| language.as_str()))
        .bind(i64::from(app.port))
        .bind(app.container_ref.as_ref().map(|container| container.0.as_str()))
        .bind(app.image_ref.as_ref().map(|image| image.0.as_str()))
        .bind(app.status.as_str())
        .bind(app.error_message.as_deref())
        .bind(Self::timestamp(&app.created_at))
        .bind(Self::timestamp(&app.updated_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Can't save application {}", app.id))?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<Application>, Error> {
        let rows = sqlx::query(
            "SELECT id, name, repo_url, language, port, container_id, image_id, status, error_msg, created_at, updated_at FROM apps ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("Can't load applications")?;
        rows.iter().map(Self::application).collect()
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM apps WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Can't delete application {id}"))?;
        Ok(())
    }

    async fn append_event(&self, app_id: &str, action: EventAction, message: &str) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO deployment_logs (app_id, action, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(app_id)
        .bind(action.as_str())
        .bind(message)
        .bind(Self::timestamp(&Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Can't log {} event of {}", action.as_str(), app_id))?;
        Ok(())
    }

    async fn events(&self, app_id: &str) -> Result<Vec<DeploymentEvent>, Error> {
        let rows = sqlx::query(
            "SELECT app_id, action, message, timestamp FROM deployment_logs WHERE app_id = ?1 ORDER BY id",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Can't load events of {app_id}"))?;
        rows.iter()
            .map(|row| -> Result<DeploymentEvent, Error> {
                let action: String = row.try_get("action")?;
                let timestamp: String = row.try_get("timestamp")?;
                Ok(DeploymentEvent {
                    app_id: row.try_get("app_id")?,
                    action: EventAction::from_str(&action)?,
                    message: row.try_get("message")?,
                    timestamp: Self::parse_timestamp(&timestamp)?,
                })
            })
            .collect()
    }
}
