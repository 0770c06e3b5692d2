//! SQLite-backed store.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{join_ports, split_ports, Store, StoreError};
use crate::models::{Challenge, Instance, InstanceId};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS challenges (
        challenge_id TEXT PRIMARY KEY,
        challenge_name TEXT NOT NULL UNIQUE,
        docker_compose INTEGER NOT NULL,
        port_count INTEGER NOT NULL,
        port_types TEXT NOT NULL,
        internal_port INTEGER NOT NULL,
        image_name TEXT NOT NULL,
        docker_cmds TEXT NOT NULL,
        docker_compose_file TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS instances (
        instance_id INTEGER PRIMARY KEY,
        user_id TEXT NOT NULL,
        challenge_id TEXT NOT NULL,
        backend_endpoint TEXT NOT NULL,
        backend_resource_id TEXT NOT NULL DEFAULT '',
        expiry_timestamp INTEGER NOT NULL,
        ports_used TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS instances_user_id ON instances (user_id)",
];

const CHALLENGE_COLUMNS: &str = "challenge_id, challenge_name, docker_compose, port_count, \
     port_types, internal_port, image_name, docker_cmds, docker_compose_file";

const INSTANCE_COLUMNS: &str = "instance_id, user_id, challenge_id, backend_endpoint, \
     backend_resource_id, expiry_timestamp, ports_used";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if it is missing.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }
}

fn to_db_id(instance_id: InstanceId) -> Result<i64, StoreError> {
    i64::try_from(instance_id)
        .map_err(|_| StoreError::Corrupt(format!("instance id {instance_id} out of range")))
}

fn instance_from_row(row: &SqliteRow) -> Result<Instance, StoreError> {
    let instance_id: i64 = row.try_get("instance_id")?;
    let ports_used: String = row.try_get("ports_used")?;
    Ok(Instance {
        instance_id: InstanceId::try_from(instance_id)
            .map_err(|_| StoreError::Corrupt(format!("negative instance id {instance_id}")))?,
        user_id: row.try_get("user_id")?,
        challenge_id: row.try_get("challenge_id")?,
        backend_endpoint: row.try_get("backend_endpoint")?,
        backend_resource_id: row.try_get("backend_resource_id")?,
        expiry_timestamp: row.try_get("expiry_timestamp")?,
        ports_used: split_ports(&ports_used)?,
    })
}

fn challenge_from_row(row: &SqliteRow) -> Result<Challenge, StoreError> {
    let port_count: i64 = row.try_get("port_count")?;
    let internal_port: i64 = row.try_get("internal_port")?;
    let port_types: String = row.try_get("port_types")?;
    let docker_cmds: String = row.try_get("docker_cmds")?;
    Ok(Challenge {
        challenge_id: row.try_get("challenge_id")?,
        challenge_name: row.try_get("challenge_name")?,
        docker_compose: row.try_get("docker_compose")?,
        port_count: usize::try_from(port_count)
            .map_err(|_| StoreError::Corrupt(format!("bad port count {port_count}")))?,
        port_types: split_list(&port_types, ','),
        internal_port: u16::try_from(internal_port)
            .map_err(|_| StoreError::Corrupt(format!("bad internal port {internal_port}")))?,
        image_name: row.try_get("image_name")?,
        docker_cmds: split_list(&docker_cmds, '\n'),
        docker_compose_file: row.try_get("docker_compose_file")?,
    })
}

fn split_list(column: &str, separator: char) -> Vec<String> {
    if column.is_empty() {
        return Vec::new();
    }
    column.split(separator).map(str::to_string).collect()
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO instances ({INSTANCE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(to_db_id(instance.instance_id)?)
        .bind(&instance.user_id)
        .bind(&instance.challenge_id)
        .bind(&instance.backend_endpoint)
        .bind(&instance.backend_resource_id)
        .bind(instance.expiry_timestamp)
        .bind(join_ports(&instance.ports_used))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY instance_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn count_instances(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM instances")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn active_instance_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<Instance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE user_id = ? LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn set_backend_resource_id(
        &self,
        instance_id: InstanceId,
        resource_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE instances SET backend_resource_id = ? WHERE instance_id = ?")
            .bind(resource_id)
            .bind(to_db_id(instance_id)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_expiry(&self, instance_id: InstanceId, expiry: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE instances SET expiry_timestamp = ? WHERE instance_id = ?")
            .bind(expiry)
            .bind(to_db_id(instance_id)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, instance_id: InstanceId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(to_db_id(instance_id)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_challenge(&self, challenge: &Challenge) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO challenges ({CHALLENGE_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(challenge_id) DO UPDATE SET
                challenge_name = excluded.challenge_name,
                docker_compose = excluded.docker_compose,
                port_count = excluded.port_count,
                port_types = excluded.port_types,
                internal_port = excluded.internal_port,
                image_name = excluded.image_name,
                docker_cmds = excluded.docker_cmds,
                docker_compose_file = excluded.docker_compose_file
            "#
        ))
        .bind(&challenge.challenge_id)
        .bind(&challenge.challenge_name)
        .bind(challenge.docker_compose)
        .bind(challenge.port_count as i64)
        .bind(challenge.port_types.join(","))
        .bind(i64::from(challenge.internal_port))
        .bind(&challenge.image_name)
        .bind(challenge.docker_cmds.join("\n"))
        .bind(&challenge.docker_compose_file)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_challenge(&self, challenge_id: &str) -> Result<Option<Challenge>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE challenge_id = ?"
        ))
        .bind(challenge_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(challenge_from_row).transpose()
    }

    async fn find_challenge_by_name(&self, name: &str) -> Result<Option<Challenge>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE challenge_name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(challenge_from_row).transpose()
    }

    async fn list_challenges(&self) -> Result<Vec<Challenge>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenges ORDER BY challenge_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(challenge_from_row).collect()
    }

    async fn delete_challenge(&self, challenge_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM challenges WHERE challenge_id = ?")
            .bind(challenge_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
