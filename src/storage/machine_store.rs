use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::iaas::{IaasError, Machine, MachineCatalog};

/// Durable machine catalog over the `machines` table.
pub struct MachineStore {
    pool: SqlitePool,
}

impl MachineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn catalog_err(err: sqlx::Error) -> IaasError {
    IaasError::Catalog(Box::new(err))
}

fn row_to_machine(row: &sqlx::sqlite::SqliteRow) -> Result<Machine, IaasError> {
    let params_json: String = row.get("creation_params");
    let creation_params: HashMap<String, String> =
        serde_json::from_str(&params_json).map_err(|err| IaasError::Catalog(Box::new(err)))?;
    let port = u16::try_from(row.get::<i64, _>("port"))
        .map_err(|err| IaasError::Catalog(Box::new(err)))?;
    Ok(Machine {
        name: row.get("name"),
        address: row.get("address"),
        port,
        creation_params,
        ca_cert_path: row.get("ca_cert_path"),
        provider_name: row.get("provider_name"),
    })
}

#[async_trait]
impl MachineCatalog for MachineStore {
    async fn list(&self) -> Result<Vec<Machine>, IaasError> {
        let rows = sqlx::query(
            "SELECT name, address, port, ca_cert_path, provider_name, creation_params
             FROM machines ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(catalog_err)?;
        rows.iter().map(row_to_machine).collect()
    }

    async fn get(&self, name: &str) -> Result<Option<Machine>, IaasError> {
        let row = sqlx::query(
            "SELECT name, address, port, ca_cert_path, provider_name, creation_params
             FROM machines WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(catalog_err)?;
        row.as_ref().map(row_to_machine).transpose()
    }

    async fn put(&self, machine: Machine) -> Result<(), IaasError> {
        let params_json = serde_json::to_string(&machine.creation_params)
            .map_err(|err| IaasError::Catalog(Box::new(err)))?;
        let result = sqlx::query(
            "INSERT INTO machines (name, address, port, ca_cert_path, provider_name, creation_params, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&machine.name)
        .bind(&machine.address)
        .bind(machine.port as i64)
        .bind(&machine.ca_cert_path)
        .bind(&machine.provider_name)
        .bind(&params_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(IaasError::NameTaken(machine.name))
            }
            Err(err) => Err(catalog_err(err)),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), IaasError> {
        let result = sqlx::query("DELETE FROM machines WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(catalog_err)?;
        if result.rows_affected() == 0 {
            return Err(IaasError::NotFound(name.to_string()));
        }
        Ok(())
    }
}
