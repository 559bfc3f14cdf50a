//! Read-only lookups into the CIE-10 and medication catalogs.

use crate::constants::SEARCH_LIMIT;
use crate::db::Store;
use crate::EmrResult;
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Cie10Code {
    #[serde(rename = "idCie10")]
    pub id: i64,
    #[serde(rename = "codigo")]
    pub code: String,
    #[serde(rename = "descripcion")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Medication {
    #[serde(rename = "idMedicamento")]
    pub id: i64,
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "presentacion")]
    pub presentation: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CatalogService {
    store: Store,
}

impl CatalogService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Searches CIE-10 codes by code prefix or description substring.
    pub async fn search_cie10(&self, query: Option<&str>) -> EmrResult<Vec<Cie10Code>> {
        let term = query.map(str::trim).unwrap_or_default();
        let rows = sqlx::query_as(
            "SELECT id, code, description FROM cie10_codes
             WHERE code LIKE ? OR description LIKE ?
             ORDER BY code
             LIMIT ?",
        )
        .bind(format!("{}%", term.to_uppercase()))
        .bind(format!("%{term}%"))
        .bind(SEARCH_LIMIT)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    pub async fn search_medications(&self, query: Option<&str>) -> EmrResult<Vec<Medication>> {
        let term = query.map(str::trim).unwrap_or_default();
        let rows = sqlx::query_as(
            "SELECT id, name, presentation FROM medications
             WHERE name LIKE ?
             ORDER BY name
             LIMIT ?",
        )
        .bind(format!("%{term}%"))
        .bind(SEARCH_LIMIT)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }
}

pub(crate) async fn cie10_exists<'c, E>(executor: E, id: i64) -> EmrResult<bool>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM cie10_codes WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(found.is_some())
}

/// Returns the ids among `ids` that are not in the medication catalog.
pub(crate) async fn missing_medications(pool: &SqlitePool, ids: &[i64]) -> EmrResult<Vec<i64>> {
    let mut missing = Vec::new();
    for &id in ids {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM medications WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        if found.is_none() && !missing.contains(&id) {
            missing.push(id);
        }
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_cie10, seed_medication, test_store};

    #[tokio::test]
    async fn search_by_code_prefix_and_description() {
        let (_dir, store, _audit) = test_store().await;
        seed_cie10(store.pool(), "I10", "Hipertensión esencial (primaria)").await;
        seed_cie10(store.pool(), "I48", "Fibrilación y aleteo auricular").await;
        seed_cie10(store.pool(), "E11", "Diabetes mellitus tipo 2").await;
        let service = CatalogService::new(store);

        assert_eq!(service.search_cie10(Some("i4")).await.unwrap().len(), 1);
        let by_text = service.search_cie10(Some("Diabetes")).await.unwrap();
        assert_eq!(by_text.len(), 1);
        assert_eq!(by_text[0].code, "E11");
        assert_eq!(service.search_cie10(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn medication_lookup_and_existence() {
        let (_dir, store, _audit) = test_store().await;
        let enalapril = seed_medication(store.pool(), "Enalapril 10 mg").await;
        seed_medication(store.pool(), "Atorvastatina 20 mg").await;
        let service = CatalogService::new(store.clone());

        assert_eq!(service.search_medications(Some("enal")).await.unwrap().len(), 1);
        assert_eq!(
            missing_medications(store.pool(), &[enalapril, 999, 999]).await.unwrap(),
            vec![999]
        );
        assert!(!cie10_exists(store.pool(), 1).await.unwrap());
    }
}
