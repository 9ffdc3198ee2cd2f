//! Metadata-store operations for LLM bindings, agent profiles, and the
//! per-invocation execution log.

use sqlx::SqlitePool;
use sqlx::sqlite::SqliteArguments;
use sqlx::Arguments;
use uuid::Uuid;

use super::models::*;
use crate::models::Scene;
use crate::utils::{EngineError, EngineResult};

pub struct LlmRepository {
    pool: SqlitePool,
}

impl LlmRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    pub async fn list_bindings(&self) -> EngineResult<Vec<LlmBinding>> {
        sqlx::query_as::<_, LlmBinding>("SELECT * FROM llm_bindings ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(EngineError::from)
    }

    /// Masked view for display surfaces.
    pub async fn list_binding_infos(&self) -> EngineResult<Vec<LlmBindingInfo>> {
        let bindings = self.list_bindings().await?;
        Ok(bindings.iter().map(LlmBindingInfo::from).collect())
    }

    pub async fn get_binding(&self, id: &str) -> EngineResult<Option<LlmBinding>> {
        sqlx::query_as::<_, LlmBinding>("SELECT * FROM llm_bindings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(EngineError::from)
    }

    /// Resolution order: explicit id, then the scene's binding, then the
    /// default binding. No silent fallback beyond that.
    pub async fn resolve_binding(
        &self,
        scene: &Scene,
        binding_id: Option<&str>,
    ) -> EngineResult<LlmBinding> {
        if let Some(id) = binding_id {
            let binding = self
                .get_binding(id)
                .await?
                .ok_or_else(|| EngineError::not_found(format!("llm binding '{}' not found", id)))?;
            if !binding.enabled {
                return Err(EngineError::validation(format!("llm binding '{}' is disabled", id)));
            }
            return Ok(binding);
        }

        if let Some(binding) = sqlx::query_as::<_, LlmBinding>(
            "SELECT * FROM llm_bindings WHERE scene = ? AND enabled = TRUE LIMIT 1",
        )
        .bind(scene.as_str())
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(binding);
        }

        sqlx::query_as::<_, LlmBinding>(
            "SELECT * FROM llm_bindings WHERE is_default = TRUE AND enabled = TRUE LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            EngineError::not_found(format!(
                "no llm binding for scene '{}' and no default binding",
                scene
            ))
        })
    }

    pub async fn create_binding(&self, req: CreateBindingRequest) -> EngineResult<LlmBinding> {
        let id = Uuid::new_v4().to_string();

        if req.is_default {
            sqlx::query("UPDATE llm_bindings SET is_default = FALSE")
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            r#"INSERT INTO llm_bindings
               (id, name, api_base, model_name, api_key, temperature, max_tokens,
                timeout_seconds, scene, is_default, enabled)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, TRUE)"#,
        )
        .bind(&id)
        .bind(&req.name)
        .bind(&req.api_base)
        .bind(&req.model_name)
        .bind(&req.api_key)
        .bind(req.temperature)
        .bind(req.max_tokens)
        .bind(req.timeout_seconds)
        .bind(req.scene.as_ref().map(|s| s.as_str().to_string()))
        .bind(req.is_default)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                EngineError::conflict(format!("llm binding '{}' already exists", req.name))
            },
            _ => EngineError::from(e),
        })?;

        self.get_binding(&id)
            .await?
            .ok_or_else(|| EngineError::internal("binding vanished after insert"))
    }

    pub async fn update_binding(
        &self,
        id: &str,
        req: UpdateBindingRequest,
    ) -> EngineResult<LlmBinding> {
        if req.is_default == Some(true) {
            sqlx::query("UPDATE llm_bindings SET is_default = FALSE")
                .execute(&self.pool)
                .await?;
        }

        let mut sql = String::from("UPDATE llm_bindings SET updated_at = CURRENT_TIMESTAMP");
        let mut args = SqliteArguments::default();

        if let Some(v) = &req.name {
            sql.push_str(", name = ?");
            args.add(v);
        }
        if let Some(v) = &req.api_base {
            sql.push_str(", api_base = ?");
            args.add(v);
        }
        if let Some(v) = &req.model_name {
            sql.push_str(", model_name = ?");
            args.add(v);
        }
        if let Some(v) = &req.api_key {
            sql.push_str(", api_key = ?");
            args.add(v);
        }
        if let Some(v) = &req.temperature {
            sql.push_str(", temperature = ?");
            args.add(v);
        }
        if let Some(v) = &req.max_tokens {
            sql.push_str(", max_tokens = ?");
            args.add(v);
        }
        if let Some(v) = &req.timeout_seconds {
            sql.push_str(", timeout_seconds = ?");
            args.add(v);
        }
        if let Some(v) = &req.scene {
            sql.push_str(", scene = ?");
            args.add(v.as_str().to_string());
        }
        if let Some(v) = &req.is_default {
            sql.push_str(", is_default = ?");
            args.add(v);
        }
        if let Some(v) = &req.enabled {
            sql.push_str(", enabled = ?");
            args.add(v);
        }

        sql.push_str(" WHERE id = ?");
        args.add(id);

        let result = sqlx::query_with(&sql, args).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("llm binding '{}' not found", id)));
        }

        self.get_binding(id)
            .await?
            .ok_or_else(|| EngineError::internal("binding vanished after update"))
    }

    pub async fn delete_binding(&self, id: &str) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM llm_bindings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("llm binding '{}' not found", id)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agent profiles
    // ------------------------------------------------------------------

    pub async fn get_profile(&self, id: &str) -> EngineResult<Option<AgentProfile>> {
        sqlx::query_as::<_, AgentProfile>("SELECT * FROM agent_profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(EngineError::from)
    }

    pub async fn upsert_profile(
        &self,
        name: &str,
        binding_id: Option<&str>,
        features: FeatureMask,
    ) -> EngineResult<AgentProfile> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM agent_profiles WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        let id = match existing {
            Some((id,)) => {
                sqlx::query(
                    r#"UPDATE agent_profiles
                       SET binding_id = ?, sql_tool = ?, rag_tool = ?, rule_validation = ?,
                           updated_at = CURRENT_TIMESTAMP
                       WHERE id = ?"#,
                )
                .bind(binding_id)
                .bind(features.sql_tool)
                .bind(features.rag_tool)
                .bind(features.rule_validation)
                .bind(&id)
                .execute(&self.pool)
                .await?;
                id
            },
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"INSERT INTO agent_profiles
                       (id, name, binding_id, sql_tool, rag_tool, rule_validation)
                       VALUES (?, ?, ?, ?, ?, ?)"#,
                )
                .bind(&id)
                .bind(name)
                .bind(binding_id)
                .bind(features.sql_tool)
                .bind(features.rag_tool)
                .bind(features.rule_validation)
                .execute(&self.pool)
                .await?;
                id
            },
        };

        self.get_profile(&id)
            .await?
            .ok_or_else(|| EngineError::internal("profile vanished after upsert"))
    }

    // ------------------------------------------------------------------
    // Execution log
    // ------------------------------------------------------------------

    pub async fn append_log(&self, record: &AgentLogRecord) -> EngineResult<()> {
        sqlx::query(
            r#"INSERT INTO agent_logs (profile_id, step, status, detail, metadata_json, ts)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.profile_id)
        .bind(&record.step)
        .bind(&record.status)
        .bind(&record.detail)
        .bind(record.metadata.to_string())
        .bind(record.ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn count_logs(&self, step: &str) -> EngineResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM agent_logs WHERE step = ?")
            .bind(step)
            .fetch_one(&self.pool)
            .await
            .map_err(EngineError::from)
    }
}
