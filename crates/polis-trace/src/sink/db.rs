//! Best-effort relational trace sink (Postgres).

use super::TraceSink;
use crate::error::TraceError;
use crate::span::{Span, Trace};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub struct PgTraceSink {
    pool: PgPool,
}

impl PgTraceSink {
    /// Connect and make sure the schema exists.
    pub async fn connect(dsn: &str) -> Result<Self, TraceError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await
            .map_err(|e| TraceError::Relational(e.to_string()))?;

        let sink = Self { pool };
        sink.initialize_schema().await?;
        Ok(sink)
    }

    async fn initialize_schema(&self) -> Result<(), TraceError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS traces (
                trace_id TEXT PRIMARY KEY,
                policy_query TEXT NOT NULL,
                policy_type TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                agent_count INTEGER NOT NULL DEFAULT 0,
                total_duration_ms BIGINT NOT NULL DEFAULT 0,
                external_trace_id TEXT,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS spans (
                span_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                parent_span_id TEXT,
                span_type TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT NOT NULL,
                input_text TEXT,
                output_text TEXT,
                model TEXT,
                tokens_used JSONB,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS spans_trace_id ON spans(trace_id);"#,
            r#"CREATE INDEX IF NOT EXISTS spans_agent_name ON spans(agent_name);"#,
            r#"CREATE INDEX IF NOT EXISTS spans_span_type ON spans(span_type);"#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| TraceError::Relational(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TraceSink for PgTraceSink {
    async fn write_header(&self, trace: &Trace) -> Result<(), TraceError> {
        sqlx::query(
            r#"
            INSERT INTO traces
                (trace_id, policy_query, policy_type, created_at,
                 agent_count, total_duration_ms, external_trace_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (trace_id) DO NOTHING
            "#,
        )
        .bind(trace.trace_id.as_str())
        .bind(&trace.policy_query)
        .bind(trace.policy_type.to_string())
        .bind(trace.created_at)
        .bind(trace.agent_count as i32)
        .bind(trace.total_duration_ms)
        .bind(trace.external_trace_id.as_deref())
        .bind(serde_json::Value::Object(trace.metadata.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| TraceError::Relational(e.to_string()))?;
        Ok(())
    }

    async fn write_span(&self, span: &Span) -> Result<(), TraceError> {
        let tokens = span
            .tokens_used
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| TraceError::Relational(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO spans
                (span_id, trace_id, parent_span_id, span_type, agent_name,
                 started_at, ended_at, duration_ms, input_text, output_text,
                 model, tokens_used, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (span_id) DO NOTHING
            "#,
        )
        .bind(span.span_id.as_str())
        .bind(span.trace_id.as_str())
        .bind(span.parent_span_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(span.span_type.to_string())
        .bind(&span.agent_name)
        .bind(span.started_at)
        .bind(span.ended_at)
        .bind(span.duration_ms)
        .bind(span.input_text.as_deref())
        .bind(span.output_text.as_deref())
        .bind(span.model.as_deref())
        .bind(tokens)
        .bind(serde_json::Value::Object(span.metadata.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| TraceError::Relational(e.to_string()))?;
        Ok(())
    }

    async fn finalize(&self, trace: &Trace) -> Result<(), TraceError> {
        sqlx::query(
            r#"
            UPDATE traces
            SET agent_count = $2, total_duration_ms = $3
            WHERE trace_id = $1
            "#,
        )
        .bind(trace.trace_id.as_str())
        .bind(trace.agent_count as i32)
        .bind(trace.total_duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| TraceError::Relational(e.to_string()))?;
        Ok(())
    }
}
