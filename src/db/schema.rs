use duckdb::Connection;
use tracing::debug;

/// Tables backing the query memory. Timestamps are epoch milliseconds and
/// structured columns hold JSON text.
const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS query_cache (
    query_hash      VARCHAR PRIMARY KEY,
    query_text      VARCHAR NOT NULL,
    context_hash    VARCHAR NOT NULL,
    generated_sql   VARCHAR NOT NULL,
    result_rows     VARCHAR NOT NULL,
    result_metadata VARCHAR NOT NULL,
    hit_count       BIGINT NOT NULL DEFAULT 0,
    last_hit_at     BIGINT,
    expires_at      BIGINT NOT NULL,
    is_valid        BOOLEAN NOT NULL DEFAULT TRUE,
    created_at      BIGINT NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS query_log_id_seq START 1;

CREATE TABLE IF NOT EXISTS query_logs (
    id                    BIGINT PRIMARY KEY DEFAULT nextval('query_log_id_seq'),
    user_id               BIGINT NOT NULL,
    session_id            VARCHAR,
    query_text            VARCHAR NOT NULL,
    intent                VARCHAR,
    generated_sql         VARCHAR,
    final_sql             VARCHAR,
    status                VARCHAR NOT NULL,
    execution_time_ms     BIGINT,
    ai_processing_time_ms BIGINT,
    result_rows           VARCHAR,
    result_metadata       VARCHAR,
    error_type            VARCHAR,
    error_message         VARCHAR,
    tokens_used           BIGINT,
    model                 VARCHAR,
    cache_hit             BOOLEAN NOT NULL DEFAULT FALSE,
    complexity            INTEGER,
    query_hash            VARCHAR,
    template_name         VARCHAR,
    created_at            BIGINT NOT NULL,
    completed_at          BIGINT
);

CREATE TABLE IF NOT EXISTS query_templates (
    name               VARCHAR PRIMARY KEY,
    display_name       VARCHAR NOT NULL,
    description        VARCHAR,
    category           VARCHAR NOT NULL,
    sql_template       VARCHAR NOT NULL,
    parameters         VARCHAR NOT NULL,
    examples           VARCHAR NOT NULL,
    keywords           VARCHAR NOT NULL,
    business_domain    VARCHAR,
    allowed_roles      VARCHAR NOT NULL,
    difficulty         VARCHAR NOT NULL,
    usage_count        BIGINT NOT NULL DEFAULT 0,
    success_rate       DOUBLE NOT NULL DEFAULT 0,
    avg_execution_time DOUBLE NOT NULL DEFAULT 0,
    is_active          BOOLEAN NOT NULL DEFAULT TRUE,
    created_by         BIGINT,
    created_at         BIGINT NOT NULL,
    updated_at         BIGINT NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS query_feedback_id_seq START 1;

CREATE TABLE IF NOT EXISTS query_feedback (
    id             BIGINT PRIMARY KEY DEFAULT nextval('query_feedback_id_seq'),
    log_id         BIGINT NOT NULL,
    user_id        BIGINT NOT NULL,
    rating         INTEGER NOT NULL,
    category       VARCHAR NOT NULL,
    comment        VARCHAR,
    corrected_sql  VARCHAR,
    suggestion     VARCHAR,
    is_helpful     BOOLEAN NOT NULL,
    status         VARCHAR NOT NULL,
    reviewer_id    BIGINT,
    reviewed_at    BIGINT,
    admin_response VARCHAR,
    created_at     BIGINT NOT NULL
);
"#;

/// Creates any missing tables. Safe to run on every startup.
pub fn bootstrap(conn: &Connection) -> Result<(), duckdb::Error> {
    debug!("Ensuring query memory schema exists");
    conn.execute_batch(SCHEMA_DDL)
}
