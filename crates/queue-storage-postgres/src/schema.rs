pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queues (
    project TEXT NOT NULL,
    name TEXT NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}',
    default_ttl BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (project, name)
);

CREATE TABLE IF NOT EXISTS counters (
    project TEXT NOT NULL,
    queue TEXT NOT NULL,
    value BIGINT NOT NULL,
    last_modified TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (project, queue)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    queue TEXT NOT NULL,
    body JSONB NOT NULL,
    ttl BIGINT NOT NULL,
    marker BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    client_id UUID NOT NULL,
    claim_id TEXT,
    claim_expires_at TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS messages_marker_idx ON messages (project, queue, marker);
CREATE INDEX IF NOT EXISTS messages_claim_idx ON messages (claim_id);
CREATE INDEX IF NOT EXISTS messages_listing_idx ON messages (project, queue, marker);

CREATE TABLE IF NOT EXISTS claims (
    id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    queue TEXT NOT NULL,
    ttl BIGINT NOT NULL,
    grace BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS pools (
    id TEXT PRIMARY KEY,
    uri TEXT NOT NULL,
    weight INTEGER NOT NULL,
    group_tag TEXT
);

CREATE TABLE IF NOT EXISTS catalogue (
    project TEXT NOT NULL,
    queue TEXT NOT NULL,
    pool_id TEXT NOT NULL,
    PRIMARY KEY (project, queue)
);
"#;
