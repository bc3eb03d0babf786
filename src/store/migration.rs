//! Startup schema migration, applied idempotently on every boot.

use crate::error::StoreError;
use crate::store::DbPool;
use diesel::connection::SimpleConnection;
use log::info;

pub fn create_tables_migration() -> &'static str {
    r#"
    CREATE TABLE IF NOT EXISTS instances (
        id UUID PRIMARY KEY,
        account_id UUID NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'initializing',
        phone_number TEXT,
        profile_pic_url TEXT,
        qr_code TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_name ON instances(name);
    CREATE INDEX IF NOT EXISTS idx_instances_account ON instances(account_id);

    CREATE TABLE IF NOT EXISTS contacts (
        id UUID PRIMARY KEY,
        account_id UUID NOT NULL,
        phone_number TEXT NOT NULL,
        name TEXT,
        profile_pic_url TEXT,
        tags TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_account_phone
        ON contacts(account_id, phone_number);

    CREATE TABLE IF NOT EXISTS conversations (
        id UUID PRIMARY KEY,
        instance_id UUID NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
        contact_id UUID NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'bot',
        assigned_to UUID,
        last_message_at TIMESTAMPTZ,
        transferred_at TIMESTAMPTZ,
        transfer_reason TEXT,
        bot_handoff_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE INDEX IF NOT EXISTS idx_conversations_instance ON conversations(instance_id);
    CREATE INDEX IF NOT EXISTS idx_conversations_contact ON conversations(contact_id);
    CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations(status);

    CREATE TABLE IF NOT EXISTS messages (
        id UUID PRIMARY KEY,
        conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        from_me BOOLEAN NOT NULL DEFAULT FALSE,
        body TEXT NOT NULL DEFAULT '',
        timestamp TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL DEFAULT 'sent',
        sent_by TEXT NOT NULL,
        agent_id UUID,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);

    CREATE TABLE IF NOT EXISTS products (
        id UUID PRIMARY KEY,
        account_id UUID NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        price DOUBLE PRECISION NOT NULL DEFAULT 0,
        image_url TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE INDEX IF NOT EXISTS idx_products_account ON products(account_id);
    "#
}

/// Apply the schema. Safe to run on every startup.
pub fn run_migrations(pool: &DbPool) -> Result<(), StoreError> {
    let mut conn = pool
        .get()
        .map_err(|e| StoreError::Connection(e.to_string()))?;
    conn.batch_execute(create_tables_migration())
        .map_err(|e| StoreError::Query(e.to_string()))?;
    info!("Database schema is up to date");
    Ok(())
}
