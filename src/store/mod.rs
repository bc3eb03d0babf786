//! Persistence contracts. Handlers and the reconciler only ever see these
//! traits; `PgStore` backs production and `MemoryStore` backs tests, each
//! constructed and injected explicitly (no process-wide singletons).

pub mod memory;
pub mod migration;
pub mod pg;

use crate::error::StoreError;
use crate::models::{
    Contact, Conversation, ConversationFilter, ConversationUpdate, Instance, InstanceUpdate,
    Message, NewInstance, NewMessage, NewProduct, Product, ProductUpdate,
};
use async_trait::async_trait;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use migration::run_migrations;
pub use pg::{create_pool, DbPool, PgStore};

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_by_account_id(&self, account_id: Uuid) -> Result<Option<Instance>, StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Instance>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Instance>, StoreError>;

    async fn create(&self, new: NewInstance) -> Result<Instance, StoreError>;

    /// Partial patch: only supplied fields change, `updated_at` always
    /// refreshes.
    async fn update(&self, id: Uuid, patch: InstanceUpdate) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Look up a contact by (account, phone); create it if absent. A changed
    /// display name on an existing contact is persisted.
    async fn find_or_create_contact(
        &self,
        account_id: Uuid,
        phone_number: &str,
        name: Option<&str>,
    ) -> Result<Contact, StoreError>;

    /// Return the most recently created conversation for the pair, creating
    /// one with status `bot` if none exists.
    async fn find_or_create_conversation(
        &self,
        instance_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Conversation, StoreError>;

    async fn create_message(&self, new: NewMessage) -> Result<Message, StoreError>;

    async fn update_conversation(
        &self,
        id: Uuid,
        patch: ConversationUpdate,
    ) -> Result<(), StoreError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, StoreError>;

    /// Ordered by `last_message_at` descending with nulls last, then
    /// `created_at` descending.
    async fn list_conversations(
        &self,
        filter: ConversationFilter,
    ) -> Result<Vec<Conversation>, StoreError>;

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn list_products(&self, account_id: Uuid) -> Result<Vec<Product>, StoreError>;

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StoreError>;

    async fn create_product(&self, new: NewProduct) -> Result<Product, StoreError>;

    async fn update_product(&self, id: Uuid, patch: ProductUpdate) -> Result<(), StoreError>;

    async fn delete_product(&self, id: Uuid) -> Result<(), StoreError>;
}
