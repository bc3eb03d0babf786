//! Postgres store. Every query runs on the blocking pool; the r2d2 pool is
//! shared behind `Arc` via `AppState`.

use crate::error::StoreError;
use crate::models::schema::{contacts, conversations, instances, messages, products};
use crate::models::{
    Contact, Conversation, ConversationFilter, ConversationStatus, ConversationUpdate, Instance,
    InstanceStatus, InstanceUpdate, Message, MessageStatus, NewInstance, NewMessage, NewProduct,
    Product, ProductUpdate, SentBy,
};
use crate::store::{ConversationStore, InstanceStore, ProductStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use uuid::Uuid;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_pool(url: &str, max_connections: u32) -> Result<DbPool, StoreError> {
    let manager = ConnectionManager::<PgConnection>::new(url);
    Pool::builder()
        .max_size(max_connections)
        .build(manager)
        .map_err(|e| StoreError::Connection(e.to_string()))
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| StoreError::Connection(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Connection(format!("blocking task failed: {e}")))?
    }
}

#[derive(Debug, Queryable, Identifiable, Insertable)]
#[diesel(table_name = instances)]
struct InstanceRow {
    id: Uuid,
    account_id: Uuid,
    name: String,
    status: String,
    phone_number: Option<String>,
    profile_pic_url: Option<String>,
    qr_code: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<InstanceRow> for Instance {
    fn from(row: InstanceRow) -> Self {
        Instance {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            status: InstanceStatus::parse(&row.status).unwrap_or(InstanceStatus::Disconnected),
            phone_number: row.phone_number,
            profile_pic_url: row.profile_pic_url,
            qr_code: row.qr_code,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Queryable, Identifiable, Insertable)]
#[diesel(table_name = contacts)]
struct ContactRow {
    id: Uuid,
    account_id: Uuid,
    phone_number: String,
    name: Option<String>,
    profile_pic_url: Option<String>,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<ContactRow> for Contact {
    fn from(row: ContactRow) -> Self {
        Contact {
            id: row.id,
            account_id: row.account_id,
            phone_number: row.phone_number,
            name: row.name,
            profile_pic_url: row.profile_pic_url,
            tags: row.tags,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Queryable, Identifiable, Insertable)]
#[diesel(table_name = conversations)]
struct ConversationRow {
    id: Uuid,
    instance_id: Uuid,
    contact_id: Uuid,
    status: String,
    assigned_to: Option<Uuid>,
    last_message_at: Option<DateTime<Utc>>,
    transferred_at: Option<DateTime<Utc>>,
    transfer_reason: Option<String>,
    bot_handoff_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            instance_id: row.instance_id,
            contact_id: row.contact_id,
            status: ConversationStatus::parse(&row.status).unwrap_or(ConversationStatus::Bot),
            assigned_to: row.assigned_to,
            last_message_at: row.last_message_at,
            transferred_at: row.transferred_at,
            transfer_reason: row.transfer_reason,
            bot_handoff_count: row.bot_handoff_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Queryable, Identifiable, Insertable)]
#[diesel(table_name = messages)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    from_me: bool,
    body: String,
    timestamp: DateTime<Utc>,
    status: String,
    sent_by: String,
    agent_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            conversation_id: row.conversation_id,
            from_me: row.from_me,
            body: row.body,
            timestamp: row.timestamp,
            status: MessageStatus::parse(&row.status).unwrap_or(MessageStatus::Delivered),
            sent_by: SentBy::parse(&row.sent_by).unwrap_or(SentBy::Customer),
            agent_id: row.agent_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Queryable, Identifiable, Insertable)]
#[diesel(table_name = products)]
struct ProductRow {
    id: Uuid,
    account_id: Uuid,
    name: String,
    description: Option<String>,
    price: f64,
    image_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            description: row.description,
            price: row.price,
            image_url: row.image_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn get_by_account_id(&self, account: Uuid) -> Result<Option<Instance>, StoreError> {
        self.run(move |conn| {
            let row: Option<InstanceRow> = instances::table
                .filter(instances::account_id.eq(account))
                .first(conn)
                .optional()?;
            Ok(row.map(Instance::from))
        })
        .await
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Instance>, StoreError> {
        let name = name.to_string();
        self.run(move |conn| {
            let row: Option<InstanceRow> = instances::table
                .filter(instances::name.eq(&name))
                .first(conn)
                .optional()?;
            Ok(row.map(Instance::from))
        })
        .await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        self.run(move |conn| {
            let row: Option<InstanceRow> = instances::table.find(id).first(conn).optional()?;
            Ok(row.map(Instance::from))
        })
        .await
    }

    async fn create(&self, new: NewInstance) -> Result<Instance, StoreError> {
        self.run(move |conn| {
            let now = Utc::now();
            let row = InstanceRow {
                id: Uuid::new_v4(),
                account_id: new.account_id,
                name: new.name,
                status: new.status.as_str().to_string(),
                phone_number: None,
                profile_pic_url: None,
                qr_code: None,
                created_at: now,
                updated_at: now,
            };
            let inserted: InstanceRow = diesel::insert_into(instances::table)
                .values(&row)
                .get_result(conn)?;
            Ok(inserted.into())
        })
        .await
    }

    async fn update(&self, id: Uuid, patch: InstanceUpdate) -> Result<(), StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let current: InstanceRow = instances::table.find(id).first(conn)?;

                let status = patch
                    .status
                    .map(|s| s.as_str().to_string())
                    .unwrap_or(current.status);
                let qr_code = patch.qr_code.unwrap_or(current.qr_code);
                let phone_number = patch.phone_number.or(current.phone_number);
                let profile_pic_url = patch.profile_pic_url.or(current.profile_pic_url);

                diesel::update(instances::table.find(id))
                    .set((
                        instances::status.eq(status),
                        instances::qr_code.eq(qr_code),
                        instances::phone_number.eq(phone_number),
                        instances::profile_pic_url.eq(profile_pic_url),
                        instances::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)?;
                Ok(())
            })
            .map_err(StoreError::from)
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.run(move |conn| {
            let affected = diesel::delete(instances::table.find(id)).execute(conn)?;
            if affected == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn find_or_create_contact(
        &self,
        account: Uuid,
        phone: &str,
        name: Option<&str>,
    ) -> Result<Contact, StoreError> {
        let phone = phone.to_string();
        let name = name.map(str::to_string);
        self.run(move |conn| {
            let existing: Option<ContactRow> = contacts::table
                .filter(contacts::account_id.eq(account))
                .filter(contacts::phone_number.eq(&phone))
                .first(conn)
                .optional()?;

            if let Some(row) = existing {
                if let Some(ref new_name) = name {
                    if row.name.as_deref() != Some(new_name) {
                        diesel::update(contacts::table.find(row.id))
                            .set(contacts::name.eq(new_name))
                            .execute(conn)?;
                        let mut contact = Contact::from(row);
                        contact.name = Some(new_name.clone());
                        return Ok(contact);
                    }
                }
                return Ok(row.into());
            }

            let row = ContactRow {
                id: Uuid::new_v4(),
                account_id: account,
                phone_number: phone,
                name,
                profile_pic_url: None,
                tags: Vec::new(),
                created_at: Utc::now(),
            };
            let inserted: ContactRow = diesel::insert_into(contacts::table)
                .values(&row)
                .get_result(conn)?;
            Ok(inserted.into())
        })
        .await
    }

    async fn find_or_create_conversation(
        &self,
        instance: Uuid,
        contact: Uuid,
    ) -> Result<Conversation, StoreError> {
        self.run(move |conn| {
            // Duplicates are tolerated; the newest row wins.
            let existing: Option<ConversationRow> = conversations::table
                .filter(conversations::instance_id.eq(instance))
                .filter(conversations::contact_id.eq(contact))
                .order(conversations::created_at.desc())
                .first(conn)
                .optional()?;

            if let Some(row) = existing {
                return Ok(row.into());
            }

            let now = Utc::now();
            let row = ConversationRow {
                id: Uuid::new_v4(),
                instance_id: instance,
                contact_id: contact,
                status: ConversationStatus::Bot.as_str().to_string(),
                assigned_to: None,
                last_message_at: None,
                transferred_at: None,
                transfer_reason: None,
                bot_handoff_count: 0,
                created_at: now,
                updated_at: now,
            };
            let inserted: ConversationRow = diesel::insert_into(conversations::table)
                .values(&row)
                .get_result(conn)?;
            Ok(inserted.into())
        })
        .await
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        self.run(move |conn| {
            let row = MessageRow {
                id: Uuid::new_v4(),
                conversation_id: new.conversation_id,
                from_me: new.from_me,
                body: new.body,
                timestamp: new.timestamp,
                status: new.status.as_str().to_string(),
                sent_by: new.sent_by.as_str().to_string(),
                agent_id: new.agent_id,
                created_at: Utc::now(),
            };
            let inserted: MessageRow = diesel::insert_into(messages::table)
                .values(&row)
                .get_result(conn)?;
            Ok(inserted.into())
        })
        .await
    }

    async fn update_conversation(
        &self,
        id: Uuid,
        patch: ConversationUpdate,
    ) -> Result<(), StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let current: ConversationRow = conversations::table.find(id).first(conn)?;

                let status = patch
                    .status
                    .map(|s| s.as_str().to_string())
                    .unwrap_or(current.status);
                let assigned_to = patch.assigned_to.unwrap_or(current.assigned_to);
                let last_message_at = patch.last_message_at.or(current.last_message_at);
                let transferred_at = patch.transferred_at.or(current.transferred_at);
                let transfer_reason = patch.transfer_reason.or(current.transfer_reason);

                diesel::update(conversations::table.find(id))
                    .set((
                        conversations::status.eq(status),
                        conversations::assigned_to.eq(assigned_to),
                        conversations::last_message_at.eq(last_message_at),
                        conversations::transferred_at.eq(transferred_at),
                        conversations::transfer_reason.eq(transfer_reason),
                        conversations::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)?;
                Ok(())
            })
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.run(move |conn| {
            let row: Option<ConversationRow> =
                conversations::table.find(id).first(conn).optional()?;
            Ok(row.map(Conversation::from))
        })
        .await
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, StoreError> {
        self.run(move |conn| {
            let row: Option<ContactRow> = contacts::table.find(id).first(conn).optional()?;
            Ok(row.map(Contact::from))
        })
        .await
    }

    async fn list_conversations(
        &self,
        filter: ConversationFilter,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.run(move |conn| {
            let mut query = conversations::table.into_boxed();

            if let Some(account) = filter.account_id {
                let instance_ids = instances::table
                    .filter(instances::account_id.eq(account))
                    .select(instances::id);
                query = query.filter(conversations::instance_id.eq_any(instance_ids));
            }
            if let Some(instance) = filter.instance_id {
                query = query.filter(conversations::instance_id.eq(instance));
            }
            if let Some(status) = filter.status {
                query = query.filter(conversations::status.eq(status.as_str()));
            }

            let rows: Vec<ConversationRow> = query
                .order((
                    conversations::last_message_at.is_null().asc(),
                    conversations::last_message_at.desc(),
                    conversations::created_at.desc(),
                ))
                .load(conn)?;
            Ok(rows.into_iter().map(Conversation::from).collect())
        })
        .await
    }

    async fn list_messages(&self, conversation: Uuid) -> Result<Vec<Message>, StoreError> {
        self.run(move |conn| {
            let rows: Vec<MessageRow> = messages::table
                .filter(messages::conversation_id.eq(conversation))
                .order(messages::created_at.asc())
                .load(conn)?;
            Ok(rows.into_iter().map(Message::from).collect())
        })
        .await
    }
}

#[async_trait]
impl ProductStore for PgStore {
    async fn list_products(&self, account: Uuid) -> Result<Vec<Product>, StoreError> {
        self.run(move |conn| {
            let rows: Vec<ProductRow> = products::table
                .filter(products::account_id.eq(account))
                .order(products::created_at.desc())
                .load(conn)?;
            Ok(rows.into_iter().map(Product::from).collect())
        })
        .await
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        self.run(move |conn| {
            let row: Option<ProductRow> = products::table.find(id).first(conn).optional()?;
            Ok(row.map(Product::from))
        })
        .await
    }

    async fn create_product(&self, new: NewProduct) -> Result<Product, StoreError> {
        self.run(move |conn| {
            let now = Utc::now();
            let row = ProductRow {
                id: Uuid::new_v4(),
                account_id: new.account_id,
                name: new.name,
                description: new.description,
                price: new.price,
                image_url: new.image_url,
                created_at: now,
                updated_at: now,
            };
            let inserted: ProductRow = diesel::insert_into(products::table)
                .values(&row)
                .get_result(conn)?;
            Ok(inserted.into())
        })
        .await
    }

    async fn update_product(&self, id: Uuid, patch: ProductUpdate) -> Result<(), StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let current: ProductRow = products::table.find(id).first(conn)?;

                diesel::update(products::table.find(id))
                    .set((
                        products::name.eq(patch.name.unwrap_or(current.name)),
                        products::description.eq(patch.description.or(current.description)),
                        products::price.eq(patch.price.unwrap_or(current.price)),
                        products::image_url.eq(patch.image_url.or(current.image_url)),
                        products::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)?;
                Ok(())
            })
            .map_err(StoreError::from)
        })
        .await
    }

    async fn delete_product(&self, id: Uuid) -> Result<(), StoreError> {
        self.run(move |conn| {
            let affected = diesel::delete(products::table.find(id)).execute(conn)?;
            if affected == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }
}
