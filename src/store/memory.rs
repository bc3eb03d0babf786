//! In-memory store used by tests and local development without Postgres.

use crate::error::StoreError;
use crate::models::{
    Contact, Conversation, ConversationFilter, ConversationStatus, ConversationUpdate, Instance,
    InstanceUpdate, Message, NewInstance, NewMessage, NewProduct, Product, ProductUpdate,
};
use crate::store::{ConversationStore, InstanceStore, ProductStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    instances: HashMap<Uuid, Instance>,
    contacts: HashMap<Uuid, Contact>,
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Message>,
    products: HashMap<Uuid, Product>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-mutation; tests should see it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get_by_account_id(&self, account_id: Uuid) -> Result<Option<Instance>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .instances
            .values()
            .find(|i| i.account_id == account_id)
            .cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Instance>, StoreError> {
        let inner = self.lock();
        Ok(inner.instances.values().find(|i| i.name == name).cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        Ok(self.lock().instances.get(&id).cloned())
    }

    async fn create(&self, new: NewInstance) -> Result<Instance, StoreError> {
        let mut inner = self.lock();
        // Mirrors the unique index on instances.name.
        if inner.instances.values().any(|i| i.name == new.name) {
            return Err(StoreError::Query(format!(
                "duplicate instance name: {}",
                new.name
            )));
        }
        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            name: new.name,
            status: new.status,
            phone_number: None,
            profile_pic_url: None,
            qr_code: None,
            created_at: now,
            updated_at: now,
        };
        inner.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn update(&self, id: Uuid, patch: InstanceUpdate) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let instance = inner.instances.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(status) = patch.status {
            instance.status = status;
        }
        if let Some(qr_code) = patch.qr_code {
            instance.qr_code = qr_code;
        }
        if let Some(phone_number) = patch.phone_number {
            instance.phone_number = Some(phone_number);
        }
        if let Some(profile_pic_url) = patch.profile_pic_url {
            instance.profile_pic_url = Some(profile_pic_url);
        }
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock()
            .instances
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_or_create_contact(
        &self,
        account_id: Uuid,
        phone_number: &str,
        name: Option<&str>,
    ) -> Result<Contact, StoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .contacts
            .values_mut()
            .find(|c| c.account_id == account_id && c.phone_number == phone_number)
        {
            if let Some(name) = name {
                if existing.name.as_deref() != Some(name) {
                    existing.name = Some(name.to_string());
                }
            }
            return Ok(existing.clone());
        }

        let contact = Contact {
            id: Uuid::new_v4(),
            account_id,
            phone_number: phone_number.to_string(),
            name: name.map(str::to_string),
            profile_pic_url: None,
            tags: Vec::new(),
            created_at: Utc::now(),
        };
        inner.contacts.insert(contact.id, contact.clone());
        Ok(contact)
    }

    async fn find_or_create_conversation(
        &self,
        instance_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Conversation, StoreError> {
        let mut inner = self.lock();
        let existing = inner
            .conversations
            .values()
            .filter(|c| c.instance_id == instance_id && c.contact_id == contact_id)
            .max_by_key(|c| c.created_at)
            .cloned();
        if let Some(conversation) = existing {
            return Ok(conversation);
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            instance_id,
            contact_id,
            status: ConversationStatus::Bot,
            assigned_to: None,
            last_message_at: None,
            transferred_at: None,
            transfer_reason: None,
            bot_handoff_count: 0,
            created_at: now,
            updated_at: now,
        };
        inner.conversations.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.lock();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            from_me: new.from_me,
            body: new.body,
            timestamp: new.timestamp,
            status: new.status,
            sent_by: new.sent_by,
            agent_id: new.agent_id,
            created_at: Utc::now(),
        };
        inner.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn update_conversation(
        &self,
        id: Uuid,
        patch: ConversationUpdate,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let conversation = inner.conversations.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(status) = patch.status {
            conversation.status = status;
        }
        if let Some(assigned_to) = patch.assigned_to {
            conversation.assigned_to = assigned_to;
        }
        if let Some(last_message_at) = patch.last_message_at {
            conversation.last_message_at = Some(last_message_at);
        }
        if let Some(transferred_at) = patch.transferred_at {
            conversation.transferred_at = Some(transferred_at);
        }
        if let Some(transfer_reason) = patch.transfer_reason {
            conversation.transfer_reason = Some(transfer_reason);
        }
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.lock().conversations.get(&id).cloned())
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, StoreError> {
        Ok(self.lock().contacts.get(&id).cloned())
    }

    async fn list_conversations(
        &self,
        filter: ConversationFilter,
    ) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.lock();

        let account_instances: Option<Vec<Uuid>> = filter.account_id.map(|account_id| {
            inner
                .instances
                .values()
                .filter(|i| i.account_id == account_id)
                .map(|i| i.id)
                .collect()
        });

        let mut result: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| match &account_instances {
                Some(ids) => ids.contains(&c.instance_id),
                None => true,
            })
            .filter(|c| filter.instance_id.map_or(true, |id| c.instance_id == id))
            .filter(|c| filter.status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();

        // last_message_at desc with nulls last, then created_at desc.
        result.sort_by(|a, b| match (b.last_message_at, a.last_message_at) {
            (Some(x), Some(y)) => x.cmp(&y).then(b.created_at.cmp(&a.created_at)),
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (None, None) => b.created_at.cmp(&a.created_at),
        });
        Ok(result)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let inner = self.lock();
        let mut result: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        result.sort_by_key(|m| m.created_at);
        Ok(result)
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn list_products(&self, account_id: Uuid) -> Result<Vec<Product>, StoreError> {
        let inner = self.lock();
        let mut result: Vec<Product> = inner
            .products
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        Ok(self.lock().products.get(&id).cloned())
    }

    async fn create_product(&self, new: NewProduct) -> Result<Product, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let product = Product {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            name: new.name,
            description: new.description,
            price: new.price,
            image_url: new.image_url,
            created_at: now,
            updated_at: now,
        };
        inner.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn update_product(&self, id: Uuid, patch: ProductUpdate) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let product = inner.products.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(name) = patch.name {
            product.name = name;
        }
        if let Some(description) = patch.description {
            product.description = Some(description);
        }
        if let Some(price) = patch.price {
            product.price = price;
        }
        if let Some(image_url) = patch.image_url {
            product.image_url = Some(image_url);
        }
        product.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_product(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock()
            .products
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}
