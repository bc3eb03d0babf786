use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Initializing,
    Connecting,
    Connected,
    Disconnected,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initializing" => Some(Self::Initializing),
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Bot,
    WaitingAgent,
    InService,
    Resolved,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::WaitingAgent => "waiting_agent",
            Self::InService => "in_service",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bot" => Some(Self::Bot),
            "waiting_agent" => Some(Self::WaitingAgent),
            "in_service" => Some(Self::InService),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentBy {
    Bot,
    Agent,
    Customer,
}

impl SentBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::Agent => "agent",
            Self::Customer => "customer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bot" => Some(Self::Bot),
            "agent" => Some(Self::Agent),
            "customer" => Some(Self::Customer),
            _ => None,
        }
    }
}

/// One WhatsApp connection slot, owned by exactly one account.
/// `name` is the provider-facing identifier and is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub status: InstanceStatus,
    pub phone_number: Option<String>,
    pub profile_pic_url: Option<String>,
    pub qr_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub account_id: Uuid,
    pub name: String,
    pub status: InstanceStatus,
}

/// Partial patch for an instance row. `None` leaves the column alone;
/// `qr_code: Some(None)` clears it. `updated_at` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub status: Option<InstanceStatus>,
    pub qr_code: Option<Option<String>>,
    pub phone_number: Option<String>,
    pub profile_pic_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub account_id: Uuid,
    pub phone_number: String,
    pub name: Option<String>,
    pub profile_pic_url: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub contact_id: Uuid,
    pub status: ConversationStatus,
    pub assigned_to: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub transferred_at: Option<DateTime<Utc>>,
    pub transfer_reason: Option<String>,
    pub bot_handoff_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub status: Option<ConversationStatus>,
    pub assigned_to: Option<Option<Uuid>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub transferred_at: Option<DateTime<Utc>>,
    pub transfer_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub from_me: bool,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub sent_by: SentBy,
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub from_me: bool,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub sent_by: SentBy,
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub account_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub image_url: Option<String>,
}

/// Filters accepted by the conversation listing.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub account_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub status: Option<ConversationStatus>,
}

pub mod schema {
    diesel::table! {
        instances (id) {
            id -> Uuid,
            account_id -> Uuid,
            name -> Text,
            status -> Text,
            phone_number -> Nullable<Text>,
            profile_pic_url -> Nullable<Text>,
            qr_code -> Nullable<Text>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        contacts (id) {
            id -> Uuid,
            account_id -> Uuid,
            phone_number -> Text,
            name -> Nullable<Text>,
            profile_pic_url -> Nullable<Text>,
            tags -> Array<Text>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        conversations (id) {
            id -> Uuid,
            instance_id -> Uuid,
            contact_id -> Uuid,
            status -> Text,
            assigned_to -> Nullable<Uuid>,
            last_message_at -> Nullable<Timestamptz>,
            transferred_at -> Nullable<Timestamptz>,
            transfer_reason -> Nullable<Text>,
            bot_handoff_count -> Int4,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        messages (id) {
            id -> Uuid,
            conversation_id -> Uuid,
            from_me -> Bool,
            body -> Text,
            timestamp -> Timestamptz,
            status -> Text,
            sent_by -> Text,
            agent_id -> Nullable<Uuid>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        products (id) {
            id -> Uuid,
            account_id -> Uuid,
            name -> Text,
            description -> Nullable<Text>,
            price -> Float8,
            image_url -> Nullable<Text>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::allow_tables_to_appear_in_same_query!(
        instances,
        contacts,
        conversations,
        messages,
        products,
    );
}
