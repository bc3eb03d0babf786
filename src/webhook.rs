//! Provider webhook ingestion.
//!
//! Evolution pushes three event kinds at us. All of them are applied
//! best-effort: a malformed sub-payload is logged and dropped, never
//! surfaced, because the provider disables webhooks that keep failing.

use crate::evolution::extract_qr;
use crate::models::{
    ConversationUpdate, InstanceStatus, InstanceUpdate, MessageStatus, NewMessage, SentBy,
};
use crate::store::{ConversationStore, InstanceStore};
use chrono::{TimeZone, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

pub struct WebhookIngestor {
    instances: Arc<dyn InstanceStore>,
    conversations: Arc<dyn ConversationStore>,
    http: reqwest::Client,
    brain_url: Option<String>,
    brain_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    key: MessageKey,
    #[serde(rename = "pushName")]
    push_name: Option<String>,
    message: Option<Value>,
    #[serde(rename = "messageTimestamp")]
    message_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MessageKey {
    #[serde(rename = "remoteJid")]
    remote_jid: Option<String>,
    #[serde(rename = "fromMe", default)]
    from_me: bool,
}

impl WebhookIngestor {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        conversations: Arc<dyn ConversationStore>,
        http: reqwest::Client,
        brain_url: Option<String>,
        brain_secret: Option<String>,
    ) -> Self {
        Self {
            instances,
            conversations,
            http,
            brain_url,
            brain_secret,
        }
    }

    /// Apply one raw provider event, then forward it downstream. Never
    /// fails: every internal error is logged and swallowed.
    pub async fn ingest(&self, payload: Value) {
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        let instance_name = data
            .get("instanceName")
            .or_else(|| payload.get("instance"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        debug!("Webhook event {} for instance {}", event, instance_name);

        match event.as_str() {
            "connection.update" => self.apply_connection_update(&instance_name, &data).await,
            "qrcode.update" => self.apply_qr_update(&instance_name, &data).await,
            "messages.upsert" => self.apply_messages_upsert(&instance_name, &data).await,
            other => debug!("Ignoring unhandled webhook event {}", other),
        }

        self.forward_to_brain(payload);
    }

    async fn apply_connection_update(&self, instance_name: &str, data: &Value) {
        let state = data.get("state").and_then(Value::as_str).unwrap_or_default();
        let status = match state {
            "open" => InstanceStatus::Connected,
            "connecting" => InstanceStatus::Connecting,
            // close or anything unrecognized
            _ => InstanceStatus::Disconnected,
        };

        let instance = match self.instances.get_by_name(instance_name).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                // Events for instances we never created are dropped, not
                // materialized.
                warn!(
                    "connection.update for unknown instance {}; ignoring",
                    instance_name
                );
                return;
            }
            Err(e) => {
                warn!("connection.update lookup failed for {}: {}", instance_name, e);
                return;
            }
        };

        let mut patch = InstanceUpdate {
            status: Some(status),
            ..Default::default()
        };
        if status == InstanceStatus::Connected {
            patch.qr_code = Some(None);
            if let Some(phone) = extract_jid_digits(
                data.get("wuid")
                    .or_else(|| data.get("ownerJid"))
                    .and_then(Value::as_str),
            ) {
                patch.phone_number = Some(phone);
            }
            if let Some(pic) = data.get("profilePictureUrl").and_then(Value::as_str) {
                patch.profile_pic_url = Some(pic.to_string());
            }
        }

        info!(
            "Instance {} connection state {} -> {}",
            instance_name,
            state,
            status.as_str()
        );
        if let Err(e) = self.instances.update(instance.id, patch).await {
            warn!("connection.update persist failed for {}: {}", instance_name, e);
        }
    }

    async fn apply_qr_update(&self, instance_name: &str, data: &Value) {
        let payload = data.get("qrcode").unwrap_or(&Value::Null);
        let Some(qr) = extract_qr(payload) else {
            warn!(
                "qrcode.update for {} carried no extractable QR; dropping",
                instance_name
            );
            return;
        };

        let instance = match self.instances.get_by_name(instance_name).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                warn!("qrcode.update for unknown instance {}; ignoring", instance_name);
                return;
            }
            Err(e) => {
                warn!("qrcode.update lookup failed for {}: {}", instance_name, e);
                return;
            }
        };

        // A fresh QR is proof the instance is not connected, whatever the
        // row currently claims.
        let patch = InstanceUpdate {
            status: Some(InstanceStatus::Connecting),
            qr_code: Some(Some(qr)),
            ..Default::default()
        };
        if let Err(e) = self.instances.update(instance.id, patch).await {
            warn!("qrcode.update persist failed for {}: {}", instance_name, e);
        }
    }

    async fn apply_messages_upsert(&self, instance_name: &str, data: &Value) {
        let instance = match self.instances.get_by_name(instance_name).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                warn!(
                    "messages.upsert for unknown instance {}; ignoring",
                    instance_name
                );
                return;
            }
            Err(e) => {
                warn!("messages.upsert lookup failed for {}: {}", instance_name, e);
                return;
            }
        };

        // The provider sends either a single message object or a batch.
        let messages: Vec<Value> = match data.get("messages") {
            Some(Value::Array(items)) => items.clone(),
            Some(single @ Value::Object(_)) => vec![single.clone()],
            _ if data.get("key").is_some() => vec![data.clone()],
            _ => Vec::new(),
        };

        for (index, raw) in messages.iter().enumerate() {
            // One bad message never aborts the rest of the batch.
            if let Err(e) = self.ingest_message(&instance.id, instance.account_id, raw).await {
                warn!(
                    "messages.upsert[{}] failed for instance {}: {}",
                    index, instance_name, e
                );
            }
        }
    }

    async fn ingest_message(
        &self,
        instance_id: &uuid::Uuid,
        account_id: uuid::Uuid,
        raw: &Value,
    ) -> Result<(), crate::error::StoreError> {
        let parsed: InboundMessage = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Skipping unparseable message payload: {}", e);
                return Ok(());
            }
        };

        // Our own outbound messages echo back through the webhook.
        if parsed.key.from_me {
            return Ok(());
        }

        let Some(phone) = extract_jid_digits(parsed.key.remote_jid.as_deref()) else {
            debug!("Skipping message with unextractable sender JID");
            return Ok(());
        };

        let contact = self
            .conversations
            .find_or_create_contact(account_id, &phone, parsed.push_name.as_deref())
            .await?;
        let conversation = self
            .conversations
            .find_or_create_conversation(*instance_id, contact.id)
            .await?;

        let timestamp = parsed
            .message_timestamp
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        self.conversations
            .create_message(NewMessage {
                conversation_id: conversation.id,
                from_me: false,
                body: extract_body(parsed.message.as_ref()),
                timestamp,
                status: MessageStatus::Delivered,
                sent_by: SentBy::Customer,
                agent_id: None,
            })
            .await?;

        self.conversations
            .update_conversation(
                conversation.id,
                ConversationUpdate {
                    last_message_at: Some(timestamp),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Fire-and-forget relay of the raw event to the downstream brain.
    /// Failures are logged; they never influence the webhook response.
    fn forward_to_brain(&self, payload: Value) {
        let Some(url) = self.brain_url.clone() else {
            return;
        };
        let client = self.http.clone();
        let secret = self.brain_secret.clone();
        tokio::spawn(async move {
            let mut request = client.post(&url).json(&payload);
            if let Some(secret) = secret {
                request = request.bearer_auth(secret);
            }
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!("Brain forward to {} returned {}", url, response.status());
                }
                Ok(_) => {}
                Err(e) => warn!("Brain forward to {} failed: {}", url, e),
            }
        });
    }
}

/// Sender phone from a WhatsApp JID: the digits before `@`. Returns `None`
/// when nothing digit-like remains.
fn extract_jid_digits(jid: Option<&str>) -> Option<String> {
    let prefix = jid?.split('@').next()?;
    let digits: String = prefix.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Text body from the handful of sub-shapes Evolution uses. Unknown shapes
/// yield an empty body rather than dropping the message.
fn extract_body(message: Option<&Value>) -> String {
    let Some(message) = message else {
        return String::new();
    };
    message
        .get("conversation")
        .and_then(Value::as_str)
        .or_else(|| {
            message
                .get("extendedTextMessage")
                .and_then(|m| m.get("text"))
                .and_then(Value::as_str)
        })
        .or_else(|| {
            message
                .get("imageMessage")
                .and_then(|m| m.get("caption"))
                .and_then(Value::as_str)
        })
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationFilter, InstanceStatus, NewInstance};
    use crate::store::MemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    async fn ingestor_with_instance(
        status: InstanceStatus,
    ) -> (Arc<MemoryStore>, WebhookIngestor, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let account = Uuid::new_v4();
        let instance = store
            .create(NewInstance {
                account_id: account,
                name: "shop-main".to_string(),
                status,
            })
            .await
            .unwrap();
        let ingestor = WebhookIngestor::new(
            store.clone() as Arc<dyn InstanceStore>,
            store.clone() as Arc<dyn ConversationStore>,
            reqwest::Client::new(),
            None,
            None,
        );
        (store, ingestor, instance.id)
    }

    fn inbound(jid: &str, from_me: bool, body: &str) -> Value {
        json!({
            "key": {"remoteJid": jid, "fromMe": from_me, "id": Uuid::new_v4().to_string()},
            "pushName": "Ana",
            "message": {"conversation": body},
            "messageTimestamp": 1_714_000_000i64
        })
    }

    #[tokio::test]
    async fn test_connection_open_marks_connected() {
        let (store, ingestor, id) = ingestor_with_instance(InstanceStatus::Connecting).await;

        ingestor
            .ingest(json!({
                "event": "connection.update",
                "data": {"instanceName": "shop-main", "state": "open", "wuid": "5511988887777@s.whatsapp.net"}
            }))
            .await;

        let instance = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Connected);
        assert_eq!(instance.qr_code, None);
        assert_eq!(instance.phone_number.as_deref(), Some("5511988887777"));
    }

    #[tokio::test]
    async fn test_connection_close_and_unknown_states_mark_disconnected() {
        let (store, ingestor, id) = ingestor_with_instance(InstanceStatus::Connected).await;

        ingestor
            .ingest(json!({
                "event": "connection.update",
                "data": {"instanceName": "shop-main", "state": "close"}
            }))
            .await;
        assert_eq!(
            store.get_by_id(id).await.unwrap().unwrap().status,
            InstanceStatus::Disconnected
        );

        ingestor
            .ingest(json!({
                "event": "connection.update",
                "data": {"instanceName": "shop-main", "state": "banana"}
            }))
            .await;
        assert_eq!(
            store.get_by_id(id).await.unwrap().unwrap().status,
            InstanceStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_connection_update_unknown_instance_is_noop() {
        let (store, ingestor, id) = ingestor_with_instance(InstanceStatus::Connecting).await;

        ingestor
            .ingest(json!({
                "event": "connection.update",
                "data": {"instanceName": "nobody-knows-me", "state": "open"}
            }))
            .await;

        // Nothing was created, nothing was touched.
        assert!(store.get_by_name("nobody-knows-me").await.unwrap().is_none());
        assert_eq!(
            store.get_by_id(id).await.unwrap().unwrap().status,
            InstanceStatus::Connecting
        );
    }

    #[tokio::test]
    async fn test_qr_update_forces_connecting_even_over_connected() {
        let (store, ingestor, id) = ingestor_with_instance(InstanceStatus::Connected).await;

        ingestor
            .ingest(json!({
                "event": "qrcode.update",
                "data": {"instanceName": "shop-main", "qrcode": {"base64": "data:image/png;base64,QR"}}
            }))
            .await;

        let instance = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Connecting);
        assert_eq!(instance.qr_code.as_deref(), Some("data:image/png;base64,QR"));
    }

    #[tokio::test]
    async fn test_qr_update_with_unrecognized_shape_is_dropped() {
        let (store, ingestor, id) = ingestor_with_instance(InstanceStatus::Connected).await;

        ingestor
            .ingest(json!({
                "event": "qrcode.update",
                "data": {"instanceName": "shop-main", "qrcode": {}}
            }))
            .await;

        // Status untouched; no panic, no error.
        assert_eq!(
            store.get_by_id(id).await.unwrap().unwrap().status,
            InstanceStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_inbound_message_creates_contact_conversation_message() {
        let (store, ingestor, id) = ingestor_with_instance(InstanceStatus::Connected).await;

        ingestor
            .ingest(json!({
                "event": "messages.upsert",
                "data": {
                    "instanceName": "shop-main",
                    "messages": [inbound("5511977776666@s.whatsapp.net", false, "oi, tudo bem?")]
                }
            }))
            .await;

        let conversations = store
            .list_conversations(ConversationFilter::default())
            .await
            .unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].instance_id, id);
        assert!(conversations[0].last_message_at.is_some());

        let messages = store.list_messages(conversations[0].id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "oi, tudo bem?");
        assert!(!messages[0].from_me);
        assert_eq!(messages[0].sent_by, SentBy::Customer);
        assert_eq!(messages[0].status, MessageStatus::Delivered);

        let contact = store.get_contact(conversations[0].contact_id).await.unwrap().unwrap();
        assert_eq!(contact.phone_number, "5511977776666");
        assert_eq!(contact.name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_reuses_contact_and_conversation() {
        let (store, ingestor, _) = ingestor_with_instance(InstanceStatus::Connected).await;

        let event = json!({
            "event": "messages.upsert",
            "data": {
                "instanceName": "shop-main",
                "messages": [inbound("5511977776666@s.whatsapp.net", false, "primeira")]
            }
        });
        ingestor.ingest(event.clone()).await;
        ingestor.ingest(event).await;

        let conversations = store
            .list_conversations(ConversationFilter::default())
            .await
            .unwrap();
        // Two Message rows, one Contact, one Conversation.
        assert_eq!(conversations.len(), 1);
        let messages = store.list_messages(conversations[0].id).await.unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn test_own_messages_and_bad_jids_are_skipped() {
        let (store, ingestor, _) = ingestor_with_instance(InstanceStatus::Connected).await;

        ingestor
            .ingest(json!({
                "event": "messages.upsert",
                "data": {
                    "instanceName": "shop-main",
                    "messages": [
                        inbound("5511977776666@s.whatsapp.net", true, "echo of my own send"),
                        inbound("status@broadcast", false, "no digits here means skip"),
                        inbound("5511966665555@s.whatsapp.net", false, "kept")
                    ]
                }
            }))
            .await;

        let conversations = store
            .list_conversations(ConversationFilter::default())
            .await
            .unwrap();
        assert_eq!(conversations.len(), 1);
        let messages = store.list_messages(conversations[0].id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "kept");
    }

    #[tokio::test]
    async fn test_body_extraction_falls_back_across_shapes() {
        assert_eq!(
            extract_body(Some(&json!({"conversation": "plain"}))),
            "plain"
        );
        assert_eq!(
            extract_body(Some(&json!({"extendedTextMessage": {"text": "extended"}}))),
            "extended"
        );
        assert_eq!(
            extract_body(Some(&json!({"imageMessage": {"caption": "a photo"}}))),
            "a photo"
        );
        assert_eq!(extract_body(Some(&json!({"audioMessage": {}}))), "");
        assert_eq!(extract_body(None), "");
    }

    #[tokio::test]
    async fn test_unextractable_body_still_persists_empty_message() {
        let (store, ingestor, _) = ingestor_with_instance(InstanceStatus::Connected).await;

        ingestor
            .ingest(json!({
                "event": "messages.upsert",
                "data": {
                    "instanceName": "shop-main",
                    "messages": [{
                        "key": {"remoteJid": "5511944443333@s.whatsapp.net", "fromMe": false},
                        "message": {"stickerMessage": {}}
                    }]
                }
            }))
            .await;

        let conversations = store
            .list_conversations(ConversationFilter::default())
            .await
            .unwrap();
        assert_eq!(conversations.len(), 1);
        let messages = store.list_messages(conversations[0].id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "");
    }

    #[test]
    fn test_jid_digit_extraction() {
        assert_eq!(
            extract_jid_digits(Some("5511988887777@s.whatsapp.net")).as_deref(),
            Some("5511988887777")
        );
        assert_eq!(extract_jid_digits(Some("status@broadcast")), None);
        assert_eq!(extract_jid_digits(None), None);
    }
}
