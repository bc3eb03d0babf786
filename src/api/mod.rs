//! HTTP surface. Each submodule contributes a router over the shared
//! application state; `configure` stitches them together.

pub mod conversations;
pub mod health;
pub mod instance;
pub mod products;
pub mod webhook;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .merge(health::routes())
        .merge(instance::routes())
        .merge(webhook::routes())
        .merge(conversations::routes())
        .merge(products::routes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::issue_session;
    use crate::config::{
        AppConfig, DatabaseConfig, EvolutionConfig, ServerConfig, WebhookConfig,
    };
    use crate::error::ProviderError;
    use crate::evolution::{ConnectionState, WhatsAppProvider};
    use crate::models::{InstanceStatus, NewInstance};
    use crate::store::{ConversationStore, InstanceStore, MemoryStore, ProductStore};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "router-test-secret";

    struct StubProvider;

    #[async_trait]
    impl WhatsAppProvider for StubProvider {
        async fn create_instance(&self, _name: &str) -> Result<Option<String>, ProviderError> {
            Ok(Some("qr-test".to_string()))
        }

        async fn connect_instance(&self, _name: &str) -> Result<Option<String>, ProviderError> {
            Ok(Some("qr-test".to_string()))
        }

        async fn get_instance_status(
            &self,
            _name: &str,
        ) -> Result<ConnectionState, ProviderError> {
            Ok(ConnectionState::Close)
        }

        async fn logout_instance(&self, _name: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn delete_instance(&self, _name: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn send_text_message(
            &self,
            _name: &str,
            _number: &str,
            _text: &str,
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn send_media(
            &self,
            _name: &str,
            _number: &str,
            _media_url: &str,
            _caption: Option<&str>,
        ) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn test_config(deferred: bool, webhook_secret: Option<&str>) -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            database: DatabaseConfig {
                url: "postgres://unused".to_string(),
                max_connections: 1,
            },
            evolution: EvolutionConfig {
                base_url: "http://unused".to_string(),
                api_key: "unused".to_string(),
                timeout_secs: 30,
            },
            webhook: WebhookConfig {
                secret: webhook_secret.map(str::to_string),
                brain_url: None,
                brain_secret: None,
            },
            session_secret: SECRET.to_string(),
            deferred_connect: deferred,
        }
    }

    fn test_app(config: AppConfig) -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(AppState::new(
            config,
            store.clone() as Arc<dyn InstanceStore>,
            store.clone() as Arc<dyn ConversationStore>,
            store.clone() as Arc<dyn ProductStore>,
            Arc::new(StubProvider),
        ));
        (store, configure().with_state(state))
    }

    fn session_for(account: Uuid) -> String {
        issue_session(Uuid::new_v4(), account, SECRET).unwrap()
    }

    fn authed(method: &str, uri: &str, account: Uuid, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::COOKIE, format!("session={}", session_for(account)));
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_connect_requires_session() {
        let (_, app) = test_app(test_config(false, None));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/instance/connect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_connect_creates_instance_and_returns_qr() {
        let (store, app) = test_app(test_config(false, None));
        let account = Uuid::new_v4();

        let response = app
            .oneshot(authed("POST", "/instance/connect", account, Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["qrCode"], json!("qr-test"));
        assert_eq!(body["status"], json!("connecting"));

        let instance = store.get_by_account_id(account).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Connecting);
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_json_body() {
        let (store, app) = test_app(test_config(false, None));
        let account = Uuid::new_v4();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/instance/connect")
                    .header(header::COOKIE, format!("session={}", session_for(account)))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not-json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Nothing was provisioned from the garbage request.
        assert!(store.get_by_account_id(account).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_requires_instance_name() {
        let (_, app) = test_app(test_config(false, None));
        let response = app
            .oneshot(authed("GET", "/instance/status", Uuid::new_v4(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_returns_named_instance_with_remote_state() {
        let (store, app) = test_app(test_config(false, None));
        let account = Uuid::new_v4();
        store
            .create(NewInstance {
                account_id: account,
                name: "status-check".to_string(),
                status: InstanceStatus::Connecting,
            })
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(authed(
                "GET",
                "/instance/status?instanceName=status-check",
                account,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], json!("connecting"));
        assert_eq!(body["evolutionState"], json!("close"));

        // Another tenant cannot poll it by name.
        let response = app
            .oneshot(authed(
                "GET",
                "/instance/status?instanceName=status-check",
                Uuid::new_v4(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_deferred_connect_returns_accepted() {
        let (_, app) = test_app(test_config(true, None));
        let response = app
            .oneshot(authed(
                "POST",
                "/instance/connect",
                Uuid::new_v4(),
                Some(json!({})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = body_json(response).await;
        assert_eq!(body["status"], json!("initializing"));
        assert_eq!(body["qrCode"], Value::Null);
    }

    #[tokio::test]
    async fn test_webhook_connection_open_marks_instance_connected() {
        let (store, app) = test_app(test_config(false, None));
        let instance = store
            .create(NewInstance {
                account_id: Uuid::new_v4(),
                name: "shop-main".to_string(),
                status: InstanceStatus::Connecting,
            })
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({
                            "event": "connection.update",
                            "data": {"instanceName": "shop-main", "state": "open"}
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"success": true}));

        assert_eq!(
            store.get_by_id(instance.id).await.unwrap().unwrap().status,
            InstanceStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_webhook_bad_qr_payload_still_returns_success() {
        let (_, app) = test_app(test_config(false, None));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({
                            "event": "qrcode.update",
                            "data": {"instanceName": "ghost", "qrcode": {}}
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"success": true}));
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_bearer_token() {
        let (_, app) = test_app(test_config(false, Some("hook-secret")));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({"event": "x"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_cross_tenant_conversation_access_forbidden() {
        let (store, app) = test_app(test_config(false, None));
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();

        let instance = store
            .create(NewInstance {
                account_id: owner,
                name: "owner-instance".to_string(),
                status: InstanceStatus::Connected,
            })
            .await
            .unwrap();
        let contact = store
            .find_or_create_contact(owner, "5511912341234", Some("Bia"))
            .await
            .unwrap();
        let conversation = store
            .find_or_create_conversation(instance.id, contact.id)
            .await
            .unwrap();

        let response = app
            .oneshot(authed(
                "GET",
                &format!("/conversations/{}", conversation.id),
                intruder,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_agent_reply_persists_and_updates_conversation() {
        let (store, app) = test_app(test_config(false, None));
        let account = Uuid::new_v4();

        let instance = store
            .create(NewInstance {
                account_id: account,
                name: "reply-instance".to_string(),
                status: InstanceStatus::Connected,
            })
            .await
            .unwrap();
        let contact = store
            .find_or_create_contact(account, "5511955556666", None)
            .await
            .unwrap();
        let conversation = store
            .find_or_create_conversation(instance.id, contact.id)
            .await
            .unwrap();

        let response = app
            .oneshot(authed(
                "POST",
                &format!("/conversations/{}/messages", conversation.id),
                account,
                Some(json!({"message": "posso ajudar?"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let messages = store.list_messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].from_me);
        assert_eq!(messages[0].body, "posso ajudar?");

        let refreshed = store
            .get_conversation(conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert!(refreshed.last_message_at.is_some());
    }

    #[tokio::test]
    async fn test_product_crud_scoped_to_account() {
        let (_, app) = test_app(test_config(false, None));
        let account = Uuid::new_v4();

        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/products",
                account,
                Some(json!({"name": "Bolo de cenoura", "price": 25.0})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["product"]["id"].as_str().unwrap().to_string();

        // Another tenant cannot read it.
        let response = app
            .clone()
            .oneshot(authed(
                "GET",
                &format!("/products/{}", id),
                Uuid::new_v4(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(authed("GET", "/products", account, None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["products"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_reports_ok() {
        let (_, app) = test_app(test_config(false, None));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
