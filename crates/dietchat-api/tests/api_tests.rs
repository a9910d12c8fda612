//! Router-level tests: real handlers, in-memory SQLite, recording push channels.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use dietchat_api::auth::create_token;
use dietchat_api::{AppStateInner, router};
use dietchat_db::Database;
use dietchat_gateway::RealtimeHub;
use dietchat_notify::{
    DeliveryStatus, NativeNotification, NativePushChannel, NotificationDispatcher, PushError,
    WebNotification, WebPushChannel, WebTarget,
};
use dietchat_types::events::RealtimeEvent;
use dietchat_types::models::{ConversationKey, Role};

const SECRET: &str = "test-secret";

#[derive(Default)]
struct RecordingNative {
    sent: Mutex<Vec<NativeNotification>>,
}

#[async_trait]
impl NativePushChannel for RecordingNative {
    async fn send(&self, notification: &NativeNotification) -> Result<(), PushError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingWeb {
    sent: Mutex<Vec<(String, WebNotification)>>,
}

#[async_trait]
impl WebPushChannel for RecordingWeb {
    async fn send(
        &self,
        target: &WebTarget,
        notification: &WebNotification,
    ) -> Result<DeliveryStatus, PushError> {
        self.sent
            .lock()
            .unwrap()
            .push((target.endpoint.clone(), notification.clone()));
        Ok(DeliveryStatus::Delivered)
    }

    fn public_key(&self) -> Option<&str> {
        Some("BTestVapidKey")
    }
}

struct TestApp {
    app: Router,
    db: Arc<Database>,
    hub: RealtimeHub,
    native: Arc<RecordingNative>,
    web: Arc<RecordingWeb>,
    key: ConversationKey,
    client_user: Uuid,
    dietitian: Uuid,
    client_token: String,
    dietitian_token: String,
}

fn test_app() -> TestApp {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let client_user = Uuid::new_v4();
    let dietitian = Uuid::new_v4();
    let key = ConversationKey::new(Uuid::new_v4(), Uuid::new_v4());

    db.upsert_user(&client_user.to_string(), "Ayşe", "client").unwrap();
    db.upsert_user(&dietitian.to_string(), "Dyt. Mehmet", "dietitian").unwrap();
    db.upsert_client(
        &key.client_id.to_string(),
        "Ayşe Yılmaz",
        Some(&client_user.to_string()),
        Some(&dietitian.to_string()),
    )
    .unwrap();
    db.upsert_diet(&key.diet_id.to_string(), &key.client_id.to_string()).unwrap();

    let native = Arc::new(RecordingNative::default());
    let web = Arc::new(RecordingWeb::default());
    let hub = RealtimeHub::new();
    let notifier = NotificationDispatcher::new(
        db.clone(),
        native.clone(),
        web.clone(),
        "https://app.example.com",
    );
    let state = AppStateInner::new(db.clone(), SECRET, hub.clone(), notifier);

    TestApp {
        app: router(state),
        db,
        hub,
        native,
        web,
        key,
        client_user,
        dietitian,
        client_token: create_token(SECRET, client_user, Role::Client, "Ayşe").unwrap(),
        dietitian_token: create_token(SECRET, dietitian, Role::Dietitian, "Dyt. Mehmet").unwrap(),
    }
}

impl TestApp {
    fn messages_uri(&self) -> String {
        format!("/conversations/{}/{}/messages", self.key.client_id, self.key.diet_id)
    }

    async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn send(&self, token: &str, content: &str) -> Value {
        let (status, body) = self
            .call(Method::POST, &self.messages_uri(), Some(token), Some(json!({ "content": content })))
            .await;
        assert_eq!(status, StatusCode::CREATED, "send failed: {}", body);
        body["message"].clone()
    }

    fn set_presence(&self, user: Uuid, active: bool, at: chrono::DateTime<Utc>) {
        self.db
            .upsert_presence(
                &user.to_string(),
                &self.key.client_id.to_string(),
                &self.key.diet_id.to_string(),
                active,
                "web",
                at,
            )
            .unwrap();
    }
}

/// The dispatcher runs detached; give it a moment to land.
async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn requests_without_a_token_are_rejected() {
    let t = test_app();
    let (status, body) = t.call(Method::GET, &t.messages_uri(), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    let (status, _) = t.call(Method::GET, &t.messages_uri(), Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn outsiders_are_forbidden_and_unknown_pairs_not_found() {
    let t = test_app();
    let outsider = create_token(SECRET, Uuid::new_v4(), Role::Dietitian, "Başka").unwrap();

    let (status, body) = t.call(Method::GET, &t.messages_uri(), Some(&outsider), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);

    let unknown = format!("/conversations/{}/{}/messages", t.key.client_id, Uuid::new_v4());
    let (status, _) = t.call(Method::GET, &unknown, Some(&t.client_token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blank_content_is_a_validation_error() {
    let t = test_app();
    for body in [json!({ "content": "   " }), json!({})] {
        let (status, resp) = t
            .call(Method::POST, &t.messages_uri(), Some(&t.client_token), Some(body))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["error"], "Message content cannot be empty");
    }
}

#[tokio::test]
async fn outsider_with_blank_content_is_forbidden_not_invalid() {
    let t = test_app();
    let outsider = create_token(SECRET, Uuid::new_v4(), Role::Client, "Başka").unwrap();
    let (status, body) = t
        .call(Method::POST, &t.messages_uri(), Some(&outsider), Some(json!({ "content": "  " })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn malformed_ids_are_validation_errors() {
    let t = test_app();
    let read_uri = format!("{}/read", t.messages_uri());

    let (status, body) = t
        .call(Method::PATCH, &read_uri, Some(&t.client_token), Some(json!({ "messageIds": ["abc"] })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());

    let uri = format!("{}?afterId=abc", t.messages_uri());
    let (status, body) = t.call(Method::GET, &uri, Some(&t.client_token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let uri = format!("{}?messageId=1.5", t.messages_uri());
    let (status, body) = t.call(Method::GET, &uri, Some(&t.client_token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let uri = format!("/conversations/not-a-uuid/{}/messages", t.key.diet_id);
    let (status, body) = t.call(Method::GET, &uri, Some(&t.client_token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, body) = t
        .call(Method::POST, &t.messages_uri(), Some(&t.client_token), Some(json!({ "content": 42 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn ids_increase_and_after_id_is_exclusive() {
    let t = test_app();
    let a = t.send(&t.client_token, "Kahvaltıda yulaf yedim").await["id"].as_i64().unwrap();
    let b = t.send(&t.dietitian_token, "Harika, devam").await["id"].as_i64().unwrap();
    let c = t.send(&t.client_token, "Öğlen salata").await["id"].as_i64().unwrap();
    assert!(a < b && b < c);

    let uri = format!("{}?afterId={}", t.messages_uri(), a);
    let (status, body) = t.call(Method::GET, &uri, Some(&t.client_token), None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<i64> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![b, c]);
    assert!(body.get("unreadCount").is_none());
}

#[tokio::test]
async fn full_fetch_reports_unread_for_the_caller_only() {
    let t = test_app();
    t.send(&t.client_token, "bir").await;
    t.send(&t.client_token, "iki").await;
    t.send(&t.dietitian_token, "üç").await;

    let (_, body) = t.call(Method::GET, &t.messages_uri(), Some(&t.dietitian_token), None).await;
    assert_eq!(body["messages"].as_array().unwrap().len(), 3);
    assert_eq!(body["unreadCount"], 2);

    let (_, body) = t.call(Method::GET, &t.messages_uri(), Some(&t.client_token), None).await;
    assert_eq!(body["unreadCount"], 1);
}

#[tokio::test]
async fn single_message_fetch() {
    let t = test_app();
    let id = t.send(&t.client_token, "tek").await["id"].as_i64().unwrap();

    let uri = format!("{}?messageId={}", t.messages_uri(), id);
    let (status, body) = t.call(Method::GET, &uri, Some(&t.dietitian_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"]["content"], "tek");
    assert_eq!(body["message"]["senderName"], "Ayşe");

    let uri = format!("{}?messageId={}", t.messages_uri(), id + 100);
    let (status, _) = t.call(Method::GET, &uri, Some(&t.dietitian_token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mark_read_skips_own_messages_and_is_idempotent() {
    let t = test_app();
    let mine = t.send(&t.dietitian_token, "benden").await["id"].as_i64().unwrap();
    let theirs = t.send(&t.client_token, "danışandan").await["id"].as_i64().unwrap();
    let mut events = t.hub.subscribe();

    let uri = format!("{}/read", t.messages_uri());
    let body = json!({ "messageIds": [mine, theirs] });

    let (status, resp) = t
        .call(Method::PATCH, &uri, Some(&t.dietitian_token), Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["markedCount"], 1);

    match events.try_recv().unwrap() {
        RealtimeEvent::MessageUpdate { id, is_read, read_at, .. } => {
            assert_eq!(id, theirs);
            assert!(is_read);
            assert!(read_at.is_some());
        }
        other => panic!("unexpected event {:?}", other),
    }

    let (_, resp) = t.call(Method::PATCH, &uri, Some(&t.dietitian_token), Some(body)).await;
    assert_eq!(resp["markedCount"], 0);
    assert!(events.try_recv().is_err());

    let (status, _) = t
        .call(Method::PATCH, &uri, Some(&t.dietitian_token), Some(json!({ "messageIds": [] })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn only_clients_may_attach_photos() {
    let t = test_app();
    let photo = json!([{ "imageData": "data:image/jpeg;base64,aGVsbG8=" }]);

    let (status, body) = t
        .call(
            Method::POST,
            &t.messages_uri(),
            Some(&t.client_token),
            Some(json!({ "content": "Öğle yemeğim", "mealTagId": "lunch", "photos": photo })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["message"]["photos"].as_array().unwrap().len(), 1);
    assert_eq!(body["message"]["mealTagId"], "lunch");

    let (status, _) = t
        .call(
            Method::POST,
            &t.messages_uri(),
            Some(&t.dietitian_token),
            Some(json!({ "content": "fotoğraf", "photos": photo })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = t
        .call(
            Method::POST,
            &t.messages_uri(),
            Some(&t.client_token),
            Some(json!({ "content": "bozuk", "photos": [{ "imageData": "%%%" }] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn send_publishes_a_realtime_insert() {
    let t = test_app();
    let mut events = t.hub.subscribe();
    let id = t.send(&t.client_token, "canlı").await["id"].as_i64().unwrap();

    assert_eq!(
        events.try_recv().unwrap(),
        RealtimeEvent::MessageInsert {
            client_id: t.key.client_id,
            diet_id: t.key.diet_id,
            id,
        }
    );
}

#[tokio::test]
async fn stale_presence_gets_native_and_every_web_subscription() {
    let t = test_app();
    let dietitian = t.dietitian.to_string();
    t.db.upsert_device_token(&dietitian, "ExponentPushToken[abc]", Some("ios"), Utc::now())
        .unwrap();
    for endpoint in ["https://push.example/a", "https://push.example/b"] {
        t.db.upsert_web_subscription(&dietitian, endpoint, "p256dh", "auth", Utc::now())
            .unwrap();
    }
    // Last heartbeat a minute ago: well past the TTL.
    t.set_presence(t.dietitian, true, Utc::now() - chrono::Duration::seconds(60));

    let (_, before) = t.call(Method::GET, &t.messages_uri(), Some(&t.dietitian_token), None).await;
    let last_seen = before["messages"].as_array().unwrap().len() as i64;

    let sent = t.send(&t.client_token, "Bugün çok yoruldum").await;
    let id = sent["id"].as_i64().unwrap();

    assert!(wait_for(|| t.web.sent.lock().unwrap().len() == 2).await);
    assert!(wait_for(|| t.native.sent.lock().unwrap().len() == 1).await);

    let native = t.native.sent.lock().unwrap()[0].clone();
    assert_eq!(native.title, "Ayşe");
    assert_eq!(native.body, "Bugün çok yoruldum");
    assert_eq!(native.data.message_id, id);

    let web = t.web.sent.lock().unwrap().clone();
    for (_, n) in &web {
        assert_eq!(
            n.url,
            format!(
                "https://app.example.com/dietitian/clients/{}/diets/{}/chat",
                t.key.client_id, t.key.diet_id
            )
        );
    }

    let uri = format!("{}?afterId={}", t.messages_uri(), last_seen);
    let (_, body) = t.call(Method::GET, &uri, Some(&t.dietitian_token), None).await;
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["id"], id);
    assert_eq!(messages[0]["isRead"], false);
}

#[tokio::test]
async fn active_recipient_suppresses_push() {
    let t = test_app();
    let client = t.client_user.to_string();
    t.db.upsert_device_token(&client, "ExponentPushToken[xyz]", None, Utc::now()).unwrap();
    t.set_presence(t.client_user, true, Utc::now());

    t.send(&t.dietitian_token, "Su içmeyi unutma").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(t.native.sent.lock().unwrap().is_empty());
    assert!(t.web.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn presence_accepts_text_plain_beacons_with_query_token() {
    let t = test_app();
    let body = json!({
        "conversationKey": { "clientId": t.key.client_id, "dietId": t.key.diet_id },
        "isActive": false,
        "source": "beacon",
    });
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/presence?token={}", t.client_token))
        .header(header::CONTENT_TYPE, "text/plain;charset=UTF-8")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let row = t
        .db
        .get_presence(
            &t.client_user.to_string(),
            &t.key.client_id.to_string(),
            &t.key.diet_id.to_string(),
        )
        .unwrap()
        .unwrap();
    assert!(!row.is_active);
    assert_eq!(row.source, "beacon");
}

#[tokio::test]
async fn presence_for_a_foreign_conversation_is_forbidden() {
    let t = test_app();
    let outsider = create_token(SECRET, Uuid::new_v4(), Role::Client, "Yabancı").unwrap();
    let body = json!({
        "conversationKey": { "clientId": t.key.client_id, "dietId": t.key.diet_id },
        "isActive": true,
        "source": "web",
    });
    let (status, _) = t.call(Method::POST, "/presence", Some(&outsider), Some(body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = t
        .call(Method::POST, "/presence", Some(&t.client_token), Some(json!({ "nope": 1 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn push_opt_in_and_opt_out() {
    let t = test_app();
    let user = t.client_user.to_string();

    let (status, _) = t
        .call(
            Method::POST,
            "/push/device-token",
            Some(&t.client_token),
            Some(json!({ "token": "ExponentPushToken[1]", "platform": "android" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.db.get_device_token(&user).unwrap().as_deref(), Some("ExponentPushToken[1]"));

    let (status, _) = t.call(Method::DELETE, "/push/device-token", Some(&t.client_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(t.db.get_device_token(&user).unwrap().is_none());

    let sub = json!({ "endpoint": "https://push.example/x", "keys": { "p256dh": "k", "auth": "a" } });
    let (status, _) = t
        .call(Method::POST, "/push/web-subscriptions", Some(&t.client_token), Some(sub))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.db.get_web_subscriptions(&user).unwrap().len(), 1);

    // Someone else cannot remove it.
    let (status, _) = t
        .call(
            Method::DELETE,
            "/push/web-subscriptions",
            Some(&t.dietitian_token),
            Some(json!({ "endpoint": "https://push.example/x" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.db.get_web_subscriptions(&user).unwrap().len(), 1);

    t.call(
        Method::DELETE,
        "/push/web-subscriptions",
        Some(&t.client_token),
        Some(json!({ "endpoint": "https://push.example/x" })),
    )
    .await;
    assert!(t.db.get_web_subscriptions(&user).unwrap().is_empty());

    let (status, _) = t
        .call(
            Method::POST,
            "/push/web-subscriptions",
            Some(&t.client_token),
            Some(json!({ "endpoint": "http://insecure", "keys": { "p256dh": "k", "auth": "a" } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn vapid_key_is_public() {
    let t = test_app();
    let (status, body) = t.call(Method::GET, "/push/vapid-public-key", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["publicKey"], "BTestVapidKey");
}
