//! Push notifications: payload decoding, display, and click handling.
//!
//! A push payload is loosely typed. A JSON object is read field by field,
//! each falling back to its configured default when absent or unusable.
//! A JSON string is shown as its text; anything else that isn't a JSON
//! object is shown as the raw payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{ClientMatchOptions, ClientRegistry, ClientWindow};
use crate::config::NotificationDefaults;
use crate::{EngineError, Result};

// ==================== Payload ====================

/// Decoded push payload. `None` means "use the default".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    pub url: Option<String>,
    pub actions: Option<Vec<Value>>,
    pub require_interaction: Option<bool>,
}

impl PushPayload {
    /// Decode raw payload bytes, falling back to plain text.
    pub fn decode(raw: &[u8]) -> Self {
        let structured = serde_json::from_slice::<Value>(raw)
            .map_err(|e| EngineError::PayloadDecode(e.to_string()))
            .and_then(|value| match value {
                Value::String(text) => Ok(Self::plain_text(text)),
                other => Self::from_value(&other),
            });

        match structured {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "Push payload treated as text");
                Self::plain_text(String::from_utf8_lossy(raw))
            }
        }
    }

    /// Read a JSON object. Other JSON values are rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(EngineError::PayloadDecode(format!(
                "expected an object, found {}",
                json_kind(value)
            )));
        };

        Ok(Self {
            title: string_field(fields, "title"),
            body: string_field(fields, "body"),
            icon: string_field(fields, "icon"),
            badge: string_field(fields, "badge"),
            tag: string_field(fields, "tag"),
            url: string_field(fields, "url"),
            actions: match fields.get("actions") {
                None | Some(Value::Null) => None,
                Some(Value::Array(actions)) => Some(actions.clone()),
                Some(other) => {
                    debug!(field = "actions", found = json_kind(other), "Ignoring invalid push field");
                    None
                }
            },
            require_interaction: match fields.get("requireInteraction") {
                None | Some(Value::Null) => None,
                Some(Value::Bool(b)) => Some(*b),
                Some(other) => {
                    debug!(
                        field = "requireInteraction",
                        found = json_kind(other),
                        "Ignoring invalid push field"
                    );
                    None
                }
            },
        })
    }

    /// Text payload: shown as the body under the default title.
    pub fn plain_text(text: impl Into<String>) -> Self {
        Self {
            body: Some(text.into()),
            ..Default::default()
        }
    }
}

fn string_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            debug!(field = key, found = json_kind(other), "Ignoring invalid push field");
            None
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ==================== Display ====================

/// Data attached to a notification, handed back on click.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Display options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub data: NotificationData,
    /// Passed through to the platform untouched.
    pub actions: Vec<Value>,
    pub require_interaction: bool,
}

/// A fully resolved notification, ready for the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub title: String,
    pub options: NotificationOptions,
}

/// A notification the platform is showing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayedNotification {
    pub id: String,
    pub title: String,
    pub options: NotificationOptions,
}

/// Platform notification surface.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Show a notification. Resolves once it is displayed.
    async fn show(&self, request: NotificationRequest) -> Result<DisplayedNotification>;

    /// Close a notification. Closing an unknown or closed one is a no-op.
    async fn close(&self, id: &str) -> Result<()>;
}

/// In-memory sink. A new notification replaces an active one with the same
/// tag.
#[derive(Debug, Default)]
pub struct NotificationLog {
    active: RwLock<Vec<DisplayedNotification>>,
    shown: RwLock<Vec<DisplayedNotification>>,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently visible notifications, oldest first.
    pub async fn active(&self) -> Vec<DisplayedNotification> {
        self.active.read().await.clone()
    }

    /// Every notification ever shown.
    pub async fn shown(&self) -> Vec<DisplayedNotification> {
        self.shown.read().await.clone()
    }
}

fn next_notification_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("notification-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[async_trait]
impl NotificationSink for NotificationLog {
    async fn show(&self, request: NotificationRequest) -> Result<DisplayedNotification> {
        let displayed = DisplayedNotification {
            id: next_notification_id(),
            title: request.title,
            options: request.options,
        };

        let mut active = self.active.write().await;
        active.retain(|n| n.options.tag != displayed.options.tag);
        active.push(displayed.clone());
        self.shown.write().await.push(displayed.clone());
        Ok(displayed)
    }

    async fn close(&self, id: &str) -> Result<()> {
        self.active.write().await.retain(|n| n.id != id);
        Ok(())
    }
}

// ==================== Router ====================

/// A click on a displayed notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationClick {
    pub notification: DisplayedNotification,
    /// Action button pressed, if any.
    pub action: Option<String>,
}

impl NotificationClick {
    pub fn new(notification: DisplayedNotification) -> Self {
        Self {
            notification,
            action: None,
        }
    }
}

/// What a click did.
#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    /// An open window of the application was focused.
    Focused(ClientWindow),
    /// No window was open; a new one was opened at the target.
    Opened(ClientWindow),
}

/// Turns pushes into notifications and clicks into window focus.
pub struct NotificationRouter {
    defaults: NotificationDefaults,
    origin: Url,
    app_root: String,
    sink: Arc<dyn NotificationSink>,
    clients: Arc<dyn ClientRegistry>,
}

impl NotificationRouter {
    pub fn new(
        defaults: NotificationDefaults,
        origin: Url,
        app_root: impl Into<String>,
        sink: Arc<dyn NotificationSink>,
        clients: Arc<dyn ClientRegistry>,
    ) -> Self {
        Self {
            defaults,
            origin,
            app_root: app_root.into(),
            sink,
            clients,
        }
    }

    /// Apply defaults to a decoded payload.
    pub fn build_request(&self, payload: &PushPayload) -> NotificationRequest {
        let d = &self.defaults;
        NotificationRequest {
            title: payload.title.clone().unwrap_or_else(|| d.title.clone()),
            options: NotificationOptions {
                body: payload.body.clone().unwrap_or_default(),
                icon: payload.icon.clone().unwrap_or_else(|| d.icon.clone()),
                badge: payload.badge.clone().unwrap_or_else(|| d.badge.clone()),
                tag: payload.tag.clone().unwrap_or_else(|| d.tag.clone()),
                data: NotificationData {
                    url: payload.url.clone(),
                },
                actions: payload.actions.clone().unwrap_or_default(),
                require_interaction: payload.require_interaction.unwrap_or(false),
            },
        }
    }

    /// Show a notification for a push. A push without payload shows nothing.
    pub async fn handle_push(&self, payload: Option<&[u8]>) -> Result<Option<DisplayedNotification>> {
        let Some(raw) = payload else {
            debug!("Push without payload, nothing to show");
            return Ok(None);
        };

        let request = self.build_request(&PushPayload::decode(raw));
        let displayed = self.sink.show(request).await?;
        info!(id = %displayed.id, title = %displayed.title, tag = %displayed.options.tag, "Notification shown");
        Ok(Some(displayed))
    }

    /// Close the notification, then focus an open application window or
    /// open one at the notification's target.
    pub async fn handle_click(&self, click: &NotificationClick) -> Result<ClickOutcome> {
        let notification = &click.notification;
        if let Err(e) = self.sink.close(&notification.id).await {
            warn!(id = %notification.id, error = %e, "Closing clicked notification failed");
        }

        let target = notification
            .options
            .data
            .url
            .as_deref()
            .unwrap_or(self.app_root.as_str());
        let target = self.origin.join(target)?;

        let windows = self
            .clients
            .match_all(&ClientMatchOptions::all_windows())
            .await?;
        if let Some(window) = windows
            .iter()
            .find(|w| w.is_same_origin(&self.origin) && w.can_focus())
        {
            let focused = self.clients.focus(&window.id).await?;
            info!(client = %focused.id, action = ?click.action, "Focused existing window");
            return Ok(ClickOutcome::Focused(focused));
        }

        let opened = self.clients.open_window(&target).await?;
        info!(client = %opened.id, url = %target, action = ?click.action, "Opened window");
        Ok(ClickOutcome::Opened(opened))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::WindowClients;
    use serde_json::json;

    const ORIGIN: &str = "https://kjfc.example/";

    fn origin() -> Url {
        Url::parse(ORIGIN).unwrap()
    }

    fn router(log: Arc<NotificationLog>, clients: Arc<WindowClients>) -> NotificationRouter {
        NotificationRouter::new(NotificationDefaults::default(), origin(), "/", log, clients)
    }

    #[test]
    fn test_structured_payload_fills_defaults() {
        let payload = PushPayload::decode(br#"{"title":"Update","body":"New schedule posted"}"#);
        let request = router(Arc::default(), Arc::default()).build_request(&payload);

        assert_eq!(request.title, "Update");
        assert_eq!(request.options.body, "New schedule posted");
        assert_eq!(request.options.icon, "/icons/icon-192.png");
        assert_eq!(request.options.badge, "/icons/icon-192.png");
        assert_eq!(request.options.tag, "kjfc-notification");
        assert_eq!(request.options.data.url, None);
        assert!(request.options.actions.is_empty());
        assert!(!request.options.require_interaction);
    }

    #[test]
    fn test_text_payload_becomes_body() {
        let payload = PushPayload::decode(b"Game moved to 5pm");
        let request = router(Arc::default(), Arc::default()).build_request(&payload);
        assert_eq!(request.title, "KJFC Dashboard");
        assert_eq!(request.options.body, "Game moved to 5pm");
    }

    #[test]
    fn test_json_string_payload_is_unquoted() {
        let payload = PushPayload::decode(br#""Game moved to 5pm""#);
        assert_eq!(payload.body.as_deref(), Some("Game moved to 5pm"));
        assert_eq!(payload, PushPayload::decode(b"Game moved to 5pm"));

        let escaped = PushPayload::decode(br#""Kickoff \"early\"\n""#);
        assert_eq!(escaped.body.as_deref(), Some("Kickoff \"early\"\n"));
    }

    #[test]
    fn test_non_object_json_is_text() {
        assert_eq!(PushPayload::decode(b"42"), PushPayload::plain_text("42"));
        assert_eq!(
            PushPayload::decode(br#""quoted""#),
            PushPayload::plain_text("quoted")
        );
        assert_eq!(PushPayload::decode(b""), PushPayload::plain_text(""));
        assert!(matches!(
            PushPayload::from_value(&json!([1, 2])),
            Err(EngineError::PayloadDecode(_))
        ));
    }

    #[test]
    fn test_invalid_fields_take_defaults() {
        let payload = PushPayload::from_value(&json!({
            "title": "",
            "body": 7,
            "tag": null,
            "actions": "reply",
            "requireInteraction": "yes",
            "url": "/games/42"
        }))
        .unwrap();

        assert_eq!(
            payload,
            PushPayload {
                url: Some("/games/42".into()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_actions_pass_through_and_serialize_camel_case() {
        let payload = PushPayload::from_value(&json!({
            "actions": [{"action": "open", "title": "Open"}],
            "requireInteraction": true,
            "url": "/table"
        }))
        .unwrap();
        let request = router(Arc::default(), Arc::default()).build_request(&payload);

        let json = serde_json::to_value(&request.options).unwrap();
        assert_eq!(json["requireInteraction"], json!(true));
        assert_eq!(json["actions"][0]["action"], json!("open"));
        assert_eq!(json["data"]["url"], json!("/table"));
    }

    #[tokio::test]
    async fn test_push_without_payload_shows_nothing() {
        let log = Arc::new(NotificationLog::new());
        let router = router(log.clone(), Arc::default());
        assert_eq!(router.handle_push(None).await.unwrap(), None);
        assert!(log.shown().await.is_empty());
    }

    #[tokio::test]
    async fn test_same_tag_replaces_active_notification() {
        let log = Arc::new(NotificationLog::new());
        let router = router(log.clone(), Arc::default());

        router.handle_push(Some(b"first")).await.unwrap();
        router.handle_push(Some(b"second")).await.unwrap();
        router
            .handle_push(Some(br#"{"body":"other","tag":"scores"}"#))
            .await
            .unwrap();

        let active = log.active().await;
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].options.body, "second");
        assert_eq!(log.shown().await.len(), 3);
    }

    #[tokio::test]
    async fn test_click_focuses_open_same_origin_window() {
        let log = Arc::new(NotificationLog::new());
        let clients = Arc::new(WindowClients::new());
        clients
            .add(ClientWindow::window("other", Url::parse("https://elsewhere.example/").unwrap()))
            .await;
        clients
            .add(ClientWindow::window("app", origin().join("/schedule").unwrap()))
            .await;
        let router = router(log.clone(), clients.clone());

        let shown = router
            .handle_push(Some(br#"{"title":"Score","url":"/games/42"}"#))
            .await
            .unwrap()
            .unwrap();
        let outcome = router.handle_click(&NotificationClick::new(shown)).await.unwrap();

        match outcome {
            ClickOutcome::Focused(window) => {
                assert_eq!(window.id, "app");
                assert!(window.focused);
            }
            other => panic!("expected focus, got {other:?}"),
        }
        assert_eq!(clients.len().await, 2);
        assert!(log.active().await.is_empty());
    }

    #[tokio::test]
    async fn test_click_opens_window_at_target_when_none_open() {
        let log = Arc::new(NotificationLog::new());
        let clients = Arc::new(WindowClients::new());
        let router = router(log.clone(), clients.clone());

        let shown = router
            .handle_push(Some(br#"{"url":"/games/42"}"#))
            .await
            .unwrap()
            .unwrap();
        let click = NotificationClick::new(shown);
        let outcome = router.handle_click(&click).await.unwrap();

        match outcome {
            ClickOutcome::Opened(window) => {
                assert_eq!(window.url.as_str(), "https://kjfc.example/games/42");
            }
            other => panic!("expected a new window, got {other:?}"),
        }
        assert_eq!(clients.len().await, 1);

        // A second click finds the window opened by the first.
        assert!(matches!(
            router.handle_click(&click).await.unwrap(),
            ClickOutcome::Focused(_)
        ));
    }

    #[tokio::test]
    async fn test_click_without_url_opens_app_root() {
        let router = router(Arc::default(), Arc::default());
        let shown = router.handle_push(Some(b"ping")).await.unwrap().unwrap();

        match router.handle_click(&NotificationClick::new(shown)).await.unwrap() {
            ClickOutcome::Opened(window) => assert_eq!(window.url.as_str(), ORIGIN),
            other => panic!("expected a new window, got {other:?}"),
        }
    }
}
