//! Audit logging for session, token and authorization-code lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the whole event as one
//! JSON field, so the trail is queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `login.succeeded` | Credentials verified and a session created |
//! | `login.failed` | Unknown user, wrong password or inactive account |
//! | `user.registered` | A new account was created |
//! | `session.created` | A refresh session was created |
//! | `session.rotated` | A session secret was rotated |
//! | `session.revoked` | A session was revoked (logout or replay) |
//! | `session.replay_detected` | A superseded secret was presented |
//! | `token.issued` | An access token was minted |
//! | `token.rejected` | A bearer token failed authentication |
//! | `code.issued` | An authorization code was issued |
//! | `code.redeemed` | An authorization code was exchanged |
//! | `code.rejected` | A code exchange failed |
//!
//! Secrets never appear in events.

use std::net::IpAddr;

use serde::Serialize;

/// Structured audit event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"session.created"`).
    pub event: &'static str,
    /// Affected user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Affected session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// OAuth client involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Client IP address (when available).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    /// Reason for denial or revocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            ..Self::default()
        }
    }

    /// `login.succeeded`
    #[must_use]
    pub fn login_succeeded(user_id: &str, session_id: &str) -> Self {
        Self::new("login.succeeded")
            .user(user_id)
            .session(session_id)
    }

    /// `login.failed`. The reason is for operators only.
    #[must_use]
    pub fn login_failed(reason: impl Into<String>) -> Self {
        Self::new("login.failed").reason(reason)
    }

    /// `user.registered`
    #[must_use]
    pub fn user_registered(user_id: &str) -> Self {
        Self::new("user.registered").user(user_id)
    }

    /// `session.created`
    #[must_use]
    pub fn session_created(user_id: &str, session_id: &str) -> Self {
        Self::new("session.created").user(user_id).session(session_id)
    }

    /// `session.rotated`
    #[must_use]
    pub fn session_rotated(user_id: &str, session_id: &str) -> Self {
        Self::new("session.rotated").user(user_id).session(session_id)
    }

    /// `session.revoked`
    #[must_use]
    pub fn session_revoked(session_id: &str, reason: impl Into<String>) -> Self {
        Self::new("session.revoked").session(session_id).reason(reason)
    }

    /// `session.replay_detected`
    #[must_use]
    pub fn replay_detected(user_id: &str, session_id: &str) -> Self {
        Self::new("session.replay_detected")
            .user(user_id)
            .session(session_id)
    }

    /// `token.issued`
    #[must_use]
    pub fn token_issued(user_id: &str, session_id: &str) -> Self {
        Self::new("token.issued").user(user_id).session(session_id)
    }

    /// `token.rejected`
    #[must_use]
    pub fn token_rejected(reason: impl Into<String>) -> Self {
        Self::new("token.rejected").reason(reason)
    }

    /// `code.issued`
    #[must_use]
    pub fn code_issued(user_id: &str, client_id: &str) -> Self {
        Self::new("code.issued").user(user_id).client(client_id)
    }

    /// `code.redeemed`
    #[must_use]
    pub fn code_redeemed(user_id: &str, client_id: &str) -> Self {
        Self::new("code.redeemed").user(user_id).client(client_id)
    }

    /// `code.rejected`
    #[must_use]
    pub fn code_rejected(client_id: &str, reason: impl Into<String>) -> Self {
        Self::new("code.rejected").client(client_id).reason(reason)
    }

    /// Attach the client IP.
    #[must_use]
    pub fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    fn client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO idgate::audit audit={"event":"session.created","user_id":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "idgate audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_events_carry_ids() {
        let event = AuditEvent::session_rotated("u1", "s1");
        assert_eq!(event.event, "session.rotated");
        assert_eq!(event.user_id.as_deref(), Some("u1"));
        assert_eq!(event.session_id.as_deref(), Some("s1"));
        assert!(event.reason.is_none());
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let json = serde_json::to_value(AuditEvent::login_failed("unknown user")).unwrap();
        assert_eq!(json["event"], "login.failed");
        assert_eq!(json["reason"], "unknown user");
        assert!(json.get("user_id").is_none());
        assert!(json.get("client_ip").is_none());
    }

    #[test]
    fn ip_is_attached() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let event = AuditEvent::code_issued("u1", "app").with_ip(Some(ip));
        assert_eq!(event.client_ip, Some(ip));
        assert_eq!(event.client_id.as_deref(), Some("app"));
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::replay_detected("u1", "s1"));
    }
}
