//! End-to-end tests for the HTTP surface.
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`; every
//! store is in memory and the signing keys come from `tests/fixtures/keys`.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, Response, StatusCode, header},
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use idgate::{
    config::Config,
    keys::KeyStore,
    oidc::{Client, InMemoryClientRegistry, InMemoryCodeStore, pkce},
    permission::{InMemoryPermissionStore, Role, SYSTEM_SERVICE_CODE},
    revocation::InMemoryKvStore,
    server::{AppContext, Stores, create_router},
    session::InMemorySessionStore,
    auth::InMemoryUserRepository,
};

const KEYS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/keys");
const REDIRECT: &str = "https://app.test/callback";
const PASSWORD: &str = "correct horse battery staple";
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

struct Harness {
    app: Router,
    roles: Arc<InMemoryPermissionStore>,
}

fn harness() -> Harness {
    let mut config = Config::default();
    config.auth.issuer = "https://id.test".into();
    config.oidc.base_url = "https://id.test".into();

    let roles = Arc::new(InMemoryPermissionStore::new());
    let stores = Stores {
        users: Arc::new(InMemoryUserRepository::new()),
        sessions: Arc::new(InMemorySessionStore::new()),
        roles: roles.clone(),
        kv: Arc::new(InMemoryKvStore::new()),
        clients: Arc::new(InMemoryClientRegistry::with_clients([Client {
            client_id: "app".into(),
            name: "App".into(),
            domain: "app.test".into(),
            redirect_uris: vec![REDIRECT.into()],
            allowed_scopes: vec!["openid".into(), "profile".into()],
            active: true,
        }])),
        codes: Arc::new(InMemoryCodeStore::new()),
    };
    let keys = KeyStore::load(KEYS, "2025b").unwrap();
    let ctx = Arc::new(AppContext::new(config, keys, stores));

    Harness {
        app: create_router(ctx),
        roles,
    }
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn post_json(&self, uri: &str, body: &Value) -> Response<Body> {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn register(&self, username: &str) -> Value {
        let resp = self
            .post_json(
                "/v1/auth/register",
                &json!({"username": username, "email": format!("{username}@example.com"), "password": PASSWORD}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await
    }

    /// Log in; returns the response body and the session cookie pair.
    async fn login(&self, username: &str) -> (Value, String) {
        let resp = self
            .post_json(
                "/v1/auth/login",
                &json!({"username": username, "password": PASSWORD}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cookie = session_cookie(&resp);
        (body_json(resp).await, cookie)
    }

    async fn userinfo(&self, token: &str) -> Response<Body> {
        self.send(
            Request::get("/v1/user/info")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

async fn body_json(resp: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// `session=<sid>:<secret>` from the `Set-Cookie` header.
fn session_cookie(resp: &Response<Body>) -> String {
    resp.headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn health_jwks_and_discovery_are_public() {
    let h = harness();

    let health = h
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(health.status(), StatusCode::OK);

    for path in ["/.well-known/jwks.json", "/v1/.well-known/jwks.json"] {
        let resp = h.send(Request::get(path).body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let jwks = body_json(resp).await;
        let kids: Vec<&str> = jwks["keys"]
            .as_array()
            .unwrap()
            .iter()
            .map(|k| k["kid"].as_str().unwrap())
            .collect();
        assert_eq!(kids, vec!["key-2024a", "key-2025b"]);
    }

    let resp = h
        .send(
            Request::get("/.well-known/openid-configuration")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let doc = body_json(resp).await;
    assert_eq!(doc["issuer"], "https://id.test");
    assert_eq!(
        doc["authorization_endpoint"],
        "https://id.test/v1/oauth/authorize"
    );
    assert_eq!(doc["jwks_uri"], "https://id.test/v1/.well-known/jwks.json");
    assert_eq!(doc["code_challenge_methods_supported"], json!(["S256"]));
}

#[tokio::test]
async fn login_sets_cookie_and_token_reaches_userinfo() {
    // GIVEN: a registered user
    let h = harness();
    let profile = h.register("ada").await;

    // WHEN: logging in
    let resp = h
        .post_json(
            "/v1/auth/login",
            &json!({"username": "ada", "password": PASSWORD}),
        )
        .await;

    // THEN: an HttpOnly, Secure session cookie is set
    assert_eq!(resp.status(), StatusCode::OK);
    let set_cookie = resp
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(set_cookie.starts_with("session="));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("; Secure"));
    let body = body_json(resp).await;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["user"]["username"], "ada");
    assert_eq!(
        set_cookie.split(';').next().unwrap(),
        format!(
            "session={}:{}",
            body["refresh_sid"].as_str().unwrap(),
            body["refresh_token"].as_str().unwrap()
        )
    );

    // AND: the access token opens userinfo
    let info = h.userinfo(body["access_token"].as_str().unwrap()).await;
    assert_eq!(info.status(), StatusCode::OK);
    assert_eq!(body_json(info).await["id"], profile["id"]);
}

#[tokio::test]
async fn bad_password_is_a_generic_401() {
    let h = harness();
    h.register("ada").await;

    let resp = h
        .post_json(
            "/v1/auth/login",
            &json!({"username": "ada", "password": "wrong"}),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().get(header::SET_COOKIE).is_none());
    assert_eq!(body_json(resp).await["error"], "invalid_credentials");
}

#[tokio::test]
async fn protected_route_challenges_without_token() {
    let h = harness();

    let missing = h
        .send(Request::get("/v1/user/info").body(Body::empty()).unwrap())
        .await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        missing.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer"
    );

    let garbage = h.userinfo("not.a.jwt").await;
    assert_eq!(garbage.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_rotates_and_replay_kills_the_session() {
    // GIVEN: a logged-in user
    let h = harness();
    h.register("ada").await;
    let (first, cookie) = h.login("ada").await;

    // WHEN: refreshing with the cookie
    let refresh = |cookie: String| {
        Request::post("/v1/auth/refresh")
            .header(header::COOKIE, cookie)
            .body(Body::empty())
            .unwrap()
    };
    let resp = h.send(refresh(cookie.clone())).await;

    // THEN: a new secret for the same session
    assert_eq!(resp.status(), StatusCode::OK);
    let rotated_cookie = session_cookie(&resp);
    let rotated = body_json(resp).await;
    assert_eq!(rotated["refresh_sid"], first["refresh_sid"]);
    assert_ne!(rotated["refresh_token"], first["refresh_token"]);

    // WHEN: the old secret is replayed
    let replay = h.send(refresh(cookie)).await;

    // THEN: rejected, and everything tied to the session stops working
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(replay).await["error"], "invalid_session");
    assert_eq!(
        h.send(refresh(rotated_cookie)).await.status(),
        StatusCode::UNAUTHORIZED
    );
    let info = h.userinfo(rotated["access_token"].as_str().unwrap()).await;
    assert_eq!(info.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_accepts_body_credential() {
    let h = harness();
    h.register("ada").await;
    let (first, _) = h.login("ada").await;

    let resp = h
        .post_json(
            "/v1/auth/refresh",
            &json!({"refresh_sid": first["refresh_sid"], "refresh_token": first["refresh_token"]}),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn logout_revokes_outstanding_tokens() {
    let h = harness();
    h.register("ada").await;
    let (body, cookie) = h.login("ada").await;
    let token = body["access_token"].as_str().unwrap().to_string();

    let resp = h
        .send(
            Request::post("/v1/auth/logout")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(
        resp.headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("Max-Age=0")
    );
    assert_eq!(h.userinfo(&token).await.status(), StatusCode::UNAUTHORIZED);
}

fn authorize_uri(extra: &[(&str, &str)]) -> String {
    let mut params = vec![
        ("response_type", "code"),
        ("client_id", "app"),
        ("redirect_uri", REDIRECT),
        ("scope", "openid profile"),
        ("state", "a b&c"),
    ];
    params.extend_from_slice(extra);
    format!(
        "/v1/oauth/authorize?{}",
        serde_urlencoded::to_string(&params).unwrap()
    )
}

#[tokio::test]
async fn authorization_code_flow_with_pkce() {
    // GIVEN: a logged-in user and a PKCE pair
    let h = harness();
    let profile = h.register("ada").await;
    let (_, cookie) = h.login("ada").await;
    let challenge = pkce::challenge_for(VERIFIER);

    // WHEN: the browser hits the authorization endpoint with the session cookie
    let resp = h
        .send(
            Request::get(authorize_uri(&[
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ]))
            .header(header::COOKIE, cookie)
            .body(Body::empty())
            .unwrap(),
        )
        .await;

    // THEN: redirected back with a code and the state, properly encoded
    assert_eq!(resp.status(), StatusCode::FOUND);
    let location = url::Url::parse(
        resp.headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(
        location.as_str().split('?').next().unwrap(),
        REDIRECT
    );
    let pairs: std::collections::HashMap<String, String> =
        location.query_pairs().into_owned().collect();
    assert_eq!(pairs["state"], "a b&c");
    let code = pairs["code"].clone();

    // WHEN: the client exchanges the code with the verifier
    let exchange = |verifier: &str| {
        Request::post("/v1/oauth/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(
                serde_urlencoded::to_string([
                    ("grant_type", "authorization_code"),
                    ("code", code.as_str()),
                    ("redirect_uri", REDIRECT),
                    ("client_id", "app"),
                    ("code_verifier", verifier),
                ])
                .unwrap(),
            ))
            .unwrap()
    };
    let resp = h.send(exchange(VERIFIER)).await;

    // THEN: an access token for the user, never cached
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    let tokens = body_json(resp).await;
    assert_eq!(tokens["scope"], "openid profile");
    let info = h.userinfo(tokens["access_token"].as_str().unwrap()).await;
    assert_eq!(body_json(info).await["id"], profile["id"]);

    // AND: the code is single-use
    let again = h.send(exchange(VERIFIER)).await;
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(again).await["error"], "invalid_grant");
}

#[tokio::test]
async fn wrong_verifier_burns_the_code() {
    let h = harness();
    h.register("ada").await;
    let (_, cookie) = h.login("ada").await;
    let challenge = pkce::challenge_for(VERIFIER);
    let resp = h
        .send(
            Request::get(authorize_uri(&[
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ]))
            .header(header::COOKIE, cookie)
            .body(Body::empty())
            .unwrap(),
        )
        .await;
    let location = resp.headers().get(header::LOCATION).unwrap().to_str().unwrap();
    let code = url::Url::parse(location)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "code")
        .unwrap()
        .1
        .into_owned();

    let form = |verifier: &str| {
        serde_urlencoded::to_string([
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT),
            ("client_id", "app"),
            ("code_verifier", verifier),
        ])
        .unwrap()
    };
    let post = |body: String| {
        Request::post("/v1/oauth/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    };

    let wrong = h
        .send(post(form("x".repeat(43).as_str())))
        .await;
    assert_eq!(wrong.status(), StatusCode::BAD_REQUEST);

    let right = h.send(post(form(VERIFIER))).await;
    assert_eq!(right.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(right).await["error"], "invalid_grant");
}

#[tokio::test]
async fn authorize_requires_fields_then_login() {
    let h = harness();

    let missing = h
        .send(
            Request::get("/v1/oauth/authorize?response_type=code&redirect_uri=x&scope=openid")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    let body = body_json(missing).await;
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(body["message"], "client_id is required");

    let anonymous = h
        .send(Request::get(authorize_uri(&[])).body(Body::empty()).unwrap())
        .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(anonymous).await["error"], "login_required");

    let bogus_cookie = h
        .send(
            Request::get(authorize_uri(&[]))
                .header(header::COOKIE, "session=not-a-credential")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(bogus_cookie.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unregistered_redirect_is_rejected() {
    let h = harness();
    h.register("ada").await;
    let (_, cookie) = h.login("ada").await;

    let resp = h
        .send(
            Request::get(format!(
                "/v1/oauth/authorize?{}",
                serde_urlencoded::to_string([
                    ("response_type", "code"),
                    ("client_id", "app"),
                    ("redirect_uri", "https://evil.test/callback"),
                    ("scope", "openid"),
                ])
                .unwrap()
            ))
            .header(header::COOKIE, cookie)
            .body(Body::empty())
            .unwrap(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(resp.headers().get(header::LOCATION).is_none());
    assert_eq!(body_json(resp).await["error"], "invalid_redirect_uri");
}

#[tokio::test]
async fn admin_route_needs_manage_users() {
    // GIVEN: an admin holding MANAGE_USERS on idgate, a role admin, and a plain user
    let h = harness();
    let admin = h.register("root").await;
    let user = h.register("ada").await;
    h.roles
        .upsert_role(Role::new("user-admin", SYSTEM_SERVICE_CODE, None, &[0]).unwrap());
    h.roles
        .assign_role(admin["id"].as_str().unwrap(), "user-admin")
        .unwrap();
    let reader = h.register("grace").await;
    h.roles
        .upsert_role(Role::new("role-admin", SYSTEM_SERVICE_CODE, None, &[1]).unwrap());
    h.roles
        .assign_role(reader["id"].as_str().unwrap(), "role-admin")
        .unwrap();
    let (admin_login, _) = h.login("root").await;
    let (user_login, _) = h.login("ada").await;
    let (reader_login, _) = h.login("grace").await;

    let revoke = |token: &str| {
        Request::delete(format!(
            "/v1/admin/users/{}/sessions",
            user["id"].as_str().unwrap()
        ))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
    };

    // WHEN/THEN: a token without the idgate audience is not accepted at all
    let denied = h
        .send(revoke(user_login["access_token"].as_str().unwrap()))
        .await;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    // WHEN/THEN: the right audience with the wrong bit is forbidden
    let forbidden = h
        .send(revoke(reader_login["access_token"].as_str().unwrap()))
        .await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    // WHEN/THEN: the admin revokes the user's session
    let allowed = h
        .send(revoke(admin_login["access_token"].as_str().unwrap()))
        .await;
    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(body_json(allowed).await["revoked"], 1);
}

#[tokio::test]
async fn admin_revocation_cuts_off_existing_tokens() {
    // GIVEN: a user-admin and a user with a working access token
    let h = harness();
    let admin = h.register("root").await;
    let user = h.register("ada").await;
    h.roles
        .upsert_role(Role::new("user-admin", SYSTEM_SERVICE_CODE, None, &[0]).unwrap());
    h.roles
        .assign_role(admin["id"].as_str().unwrap(), "user-admin")
        .unwrap();
    let (admin_login, _) = h.login("root").await;
    let (user_login, cookie) = h.login("ada").await;
    let token = user_login["access_token"].as_str().unwrap();
    assert_eq!(h.userinfo(token).await.status(), StatusCode::OK);

    // WHEN: the admin revokes every session of the user
    let resp = h
        .send(
            Request::delete(format!(
                "/v1/admin/users/{}/sessions",
                user["id"].as_str().unwrap()
            ))
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", admin_login["access_token"].as_str().unwrap()),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    // THEN: the outstanding access token and the session cookie are both dead
    assert_eq!(h.userinfo(token).await.status(), StatusCode::UNAUTHORIZED);
    let refresh = h
        .send(
            Request::post("/v1/auth/refresh")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(refresh.status(), StatusCode::UNAUTHORIZED);
    // AND: the admin's own token still works
    assert_eq!(
        h.userinfo(admin_login["access_token"].as_str().unwrap())
            .await
            .status(),
        StatusCode::OK
    );
}
