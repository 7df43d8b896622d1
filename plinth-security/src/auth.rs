//! Request authentication.
//!
//! Exactly one authenticator wins per request, tried in order: service
//! token, application bearer token, session user. Anything else is an
//! anonymous caller carrying the (cached) `anonymous` role rules.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use plinth_core::{AppError, Authenticator, Caller, Principal};

use crate::rules::{ROLE_ADMIN, ROLE_ANONYMOUS, WILDCARD_RULE};
use crate::service_token::ServiceTokenKeys;
use crate::strategy::{AuthenticationStrategy, SessionUser};
use crate::tokens;

/// The anonymous-rules cache lives for 60 seconds; admin edits become
/// visible within that window (eventual consistency, by decision).
const ANONYMOUS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Read-mostly cache of the `anonymous` role's access rules.
pub struct AnonymousRuleCache {
    entry: RwLock<Option<(Instant, Vec<String>)>>,
    ttl: Duration,
}

impl AnonymousRuleCache {
    pub fn new() -> Self {
        Self::with_ttl(ANONYMOUS_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            ttl,
        }
    }

    pub async fn get(&self, pool: &PgPool) -> Result<Vec<String>, AppError> {
        {
            let entry = self.entry.read().await;
            if let Some((at, rules)) = entry.as_ref() {
                if at.elapsed() < self.ttl {
                    return Ok(rules.clone());
                }
            }
        }

        let rules = load_role_rules(pool, ROLE_ANONYMOUS).await?;
        *self.entry.write().await = Some((Instant::now(), rules.clone()));
        Ok(rules)
    }

    /// Drop the cached entry. Test hook.
    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }
}

impl Default for AnonymousRuleCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn load_role_rules(pool: &PgPool, role_id: &str) -> Result<Vec<String>, AppError> {
    let rows = sqlx::query("SELECT access_rule_id FROM role_access_rule WHERE role_id = $1")
        .bind(role_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|r| r.get("access_rule_id")).collect())
}

/// Deduplicated union of access rules across a set of role ids; holding
/// `admin` collapses to the single wildcard.
async fn rules_for_roles(pool: &PgPool, role_ids: &[String]) -> Result<Vec<String>, AppError> {
    if role_ids.iter().any(|r| r == ROLE_ADMIN) {
        return Ok(vec![WILDCARD_RULE.to_string()]);
    }
    if role_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        "SELECT DISTINCT access_rule_id FROM role_access_rule WHERE role_id = ANY($1)",
    )
    .bind(role_ids)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("access_rule_id")).collect())
}

/// The platform authenticator.
pub struct AuthService {
    pool: PgPool,
    keys: Arc<ServiceTokenKeys>,
    strategy: Option<Arc<dyn AuthenticationStrategy>>,
    anonymous: AnonymousRuleCache,
}

impl AuthService {
    pub fn new(
        pool: PgPool,
        keys: Arc<ServiceTokenKeys>,
        strategy: Option<Arc<dyn AuthenticationStrategy>>,
    ) -> Self {
        Self {
            pool,
            keys,
            strategy,
            anonymous: AnonymousRuleCache::new(),
        }
    }

    pub fn anonymous_cache(&self) -> &AnonymousRuleCache {
        &self.anonymous
    }

    /// Validate an application bearer token and assemble its principal.
    async fn authenticate_application(&self, token: &str) -> Result<Caller, AppError> {
        let parsed = tokens::parse_token(token)
            .ok_or_else(|| AppError::Unauthorized("malformed application token".into()))?;

        let row = sqlx::query(
            "SELECT id, name, secret_hash FROM application WHERE id = $1",
        )
        .bind(parsed.application_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::Unauthorized("unknown application".into()))?;

        let secret_hash: String = row.get("secret_hash");
        if !tokens::verify_secret(&parsed.secret, &secret_hash) {
            return Err(AppError::Unauthorized("invalid application secret".into()));
        }

        let id: Uuid = row.get("id");
        let name: String = row.get("name");

        // Usage tracking must not add latency to the request.
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = sqlx::query("UPDATE application SET last_used_at = now() WHERE id = $1")
                .bind(id)
                .execute(&pool)
                .await
            {
                warn!(application = %id, error = %e, "failed to record application usage");
            }
        });

        let role_ids: Vec<String> = sqlx::query(
            "SELECT role_id FROM application_role WHERE application_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| r.get("role_id"))
        .collect();
        let access_rules = rules_for_roles(&self.pool, &role_ids).await?;

        let team_ids: Vec<Uuid> = sqlx::query(
            "SELECT team_id FROM application_team WHERE application_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| r.get("team_id"))
        .collect();

        debug!(application = %id, "application authenticated");
        Ok(Caller::Application(Principal {
            id: id.to_string(),
            name: Some(name),
            email: None,
            access_rules,
            team_ids,
        }))
    }

    /// Enrich a session user with roles, rules and team memberships.
    pub async fn enrich_session_user(&self, user: SessionUser) -> Result<Caller, AppError> {
        let role_ids: Vec<String> = sqlx::query("SELECT role_id FROM user_role WHERE user_id = $1")
            .bind(&user.id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get("role_id"))
            .collect();
        let access_rules = rules_for_roles(&self.pool, &role_ids).await?;

        let team_ids: Vec<Uuid> = sqlx::query("SELECT team_id FROM user_team WHERE user_id = $1")
            .bind(&user.id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get("team_id"))
            .collect();

        Ok(Caller::User(Principal {
            id: user.id,
            name: user.name,
            email: Some(user.email),
            access_rules,
            team_ids,
        }))
    }

    async fn anonymous_caller(&self) -> Result<Caller, AppError> {
        Ok(Caller::Anonymous {
            access_rules: self.anonymous.get(&self.pool).await?,
        })
    }
}

fn bearer_value(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[async_trait]
impl Authenticator for AuthService {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, AppError> {
        if let Some(token) = bearer_value(headers) {
            if tokens::looks_like_token(token) {
                return self.authenticate_application(token).await;
            }
            if let Ok(claims) = self.keys.verify(token) {
                return Ok(Caller::Service {
                    plugin_id: claims.service,
                });
            }
            // Not one of ours; a session strategy may still claim it below.
        }

        if let Some(strategy) = &self.strategy {
            if let Some(user) = strategy.authenticate(headers).await? {
                return self.enrich_session_user(user).await;
            }
        }

        self.anonymous_caller().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool")
    }

    fn service(keys: Arc<ServiceTokenKeys>) -> AuthService {
        AuthService::new(lazy_pool(), keys, None)
    }

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn valid_service_token_wins() {
        let keys = Arc::new(ServiceTokenKeys::generate("test"));
        let auth = service(keys.clone());
        let token = keys.sign("catalog").unwrap();

        let caller = auth.authenticate(&headers_with_bearer(&token)).await.unwrap();
        assert!(matches!(
            caller,
            Caller::Service { plugin_id } if plugin_id == "catalog"
        ));
    }

    #[tokio::test]
    async fn malformed_application_token_is_unauthorized() {
        let keys = Arc::new(ServiceTokenKeys::generate("test"));
        let auth = service(keys);

        let result = auth
            .authenticate(&headers_with_bearer("ck_not-a-valid-token"))
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn bearer_extraction_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_value(&headers).is_none());

        let headers = headers_with_bearer("tok");
        assert_eq!(bearer_value(&headers), Some("tok"));
    }

    #[tokio::test]
    async fn anonymous_cache_serves_within_ttl() {
        // Prime the cache manually, then read through it without a live
        // database: a hit inside the TTL never touches the pool.
        let cache = AnonymousRuleCache::with_ttl(Duration::from_secs(60));
        *cache.entry.write().await =
            Some((Instant::now(), vec!["portal.landing".to_string()]));

        let rules = cache.get(&lazy_pool()).await.unwrap();
        assert_eq!(rules, vec!["portal.landing".to_string()]);

        cache.invalidate().await;
        assert!(cache.entry.read().await.is_none());
    }
}
