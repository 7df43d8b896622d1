use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

/// Helper to create a JSON error response with a standard `{ "error": message }` body.
fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

/// Request-time error taxonomy. Mapped to a structured HTTP response at the
/// boundary; handlers and services return it through `?`.
pub enum AppError {
    /// No valid authenticator on a protected route.
    Unauthorized(String),
    /// Authenticated but missing a rule, or a protected mutation
    /// (self-role modification, system-role deletion, initial-admin
    /// deletion, uninstall of a core plugin).
    Forbidden(String),
    /// Missing role, team, application, or hook target.
    NotFound(String),
    /// Invalid input, weak password, disabled credential strategy,
    /// already-completed onboarding.
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        error_response(status, message)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {msg}"),
            AppError::NotFound(msg) => write!(f, "Not Found: {msg}"),
            AppError::BadRequest(msg) => write!(f, "Bad Request: {msg}"),
            AppError::Internal(msg) => write!(f, "Internal Error: {msg}"),
        }
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".into()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<plinth_data::DataError> for AppError {
    fn from(err: plinth_data::DataError) -> Self {
        match err {
            plinth_data::DataError::NotFound => AppError::NotFound("row not found".into()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<plinth_events::EventError> for AppError {
    fn from(err: plinth_events::EventError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Boot-time errors. All fatal: startup aborts.
#[derive(Debug)]
pub enum BootError {
    /// The Phase 2 dependency graph has a cycle.
    DependencyCycle { cycle: Vec<String> },
    /// A plugin declared a dependency on a service nobody provides.
    MissingDependency { plugin: String, service: String },
    /// A registered contract references an access rule the plugin never
    /// declared.
    UnregisteredRule { plugin: String, rule: String },
    /// A plugin requested for install is not present in the build.
    UnknownPlugin { plugin: String },
    /// A plugin's register or init phase failed.
    PluginInit { plugin: String, message: String },
    /// The platform database is unreachable or a core query failed.
    Database(String),
    /// The event broker is unreachable.
    BrokerUnavailable(String),
    /// Environment configuration is missing or malformed.
    Config(String),
}

impl std::fmt::Display for BootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootError::DependencyCycle { cycle } => {
                write!(f, "dependency cycle between plugins: {}", cycle.join(" -> "))
            }
            BootError::MissingDependency { plugin, service } => write!(
                f,
                "plugin '{plugin}' depends on service '{service}' which no plugin provides"
            ),
            BootError::UnregisteredRule { plugin, rule } => write!(
                f,
                "contract of plugin '{plugin}' references access rule '{rule}' that was never declared"
            ),
            BootError::UnknownPlugin { plugin } => {
                write!(f, "plugin '{plugin}' is not present in this build")
            }
            BootError::PluginInit { plugin, message } => {
                write!(f, "plugin '{plugin}' failed to initialize: {message}")
            }
            BootError::Database(msg) => write!(f, "database error during boot: {msg}"),
            BootError::BrokerUnavailable(msg) => write!(f, "event broker unavailable: {msg}"),
            BootError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for BootError {}

impl From<sqlx::Error> for BootError {
    fn from(err: sqlx::Error) -> Self {
        BootError::Database(err.to_string())
    }
}

impl From<plinth_events::EventError> for BootError {
    fn from(err: plinth_events::EventError) -> Self {
        match err {
            plinth_events::EventError::BrokerUnavailable(msg) => BootError::BrokerUnavailable(msg),
            other => BootError::Database(other.to_string()),
        }
    }
}

impl From<plinth_data::DataError> for BootError {
    fn from(err: plinth_data::DataError) -> Self {
        BootError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn error_parts(err: AppError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn unauthorized_maps_to_401() {
        let (status, body) = error_parts(AppError::Unauthorized("no token".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "no token");
    }

    #[tokio::test]
    async fn forbidden_maps_to_403() {
        let (status, _) = error_parts(AppError::Forbidden("missing rule".into())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let (status, _) = error_parts(AppError::NotFound("no such team".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn cycle_error_names_participants() {
        let err = BootError::DependencyCycle {
            cycle: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("a -> b"));
    }
}
