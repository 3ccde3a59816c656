use axum::async_trait;
use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use service_core::error::AppError;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const ADMIN_ROLE: &str = "admin";

/// Caller identity as asserted by the upstream gateway.
///
/// Both headers are trusted as-is: this service sits behind the
/// authenticating gateway and is not exposed directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: Uuid,
    pub role: String,
}

impl UserContext {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }

    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|r| r == &self.role)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing X-User-ID header")))?;

        let user_id = Uuid::parse_str(raw.trim())
            .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid X-User-ID header")))?;

        let role = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("user")
            .to_string();

        tracing::Span::current().record("user_id", tracing::field::display(user_id));

        Ok(UserContext { user_id, role })
    }
}

/// Reject non-admin callers before the handler runs.
pub async fn require_admin(
    user: UserContext,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !user.is_admin() {
        tracing::warn!(user_id = %user.user_id, role = %user.role, "Admin route denied");
        return Err(AppError::Forbidden(anyhow::anyhow!("Admin role required")));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    async fn extract(builder: axum::http::request::Builder) -> Result<UserContext, AppError> {
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        UserContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_user_and_defaults_role() {
        let id = Uuid::new_v4();
        let ctx = extract(HttpRequest::builder().header(USER_ID_HEADER, id.to_string()))
            .await
            .unwrap();
        assert_eq!(ctx.user_id, id);
        assert_eq!(ctx.role, "user");
        assert!(!ctx.is_admin());
    }

    #[tokio::test]
    async fn missing_or_malformed_id_is_unauthorized() {
        assert!(matches!(
            extract(HttpRequest::builder()).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            extract(HttpRequest::builder().header(USER_ID_HEADER, "not-a-uuid")).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn reads_role_header() {
        let ctx = extract(
            HttpRequest::builder()
                .header(USER_ID_HEADER, Uuid::new_v4().to_string())
                .header(USER_ROLE_HEADER, "admin"),
        )
        .await
        .unwrap();
        assert!(ctx.is_admin());
        assert!(ctx.has_any_role(&["admin".to_string()]));
    }
}
