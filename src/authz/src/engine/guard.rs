//! Access control around protected operations

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::{AuthorizationResolver, Resolution};
use crate::event::Decision;
use crate::types::{Action, Role, UserId};

/// Standardized refusal shown to end users
///
/// The message never says why; `reference` matches the `event_id` of the
/// audit event so operators can look the refusal up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("access denied")]
pub struct AccessDenied {
    /// Audit event id of the refused resolution
    pub reference: Uuid,

    /// `Denied` or `Error`
    pub decision: Decision,
}

/// Runs an operation only when the resolver grants it
#[derive(Clone)]
pub struct AccessControlGuard {
    resolver: Arc<AuthorizationResolver>,
}

impl AccessControlGuard {
    pub fn new(resolver: Arc<AuthorizationResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<AuthorizationResolver> {
        &self.resolver
    }

    /// Resolve, then run `operation` if and only if the decision is `Granted`
    pub async fn enforce<T, F, Fut>(
        &self,
        user_id: impl Into<UserId>,
        required_role: Role,
        action: &Action,
        operation: F,
    ) -> Result<T, AccessDenied>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let resolution = self.resolver.resolve_for(user_id, action, required_role).await;
        Self::admit(&resolution)?;
        Ok(operation().await)
    }

    /// Like [`enforce`](Self::enforce) with the required role from the action policy
    pub async fn enforce_action<T, F, Fut>(
        &self,
        user_id: impl Into<UserId>,
        action: &Action,
        operation: F,
    ) -> Result<T, AccessDenied>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let resolution = self.resolver.resolve(user_id, action).await;
        Self::admit(&resolution)?;
        Ok(operation().await)
    }

    /// Wrap a handler so every call goes through the guard
    pub fn protect<F>(
        &self,
        action: impl Into<String>,
        required_role: Option<Role>,
        handler: F,
    ) -> ProtectedOperation<F> {
        ProtectedOperation {
            guard: self.clone(),
            action: Action::new(action),
            required_role,
            handler,
        }
    }

    fn admit(resolution: &Resolution) -> Result<(), AccessDenied> {
        if resolution.is_granted() {
            Ok(())
        } else {
            Err(AccessDenied {
                reference: resolution.event.event_id,
                decision: resolution.decision,
            })
        }
    }
}

/// A handler bound to an action and guarded on every call
pub struct ProtectedOperation<F> {
    guard: AccessControlGuard,
    action: Action,
    required_role: Option<Role>,
    handler: F,
}

impl<F> ProtectedOperation<F> {
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Invoke the handler for `user_id` if allowed
    pub async fn call<T, Fut>(&self, user_id: impl Into<UserId>) -> Result<T, AccessDenied>
    where
        F: Fn(UserId) -> Fut,
        Fut: Future<Output = T>,
    {
        let user_id = user_id.into();
        let resolution = match self.required_role {
            Some(required) => {
                self.guard
                    .resolver
                    .resolve_for(user_id, &self.action, required)
                    .await
            }
            None => self.guard.resolver.resolve(user_id, &self.action).await,
        };
        AccessControlGuard::admit(&resolution)?;
        Ok((self.handler)(user_id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, MemoryAuditSink, SecurityAuditService};
    use crate::engine::{CacheConfig, ResolverConfig, RoleCache};
    use crate::source::InMemoryRoleSource;
    use crate::types::RoleAssignment;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(source: InMemoryRoleSource) -> AccessControlGuard {
        let audit = Arc::new(SecurityAuditService::new(
            AuditConfig::default(),
            Arc::new(MemoryAuditSink::new()),
        ));
        let cache = Arc::new(RoleCache::new(CacheConfig::default()).unwrap());
        let resolver =
            AuthorizationResolver::new(ResolverConfig::default(), cache, Arc::new(source), audit)
                .unwrap();
        AccessControlGuard::new(Arc::new(resolver))
    }

    #[tokio::test]
    async fn test_granted_runs_operation() {
        let guard = guard(InMemoryRoleSource::with_assignments([RoleAssignment::new(
            1,
            Role::Coordinator,
        )]));

        let result = guard
            .enforce(1, Role::Coordinator, &Action::new("export"), || async { "exported" })
            .await;

        assert_eq!(result, Ok("exported"));
    }

    #[tokio::test]
    async fn test_denied_never_runs_operation() {
        let guard = guard(InMemoryRoleSource::with_assignments([RoleAssignment::new(
            1,
            Role::Viewer,
        )]));
        let ran = AtomicUsize::new(0);

        let result = guard
            .enforce(1, Role::Admin, &Action::new("invalidate"), || async {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let denied = result.unwrap_err();
        assert_eq!(denied.decision, Decision::Denied);
        assert_eq!(denied.to_string(), "access denied");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_maps_to_same_message() {
        let source = InMemoryRoleSource::new();
        source.set_failing(true);
        let guard = guard(source);

        let denied = guard
            .enforce_action(1, &Action::new("view"), || async {})
            .await
            .unwrap_err();

        assert_eq!(denied.decision, Decision::Error);
        assert_eq!(denied.to_string(), "access denied");
    }

    #[tokio::test]
    async fn test_protected_operation() {
        let guard = guard(InMemoryRoleSource::with_assignments([
            RoleAssignment::new(1, Role::Admin),
            RoleAssignment::new(2, Role::Viewer),
        ]));
        let sync = guard.protect("sync", None, |user_id: UserId| async move { user_id.get() * 10 });

        assert_eq!(sync.call(1).await, Ok(10));
        assert!(sync.call(2).await.is_err());
        assert_eq!(sync.action().as_str(), "sync");
    }
}
