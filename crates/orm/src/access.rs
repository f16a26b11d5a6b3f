//! Access control
//!
//! Per-model policy evaluated before any datastore round-trip. A policy
//! method may allow, deny, or return a partial predicate that is merged
//! into the governing where/create map as an additive constraint.

use serde_json::{Map, Value};

use async_trait::async_trait;

use crate::error::{OrmError, OrmResult};
use crate::instance::ModelInstance;

/// Decision returned by a policy method.
#[derive(Debug, Clone)]
pub enum Access {
    Allow,
    Deny,
    /// Additional constraints merged into the governing map; never
    /// replaces caller-supplied keys.
    Scope(Map<String, Value>),
}

/// Context handed to policy methods: the resolved actor (already looked
/// up by the host's authentication collaborator) and the in-progress
/// where/set maps for the operation.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub actor: Option<ModelInstance>,
    /// Internal operations (migrations, token bookkeeping) bypass policies
    pub(crate) system: bool,
}

impl OpContext {
    /// Context for an unauthenticated caller.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context acting on behalf of a resolved actor.
    pub fn acting_as(actor: ModelInstance) -> Self {
        Self {
            actor: Some(actor),
            system: false,
        }
    }

    /// Trusted internal context; skips access control entirely.
    pub fn system() -> Self {
        Self {
            actor: None,
            system: true,
        }
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    /// Id of the resolved actor, if any.
    pub fn actor_id(&self) -> Option<Value> {
        self.actor.as_ref().and_then(|a| a.id())
    }

    /// Map a denial onto the right error kind: no actor means the caller
    /// never authenticated, an actor means the policy refused them.
    pub fn denial(&self, action: &str) -> OrmError {
        match self.actor {
            Some(_) => OrmError::Forbidden(format!("not allowed to {}", action)),
            None => OrmError::Unauthenticated(format!("sign in to {}", action)),
        }
    }
}

/// Per-model access policy. Default implementations allow everything;
/// models with an ownership property additionally get implicit actor
/// scoping applied by the CRUD layer regardless of the policy.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn can_create(&self, _ctx: &OpContext, _set_map: &Map<String, Value>) -> OrmResult<Access> {
        Ok(Access::Allow)
    }

    async fn can_read(&self, _ctx: &OpContext, _where_map: &Map<String, Value>) -> OrmResult<Access> {
        Ok(Access::Allow)
    }

    async fn can_update(
        &self,
        _ctx: &OpContext,
        _where_map: &Map<String, Value>,
        _set_map: &Map<String, Value>,
    ) -> OrmResult<Access> {
        Ok(Access::Allow)
    }

    async fn can_delete(&self, _ctx: &OpContext, _where_map: &Map<String, Value>) -> OrmResult<Access> {
        Ok(Access::Allow)
    }
}

/// The default policy: everything allowed.
pub struct AllowAll;

#[async_trait]
impl AccessControl for AllowAll {}

/// Merge a scope predicate into a caller map. Additive only: keys the
/// caller already supplied are left untouched.
pub fn merge_scope(target: &mut Map<String, Value>, scope: Map<String, Value>) {
    for (key, value) in scope {
        target.entry(key).or_insert(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_merge_is_additive() {
        let mut target = json!({ "name": "caller" }).as_object().unwrap().clone();
        let scope = json!({ "name": "policy", "owner_id": "u1" })
            .as_object()
            .unwrap()
            .clone();
        merge_scope(&mut target, scope);
        assert_eq!(target.get("name"), Some(&json!("caller")));
        assert_eq!(target.get("owner_id"), Some(&json!("u1")));
    }

    #[test]
    fn denial_distinguishes_missing_actor() {
        let anonymous = OpContext::anonymous();
        assert!(matches!(
            anonymous.denial("read"),
            OrmError::Unauthenticated(_)
        ));
    }
}
