//! Conflict resolution.
//!
//! A conflict arises when the server reports that an entity's current
//! version differs from the `base_version` the client's operation was
//! built on. Resolvers are pure functions of a [`ConflictContext`]: the
//! same context always yields the same decision, which makes a retried
//! resolution safe.

use crate::error::ProtocolError;
use crate::operation::{OperationType, SyncOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Field consulted by [`ConflictPolicy::LastWriteWins`].
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Everything a resolver may look at.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictContext {
    /// Entity type of the conflicting operation.
    pub entity_type: String,
    /// Entity id of the conflicting operation.
    pub entity_id: String,
    /// Operation type.
    pub op_type: OperationType,
    /// Payload the client tried to write.
    pub client_payload: Option<Value>,
    /// Version the client's write was based on.
    pub client_version: Option<u64>,
    /// Entity state currently on the server.
    pub server_payload: Option<Value>,
    /// Entity version currently on the server.
    pub server_version: u64,
}

impl ConflictContext {
    /// Builds a context from an operation and the server's view.
    pub fn new(op: &SyncOperation, server_payload: Option<Value>, server_version: u64) -> Self {
        Self {
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            op_type: op.op_type,
            client_payload: op.payload.clone(),
            client_version: op.base_version,
            server_payload,
            server_version,
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// The client's payload is rewritten onto the server's version.
    ClientWins,
    /// The server's state stands; the client's write is dropped.
    ServerWins,
    /// A merged payload is written onto the server's version.
    Merged,
}

impl ResolutionStrategy {
    /// Returns true if the resolved payload must be sent to the server again.
    pub fn requires_retry(&self) -> bool {
        !matches!(self, ResolutionStrategy::ServerWins)
    }

    /// Returns the kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::ClientWins => "client-wins",
            ResolutionStrategy::ServerWins => "server-wins",
            ResolutionStrategy::Merged => "merged",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A settled conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Strategy that produced `data`.
    pub strategy: ResolutionStrategy,
    /// Payload to write (`None` for a delete that wins).
    pub data: Option<Value>,
}

/// What a resolver decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverDecision {
    /// The conflict has a resolution.
    Resolved(Resolution),
    /// The conflict cannot be settled automatically.
    Abort {
        /// Why the resolver gave up.
        reason: String,
    },
}

impl ResolverDecision {
    /// Shorthand for a resolved decision.
    pub fn resolved(strategy: ResolutionStrategy, data: Option<Value>) -> Self {
        Self::Resolved(Resolution { strategy, data })
    }

    /// Shorthand for an abort.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }
}

/// A pure conflict resolution function.
///
/// Implementations must be deterministic and side-effect free.
pub trait ConflictResolver: Send + Sync {
    /// Decides how to settle the conflict described by `ctx`.
    fn resolve(&self, ctx: &ConflictContext) -> ResolverDecision;
}

impl<F> ConflictResolver for F
where
    F: Fn(&ConflictContext) -> ResolverDecision + Send + Sync,
{
    fn resolve(&self, ctx: &ConflictContext) -> ResolverDecision {
        self(ctx)
    }
}

/// Built-in resolution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Server always wins.
    #[default]
    ServerWins,
    /// Client always wins.
    ClientWins,
    /// Server fields overlaid with the client's fields (top level only).
    ShallowMerge,
    /// Newer `updatedAt` wins; ties and missing timestamps go to the server.
    LastWriteWins,
    /// Never resolve automatically.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy automatically resolves conflicts.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Returns the kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::ServerWins => "server-wins",
            ConflictPolicy::ClientWins => "client-wins",
            ConflictPolicy::ShallowMerge => "shallow-merge",
            ConflictPolicy::LastWriteWins => "last-write-wins",
            ConflictPolicy::Manual => "manual",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            ConflictPolicy::ServerWins,
            ConflictPolicy::ClientWins,
            ConflictPolicy::ShallowMerge,
            ConflictPolicy::LastWriteWins,
            ConflictPolicy::Manual,
        ]
        .into_iter()
        .find(|p| p.as_str() == s)
        .ok_or_else(|| ProtocolError::UnknownName {
            kind: "conflict policy",
            value: s.to_string(),
        })
    }
}

impl ConflictResolver for ConflictPolicy {
    fn resolve(&self, ctx: &ConflictContext) -> ResolverDecision {
        match self {
            ConflictPolicy::ServerWins => server_wins(ctx),
            ConflictPolicy::ClientWins => client_wins(ctx),
            ConflictPolicy::ShallowMerge => match (&ctx.client_payload, &ctx.server_payload) {
                (Some(Value::Object(client)), Some(Value::Object(server))) => {
                    let mut merged = server.clone();
                    for (key, value) in client {
                        merged.insert(key.clone(), value.clone());
                    }
                    ResolverDecision::resolved(
                        ResolutionStrategy::Merged,
                        Some(Value::Object(merged)),
                    )
                }
                // Deletes and non-object payloads have nothing to merge
                _ => client_wins(ctx),
            },
            ConflictPolicy::LastWriteWins => {
                let client_ts = updated_at(ctx.client_payload.as_ref());
                let server_ts = updated_at(ctx.server_payload.as_ref());
                match (client_ts, server_ts) {
                    (Some(client), Some(server)) if client > server => client_wins(ctx),
                    (Some(_), None) => client_wins(ctx),
                    _ => server_wins(ctx),
                }
            }
            ConflictPolicy::Manual => ResolverDecision::abort(format!(
                "manual resolution required for {}/{} (client v{:?}, server v{})",
                ctx.entity_type, ctx.entity_id, ctx.client_version, ctx.server_version
            )),
        }
    }
}

fn server_wins(ctx: &ConflictContext) -> ResolverDecision {
    ResolverDecision::resolved(ResolutionStrategy::ServerWins, ctx.server_payload.clone())
}

fn client_wins(ctx: &ConflictContext) -> ResolverDecision {
    ResolverDecision::resolved(ResolutionStrategy::ClientWins, ctx.client_payload.clone())
}

fn updated_at(payload: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = payload?.get(UPDATED_AT_FIELD)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// A default resolver plus per-entity-type overrides.
#[derive(Clone)]
pub struct ResolverRegistry {
    default: Arc<dyn ConflictResolver>,
    overrides: HashMap<String, Arc<dyn ConflictResolver>>,
}

impl ResolverRegistry {
    /// Creates a registry with the given default resolver.
    pub fn new(default: impl ConflictResolver + 'static) -> Self {
        Self {
            default: Arc::new(default),
            overrides: HashMap::new(),
        }
    }

    /// Registers a resolver for one entity type, replacing any previous one.
    pub fn register(
        &mut self,
        entity_type: impl Into<String>,
        resolver: impl ConflictResolver + 'static,
    ) -> &mut Self {
        self.overrides.insert(entity_type.into(), Arc::new(resolver));
        self
    }

    /// Builder-style [`ResolverRegistry::register`].
    pub fn with_override(
        mut self,
        entity_type: impl Into<String>,
        resolver: impl ConflictResolver + 'static,
    ) -> Self {
        self.register(entity_type, resolver);
        self
    }

    /// Returns true if `entity_type` has its own resolver.
    pub fn has_override(&self, entity_type: &str) -> bool {
        self.overrides.contains_key(entity_type)
    }

    /// Returns the resolver responsible for `entity_type`.
    pub fn resolver_for(&self, entity_type: &str) -> &dyn ConflictResolver {
        self.overrides
            .get(entity_type)
            .map(|r| r.as_ref())
            .unwrap_or_else(|| self.default.as_ref())
    }

    /// Resolves a conflict with the responsible resolver.
    pub fn resolve(&self, ctx: &ConflictContext) -> ResolverDecision {
        self.resolver_for(&ctx.entity_type).resolve(ctx)
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new(ConflictPolicy::ServerWins)
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.overrides.keys().collect();
        types.sort();
        f.debug_struct("ResolverRegistry")
            .field("overrides", &types)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn context(client: Value, server: Value) -> ConflictContext {
        ConflictContext {
            entity_type: "resident".into(),
            entity_id: "2".into(),
            op_type: OperationType::Update,
            client_payload: Some(client),
            client_version: Some(3),
            server_payload: Some(server),
            server_version: 5,
        }
    }

    #[test]
    fn policy_resolution() {
        let ctx = context(json!({"name": "Client"}), json!({"name": "Server"}));

        assert_eq!(
            ConflictPolicy::ServerWins.resolve(&ctx),
            ResolverDecision::resolved(
                ResolutionStrategy::ServerWins,
                Some(json!({"name": "Server"}))
            )
        );
        assert_eq!(
            ConflictPolicy::ClientWins.resolve(&ctx),
            ResolverDecision::resolved(
                ResolutionStrategy::ClientWins,
                Some(json!({"name": "Client"}))
            )
        );
        assert!(matches!(
            ConflictPolicy::Manual.resolve(&ctx),
            ResolverDecision::Abort { .. }
        ));
    }

    #[test]
    fn shallow_merge_overlays_client_fields() {
        let ctx = context(
            json!({"name": "Client", "room": 12}),
            json!({"name": "Server", "phone": "555"}),
        );
        let decision = ConflictPolicy::ShallowMerge.resolve(&ctx);
        assert_eq!(
            decision,
            ResolverDecision::resolved(
                ResolutionStrategy::Merged,
                Some(json!({"name": "Client", "room": 12, "phone": "555"}))
            )
        );
    }

    #[test]
    fn shallow_merge_of_delete_is_client_wins() {
        let mut ctx = context(json!({}), json!({"name": "Server"}));
        ctx.op_type = OperationType::Delete;
        ctx.client_payload = None;
        let ResolverDecision::Resolved(resolution) = ConflictPolicy::ShallowMerge.resolve(&ctx)
        else {
            panic!("expected a resolution");
        };
        assert_eq!(resolution.strategy, ResolutionStrategy::ClientWins);
        assert_eq!(resolution.data, None);
    }

    #[test]
    fn last_write_wins_compares_timestamps() {
        let newer_client = context(
            json!({"updatedAt": "2024-05-02T10:00:00Z"}),
            json!({"updatedAt": "2024-05-01T10:00:00+00:00"}),
        );
        let ResolverDecision::Resolved(r) = ConflictPolicy::LastWriteWins.resolve(&newer_client)
        else {
            panic!("expected a resolution");
        };
        assert_eq!(r.strategy, ResolutionStrategy::ClientWins);

        let older_client = context(
            json!({"updatedAt": "2024-04-30T10:00:00Z"}),
            json!({"updatedAt": "2024-05-01T10:00:00Z"}),
        );
        let ResolverDecision::Resolved(r) = ConflictPolicy::LastWriteWins.resolve(&older_client)
        else {
            panic!("expected a resolution");
        };
        assert_eq!(r.strategy, ResolutionStrategy::ServerWins);

        let untimed = context(json!({"name": "a"}), json!({"name": "b"}));
        let ResolverDecision::Resolved(r) = ConflictPolicy::LastWriteWins.resolve(&untimed) else {
            panic!("expected a resolution");
        };
        assert_eq!(r.strategy, ResolutionStrategy::ServerWins);
    }

    #[test]
    fn policy_names() {
        for policy in [
            ConflictPolicy::ServerWins,
            ConflictPolicy::ClientWins,
            ConflictPolicy::ShallowMerge,
            ConflictPolicy::LastWriteWins,
            ConflictPolicy::Manual,
        ] {
            assert_eq!(policy.as_str().parse::<ConflictPolicy>().unwrap(), policy);
        }
        assert!("coin-flip".parse::<ConflictPolicy>().is_err());
        assert!(!ConflictPolicy::Manual.auto_resolves());
    }

    #[test]
    fn registry_overrides_by_entity_type() {
        let registry = ResolverRegistry::default()
            .with_override("note", ConflictPolicy::ClientWins)
            .with_override("audit", |_: &ConflictContext| {
                ResolverDecision::abort("audit entries are immutable")
            });

        let mut ctx = context(json!({"v": 1}), json!({"v": 2}));
        let ResolverDecision::Resolved(r) = registry.resolve(&ctx) else {
            panic!("expected a resolution");
        };
        assert_eq!(r.strategy, ResolutionStrategy::ServerWins);

        ctx.entity_type = "note".into();
        let ResolverDecision::Resolved(r) = registry.resolve(&ctx) else {
            panic!("expected a resolution");
        };
        assert_eq!(r.strategy, ResolutionStrategy::ClientWins);

        ctx.entity_type = "audit".into();
        assert!(matches!(registry.resolve(&ctx), ResolverDecision::Abort { .. }));
        assert!(registry.has_override("audit"));
        assert!(!registry.has_override("resident"));
    }

    #[test]
    fn strategy_retry() {
        assert!(ResolutionStrategy::ClientWins.requires_retry());
        assert!(ResolutionStrategy::Merged.requires_retry());
        assert!(!ResolutionStrategy::ServerWins.requires_retry());
    }

    proptest! {
        #[test]
        fn resolution_is_deterministic(
            client in proptest::collection::hash_map("[a-z]{1,4}", 0i64..100, 0..6),
            server in proptest::collection::hash_map("[a-z]{1,4}", 0i64..100, 0..6),
        ) {
            let ctx = context(json!(client), json!(server));
            for policy in [ConflictPolicy::ShallowMerge, ConflictPolicy::LastWriteWins] {
                prop_assert_eq!(policy.resolve(&ctx), policy.resolve(&ctx.clone()));
            }

            // Every client field survives a merge
            if let ResolverDecision::Resolved(r) = ConflictPolicy::ShallowMerge.resolve(&ctx) {
                let merged = r.data.unwrap();
                for (k, v) in &client {
                    prop_assert_eq!(&merged[k], &json!(v));
                }
            }
        }
    }
}
