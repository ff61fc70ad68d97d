//! API keys, roles and role → resource access rules

use anyhow::{Result, anyhow};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use toolgate_core::{ApiKey, PolicyEvaluation, PolicyRule, RuleAction};

use crate::db::{Database, conversion_error, parse_timestamp};
use crate::registry::StoreParseError;

/// The universal resource pattern
pub const WILDCARD: &str = "*";

/// Whether `pattern` covers the `server:tool` target.
///
/// `*` matches everything. Otherwise both sides are compared independently and
/// each side matches when it is `*` or equal to the target's side.
pub fn resource_matches(pattern: &str, server: &str, tool: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }
    let Some((pattern_server, pattern_tool)) = pattern.split_once(':') else {
        return false;
    };
    let side = |p: &str, t: &str| p == WILDCARD || p == t;
    side(pattern_server, server) && side(pattern_tool, tool)
}

/// Authentication and authorization decisions backed by the database
#[derive(Clone)]
pub struct Policy {
    db: Database,
    evaluation: PolicyEvaluation,
}

impl Policy {
    pub fn new(db: Database, evaluation: PolicyEvaluation) -> Self {
        Self { db, evaluation }
    }

    pub fn evaluation(&self) -> PolicyEvaluation {
        self.evaluation
    }

    /// Seed the administrator key and its universal allow rule when no key with
    /// `admin_role` exists. Returns true when seeding happened.
    pub async fn bootstrap(&self, admin_role: &str, admin_key: &str) -> Result<bool> {
        let admin_role = admin_role.to_owned();
        let admin_key = admin_key.to_owned();
        self.db
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO policy_rules (id, role, resource, action)
                     VALUES (?1, ?2, '*', 'allow')
                     ON CONFLICT(role, resource) DO UPDATE SET action = 'allow'",
                    params![Uuid::new_v4().to_string(), &admin_role],
                )?;

                let existing: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM api_keys WHERE role = ?1",
                    params![&admin_role],
                    |row| row.get(0),
                )?;
                let seeded = existing == 0;
                if seeded {
                    tx.execute(
                        "INSERT INTO api_keys (id, key, name, role, is_active, created_at)
                         VALUES (?1, ?2, 'bootstrap admin', ?3, 1, ?4)",
                        params![
                            Uuid::new_v4().to_string(),
                            &admin_key,
                            &admin_role,
                            Utc::now().to_rfc3339()
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(seeded)
            })
            .await
    }

    /// Resolve a bearer secret. Unknown and deactivated keys both yield `None`.
    pub async fn verify_api_key(&self, key: &str) -> Result<Option<ApiKey>> {
        let key = key.to_owned();
        self.db
            .with_conn(move |conn| {
                let found = conn
                    .query_row(
                        "SELECT id, key, name, role, is_active, created_at
                         FROM api_keys WHERE key = ?1 AND is_active = 1",
                        params![&key],
                        Self::row_to_key,
                    )
                    .optional()?;
                Ok(found)
            })
            .await
    }

    /// Mint and persist a fresh active key for `role`, returning the secret
    pub async fn create_api_key(&self, name: &str, role: &str) -> Result<String> {
        let name = name.trim().to_owned();
        let role = role.trim().to_owned();
        if role.is_empty() {
            return Err(anyhow!("Role cannot be empty"));
        }
        self.db
            .with_conn(move |conn| {
                let secret = format!("tg_{}", Uuid::new_v4().simple());
                conn.execute(
                    "INSERT INTO api_keys (id, key, name, role, is_active, created_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    params![
                        Uuid::new_v4().to_string(),
                        &secret,
                        &name,
                        &role,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                info!("Created API key '{}' for role '{}'", name, role);
                Ok(secret)
            })
            .await
    }

    /// Flip a key inactive. The row is kept for the audit trail.
    pub async fn deactivate_api_key(&self, id: &str) -> Result<bool> {
        let id = id.to_owned();
        self.db
            .with_conn(move |conn| {
                let updated = conn.execute(
                    "UPDATE api_keys SET is_active = 0 WHERE id = ?1 AND is_active = 1",
                    params![&id],
                )?;
                if updated > 0 {
                    warn!("Deactivated API key {}", id);
                }
                Ok(updated > 0)
            })
            .await
    }

    pub async fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, key, name, role, is_active, created_at
                     FROM api_keys ORDER BY created_at",
                )?;
                let keys = stmt
                    .query_map([], Self::row_to_key)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .await
    }

    /// Add a rule, or change the action of the existing `(role, resource)` rule
    pub async fn add_rule(&self, role: &str, resource: &str, action: RuleAction) -> Result<()> {
        let role = role.trim().to_owned();
        let resource = resource.trim().to_owned();
        validate_pattern(&resource)?;
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO policy_rules (id, role, resource, action)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(role, resource) DO UPDATE SET action = excluded.action",
                    params![Uuid::new_v4().to_string(), &role, &resource, action.to_string()],
                )?;
                info!("Policy rule: {} {} {}", role, action, resource);
                Ok(())
            })
            .await
    }

    pub async fn remove_rule(&self, role: &str, resource: &str) -> Result<bool> {
        let role = role.to_owned();
        let resource = resource.to_owned();
        self.db
            .with_conn(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM policy_rules WHERE role = ?1 AND resource = ?2",
                    params![&role, &resource],
                )?;
                Ok(deleted > 0)
            })
            .await
    }

    pub async fn list_rules(&self) -> Result<Vec<PolicyRule>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, role, resource, action FROM policy_rules ORDER BY role, resource",
                )?;
                let rules = stmt
                    .query_map([], Self::row_to_rule)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rules)
            })
            .await
    }

    /// Whether `role` may call `tool` on `server`
    pub async fn can_access(&self, role: &str, server: &str, tool: &str) -> Result<bool> {
        let role_owned = role.to_owned();
        let rules = self
            .db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, role, resource, action FROM policy_rules WHERE role = ?1",
                )?;
                let rules = stmt
                    .query_map(params![&role_owned], Self::row_to_rule)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rules)
            })
            .await?;

        let matching = |action: RuleAction| {
            rules
                .iter()
                .any(|r| r.action == action && resource_matches(&r.resource, server, tool))
        };

        let allowed = match self.evaluation {
            PolicyEvaluation::AllowOnly => matching(RuleAction::Allow),
            PolicyEvaluation::DenyOverrides => {
                !matching(RuleAction::Deny) && matching(RuleAction::Allow)
            }
        };
        debug!("Access {}:{} for role '{}': {}", server, tool, role, allowed);
        Ok(allowed)
    }

    fn row_to_key(row: &rusqlite::Row) -> rusqlite::Result<ApiKey> {
        Ok(ApiKey {
            id: row.get(0)?,
            key: row.get(1)?,
            name: row.get(2)?,
            role: row.get(3)?,
            is_active: row.get::<_, i64>(4)? != 0,
            created_at: parse_timestamp(&row.get::<_, String>(5)?),
        })
    }

    fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<PolicyRule> {
        let action: String = row.get(3)?;
        Ok(PolicyRule {
            id: row.get(0)?,
            role: row.get(1)?,
            resource: row.get(2)?,
            action: action
                .parse()
                .map_err(|e: anyhow::Error| conversion_error(3, StoreParseError(e.to_string())))?,
        })
    }
}

/// Accept `*` or `server:tool` with non-empty sides
fn validate_pattern(resource: &str) -> Result<()> {
    if resource == WILDCARD {
        return Ok(());
    }
    match resource.split_once(':') {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() && !tool.contains(':') => {
            Ok(())
        }
        _ => Err(anyhow!(
            "Invalid resource pattern '{}': expected '*' or '<server>:<tool>'",
            resource
        )),
    }
}
