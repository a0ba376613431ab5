//! Replicated authentication and role-based authorization store.
//!
//! Users, roles, permissions and issued tokens are part of the state
//! machine. Every mutation is an [`AuthOp`] carried through the log, so all
//! members agree on who may do what at any applied index. Password hashes
//! and tokens are produced by the proposing member; apply never draws
//! randomness.

use super::mvcc::prefix_end;
use super::request::{Compare, RequestOp, TxnRequest};
use crate::core::error::{TesseraError, TesseraResult};
use crate::core::time::Tick;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const ROOT_USER: &str = "root";
pub const ROOT_ROLE: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionType {
    Read,
    Write,
    ReadWrite,
}

impl PermissionType {
    fn allows(self, wanted: PermissionType) -> bool {
        self == PermissionType::ReadWrite || self == wanted
    }
}

/// Access to the key range `[key, range_end)` using the usual range
/// conventions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub perm_type: PermissionType,
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
}

impl Permission {
    pub fn new(
        perm_type: PermissionType,
        key: impl Into<Vec<u8>>,
        range_end: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            perm_type,
            key: key.into(),
            range_end: range_end.into(),
        }
    }
}

/// Salted SHA-256 password digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHash {
    pub salt: String,
    pub digest: String,
}

impl PasswordHash {
    /// Hash `password` with a fresh random salt.
    pub fn generate(password: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = URL_SAFE_NO_PAD.encode(salt);
        let digest = Self::digest(&salt, password);
        Self { salt, digest }
    }

    pub fn verify(&self, password: &str) -> bool {
        Self::digest(&self.salt, password) == self.digest
    }

    fn digest(salt: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A fresh opaque bearer token.
pub fn generate_token() -> String {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// `None` for users that can only authenticate by other means.
    pub password: Option<PasswordHash>,
    pub roles: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenInfo {
    user: String,
    expires: Tick,
}

/// Auth store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthOp {
    Enable,
    Disable,
    UserAdd {
        name: String,
        password: Option<PasswordHash>,
    },
    UserDelete {
        name: String,
    },
    UserChangePassword {
        name: String,
        password: PasswordHash,
    },
    UserGrantRole {
        user: String,
        role: String,
    },
    UserRevokeRole {
        user: String,
        role: String,
    },
    RoleAdd {
        name: String,
    },
    RoleDelete {
        name: String,
    },
    RoleGrantPermission {
        name: String,
        permission: Permission,
    },
    RoleRevokePermission {
        name: String,
        key: Vec<u8>,
        range_end: Vec<u8>,
    },
    /// Register a token for a user whose password was checked by the
    /// proposing member against `password`. Rejected at apply if the user's
    /// password has changed since. `issued_ms` is the proposer's clock; the
    /// deadline counts from it or from the applied time, whichever is later.
    IssueToken {
        user: String,
        password: PasswordHash,
        token: String,
        issued_ms: u64,
        ttl_ms: u64,
    },
}

impl AuthOp {
    /// Whether only `root` may run this operation.
    pub fn requires_root(&self) -> bool {
        !matches!(self, AuthOp::IssueToken { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthOpResponse {
    Done,
    Token(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStore {
    enabled: bool,
    /// Bumped on every successful mutation.
    revision: u64,
    users: BTreeMap<String, User>,
    roles: BTreeMap<String, Role>,
    tokens: BTreeMap<String, TokenInfo>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn user(&self, name: &str) -> TesseraResult<&User> {
        self.users.get(name).ok_or_else(|| TesseraError::UserNotFound {
            name: name.to_string(),
        })
    }

    pub fn role(&self, name: &str) -> TesseraResult<&Role> {
        self.roles.get(name).ok_or_else(|| TesseraError::RoleNotFound {
            name: name.to_string(),
        })
    }

    pub fn user_names(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.keys().cloned().collect()
    }

    pub fn is_root(&self, user: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|u| u.roles.contains(ROOT_ROLE))
    }

    /// Check credentials against the local copy of the store. Returns the
    /// hash that matched, which token issue carries through the log.
    pub fn check_password(&self, user: &str, password: &str) -> TesseraResult<PasswordHash> {
        if !self.enabled {
            return Err(TesseraError::failed_precondition(
                "authentication is not enabled",
            ));
        }
        match self.users.get(user).and_then(|u| u.password.as_ref()) {
            Some(hash) if hash.verify(password) => Ok(hash.clone()),
            _ => Err(TesseraError::AuthenticationFailed),
        }
    }

    /// Resolve a bearer token to its user.
    pub fn user_for_token(&self, token: &str, now: Tick) -> TesseraResult<String> {
        match self.tokens.get(token) {
            Some(info) if !now.is_at_or_after(info.expires) && self.users.contains_key(&info.user) => {
                Ok(info.user.clone())
            }
            _ => Err(TesseraError::InvalidToken),
        }
    }

    /// Drop tokens whose deadline has passed.
    pub fn purge_tokens(&mut self, now: Tick) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, info| !now.is_at_or_after(info.expires));
        before - self.tokens.len()
    }

    pub fn require_root(&self, user: &str) -> TesseraResult<()> {
        if self.is_root(user) {
            Ok(())
        } else {
            Err(TesseraError::permission_denied(format!(
                "user {} is not root",
                user
            )))
        }
    }

    /// Check that `user` may access every key in `[key, range_end)`.
    pub fn check_range(
        &self,
        user: &str,
        key: &[u8],
        range_end: &[u8],
        wanted: PermissionType,
    ) -> TesseraResult<()> {
        let u = self
            .users
            .get(user)
            .ok_or_else(|| TesseraError::permission_denied(format!("user {} not found", user)))?;
        if u.roles.contains(ROOT_ROLE) {
            return Ok(());
        }
        let granted: Vec<&Permission> = u
            .roles
            .iter()
            .filter_map(|r| self.roles.get(r))
            .flat_map(|r| r.permissions.iter())
            .filter(|p| p.perm_type.allows(wanted))
            .collect();
        if covers(&granted, key, range_end) {
            Ok(())
        } else {
            Err(TesseraError::permission_denied(format!(
                "user {} has no {:?} permission on the requested range",
                user, wanted
            )))
        }
    }

    /// Check every compare and every operation on both branches.
    pub fn check_txn(&self, user: &str, txn: &TxnRequest) -> TesseraResult<()> {
        for Compare { key, range_end, .. } in &txn.compare {
            self.check_range(user, key, range_end, PermissionType::Read)?;
        }
        for op in txn.success.iter().chain(txn.failure.iter()) {
            match op {
                RequestOp::Range(r) => {
                    self.check_range(user, &r.key, &r.range_end, PermissionType::Read)?
                }
                RequestOp::Put(p) => {
                    self.check_range(user, &p.key, &[], PermissionType::Write)?;
                    if p.prev_kv {
                        self.check_range(user, &p.key, &[], PermissionType::Read)?;
                    }
                }
                RequestOp::DeleteRange(d) => {
                    self.check_range(user, &d.key, &d.range_end, PermissionType::Write)?;
                    if d.prev_kv {
                        self.check_range(user, &d.key, &d.range_end, PermissionType::Read)?;
                    }
                }
                RequestOp::Txn(t) => self.check_txn(user, t)?,
            }
        }
        Ok(())
    }

    /// Apply a committed auth mutation at deterministic time `now`.
    pub fn apply(&mut self, op: &AuthOp, now: Tick) -> TesseraResult<AuthOpResponse> {
        let response = self.apply_inner(op, now)?;
        self.revision += 1;
        Ok(response)
    }

    fn apply_inner(&mut self, op: &AuthOp, now: Tick) -> TesseraResult<AuthOpResponse> {
        match op {
            AuthOp::Enable => {
                if self.enabled {
                    return Ok(AuthOpResponse::Done);
                }
                let root = self.users.get(ROOT_USER).ok_or_else(|| {
                    TesseraError::failed_precondition("root user does not exist")
                })?;
                if !root.roles.contains(ROOT_ROLE) {
                    return Err(TesseraError::failed_precondition(
                        "root user does not have root role",
                    ));
                }
                self.enabled = true;
                tracing::info!("authentication enabled");
            }
            AuthOp::Disable => {
                self.enabled = false;
                self.tokens.clear();
                tracing::info!("authentication disabled");
            }
            AuthOp::UserAdd { name, password } => {
                if name.is_empty() {
                    return Err(TesseraError::invalid_argument("user name is empty"));
                }
                if self.users.contains_key(name) {
                    return Err(TesseraError::UserExists { name: name.clone() });
                }
                self.users.insert(
                    name.clone(),
                    User {
                        name: name.clone(),
                        password: password.clone(),
                        roles: BTreeSet::new(),
                    },
                );
            }
            AuthOp::UserDelete { name } => {
                if self.enabled && name == ROOT_USER {
                    return Err(TesseraError::failed_precondition(
                        "cannot delete root user while auth is enabled",
                    ));
                }
                self.users
                    .remove(name)
                    .ok_or_else(|| TesseraError::UserNotFound { name: name.clone() })?;
                self.tokens.retain(|_, info| info.user != *name);
            }
            AuthOp::UserChangePassword { name, password } => {
                let user = self
                    .users
                    .get_mut(name)
                    .ok_or_else(|| TesseraError::UserNotFound { name: name.clone() })?;
                user.password = Some(password.clone());
                self.tokens.retain(|_, info| info.user != *name);
            }
            AuthOp::UserGrantRole { user, role } => {
                if role != ROOT_ROLE && !self.roles.contains_key(role) {
                    return Err(TesseraError::RoleNotFound { name: role.clone() });
                }
                let u = self
                    .users
                    .get_mut(user)
                    .ok_or_else(|| TesseraError::UserNotFound { name: user.clone() })?;
                u.roles.insert(role.clone());
            }
            AuthOp::UserRevokeRole { user, role } => {
                if self.enabled && user == ROOT_USER && role == ROOT_ROLE {
                    return Err(TesseraError::failed_precondition(
                        "cannot revoke root role from root user while auth is enabled",
                    ));
                }
                let u = self
                    .users
                    .get_mut(user)
                    .ok_or_else(|| TesseraError::UserNotFound { name: user.clone() })?;
                if !u.roles.remove(role) {
                    return Err(TesseraError::RoleNotGranted {
                        user: user.clone(),
                        role: role.clone(),
                    });
                }
            }
            AuthOp::RoleAdd { name } => {
                if name.is_empty() {
                    return Err(TesseraError::invalid_argument("role name is empty"));
                }
                if self.roles.contains_key(name) {
                    return Err(TesseraError::RoleExists { name: name.clone() });
                }
                self.roles.insert(
                    name.clone(),
                    Role {
                        name: name.clone(),
                        permissions: Vec::new(),
                    },
                );
            }
            AuthOp::RoleDelete { name } => {
                if self.enabled && name == ROOT_ROLE {
                    return Err(TesseraError::failed_precondition(
                        "cannot delete root role while auth is enabled",
                    ));
                }
                self.roles
                    .remove(name)
                    .ok_or_else(|| TesseraError::RoleNotFound { name: name.clone() })?;
                for user in self.users.values_mut() {
                    user.roles.remove(name);
                }
            }
            AuthOp::RoleGrantPermission { name, permission } => {
                let role = self
                    .roles
                    .get_mut(name)
                    .ok_or_else(|| TesseraError::RoleNotFound { name: name.clone() })?;
                match role
                    .permissions
                    .iter_mut()
                    .find(|p| p.key == permission.key && p.range_end == permission.range_end)
                {
                    Some(existing) => existing.perm_type = permission.perm_type,
                    None => role.permissions.push(permission.clone()),
                }
            }
            AuthOp::RoleRevokePermission {
                name,
                key,
                range_end,
            } => {
                let role = self
                    .roles
                    .get_mut(name)
                    .ok_or_else(|| TesseraError::RoleNotFound { name: name.clone() })?;
                let before = role.permissions.len();
                role.permissions
                    .retain(|p| !(p.key == *key && p.range_end == *range_end));
                if role.permissions.len() == before {
                    return Err(TesseraError::PermissionNotGranted { role: name.clone() });
                }
            }
            AuthOp::IssueToken {
                user,
                password,
                token,
                issued_ms,
                ttl_ms,
            } => {
                if !self.enabled {
                    return Err(TesseraError::failed_precondition(
                        "authentication is not enabled",
                    ));
                }
                let current = self.users.get(user).and_then(|u| u.password.as_ref());
                if current != Some(password) {
                    tracing::debug!(user = %user, "credentials changed before token issue");
                    return Err(TesseraError::AuthenticationFailed);
                }
                self.tokens.insert(
                    token.clone(),
                    TokenInfo {
                        user: user.clone(),
                        expires: Tick::new(*issued_ms).max(now).add_ms(*ttl_ms),
                    },
                );
                return Ok(AuthOpResponse::Token(token.clone()));
            }
        }
        Ok(AuthOpResponse::Done)
    }
}

/// Convert a range to a half-open interval; `None` is unbounded above.
fn interval(key: &[u8], range_end: &[u8]) -> (Vec<u8>, Option<Vec<u8>>) {
    if range_end.is_empty() {
        let mut end = key.to_vec();
        end.push(0);
        (key.to_vec(), Some(end))
    } else if range_end == [0] {
        (key.to_vec(), None)
    } else {
        (key.to_vec(), Some(range_end.to_vec()))
    }
}

/// Whether the union of `granted` ranges covers `[key, range_end)`.
fn covers(granted: &[&Permission], key: &[u8], range_end: &[u8]) -> bool {
    let (start, end) = interval(key, range_end);
    if let Some(end) = &end {
        if start >= *end {
            return true;
        }
    }
    let mut spans: Vec<(Vec<u8>, Option<Vec<u8>>)> = granted
        .iter()
        .map(|p| interval(&p.key, &p.range_end))
        .collect();
    spans.sort_by(|a, b| a.0.cmp(&b.0));

    let mut reached = start;
    for (s, e) in spans {
        if s > reached {
            break;
        }
        match e {
            None => return true,
            Some(e) if e > reached => reached = e,
            Some(_) => {}
        }
        if let Some(end) = &end {
            if reached >= *end {
                return true;
            }
        }
    }
    false
}

/// Permission covering every key with the given prefix.
pub fn prefix_permission(perm_type: PermissionType, prefix: &[u8]) -> Permission {
    Permission::new(perm_type, prefix.to_vec(), prefix_end(prefix))
}
