// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Scopes and the policies that give them meaning
//!
//! A scope is either a space separated list of permission names (interpreted through a table of
//! resources and methods), or a group scope: a byte string containing a CBOR array of
//! `[group name, role bitmask]` entries, as used to join OSCORE groups (ACE Key Groupcomm OSCORE,
//! Section 3.1).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::BitOr;

use ciborium::value::{Integer, Value};
use serde::{Deserialize, Serialize};

use crate::claims::{Audience, ScopeClaim};
use crate::error::Rejection;

/// CoAP request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "FETCH")]
    Fetch,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "iPATCH")]
    IPatch,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Fetch,
        Method::Patch,
        Method::IPatch,
    ];

    /// CoAP code of the method (the detail part of code class 0)
    pub fn code(self) -> u8 {
        match self {
            Method::Get => 1,
            Method::Post => 2,
            Method::Put => 3,
            Method::Delete => 4,
            Method::Fetch => 5,
            Method::Patch => 6,
            Method::IPatch => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }
}

/// Roles in an OSCORE group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Requester,
    Responder,
    Monitor,
    Verifier,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Requester, Role::Responder, Role::Monitor, Role::Verifier];

    /// Registered role number; the role's bit in a bitmask is `1 << number`
    pub fn number(self) -> u32 {
        match self {
            Role::Requester => 1,
            Role::Responder => 2,
            Role::Monitor => 3,
            Role::Verifier => 4,
        }
    }

    fn bit(self) -> u64 {
        1 << self.number()
    }
}

/// Set of [`Role`]s, transported as bitmask
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Roles(u64);

impl Roles {
    const KNOWN: u64 = 0b1_1110;

    /// Accept a bitmask from a scope; an empty mask or unknown bits are rejected rather than
    /// masked away
    pub fn from_bits(bits: u64) -> Result<Self, Rejection> {
        if bits == 0 || bits & !Self::KNOWN != 0 {
            return Err(Rejection::InvalidRoles);
        }
        Ok(Roles(bits))
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, role: Role) -> bool {
        self.0 & role.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Role> {
        Role::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

impl FromIterator<Role> for Roles {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        Roles(iter.into_iter().fold(0, |acc, r| acc | r.bit()))
    }
}

impl BitOr for Roles {
    type Output = Roles;

    fn bitor(self, rhs: Roles) -> Roles {
        Roles(self.0 | rhs.0)
    }
}

impl fmt::Debug for Roles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupScopeEntry {
    pub group: String,
    pub roles: Roles,
}

/// Decoded group scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupScope(pub Vec<GroupScopeEntry>);

impl GroupScope {
    pub fn decode(data: &[u8]) -> Result<Self, Rejection> {
        let value: Value =
            ciborium::de::from_reader(data).map_err(|_| Rejection::InvalidScopeFormat)?;
        let Value::Array(items) = value else {
            return Err(Rejection::InvalidScopeFormat);
        };
        if items.is_empty() {
            return Err(Rejection::InvalidScopeFormat);
        }
        items
            .into_iter()
            .map(|item| {
                let Value::Array(pair) = item else {
                    return Err(Rejection::InvalidScopeFormat);
                };
                match <[Value; 2]>::try_from(pair) {
                    Ok([Value::Text(group), Value::Integer(bits)]) => Ok(GroupScopeEntry {
                        group,
                        roles: Roles::from_bits(
                            u64::try_from(bits).map_err(|_| Rejection::InvalidRoles)?,
                        )?,
                    }),
                    _ => Err(Rejection::InvalidScopeFormat),
                }
            })
            .collect::<Result<_, _>>()
            .map(GroupScope)
    }

    pub fn encode(&self) -> Vec<u8> {
        let value = Value::Array(
            self.0
                .iter()
                .map(|e| {
                    Value::Array(vec![
                        Value::Text(e.group.clone()),
                        Value::Integer(Integer::from(e.roles.bits())),
                    ])
                })
                .collect(),
        );
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&value, &mut buf).expect("writing into a Vec is infallible");
        buf
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|e| e.group.as_str())
    }
}

/// Interpreted scope of a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Permission names
    Text(Vec<String>),
    Group(GroupScope),
}

impl Scope {
    pub fn parse(claim: &ScopeClaim) -> Result<Self, Rejection> {
        match claim {
            ScopeClaim::Text(t) => {
                let names: Vec<String> = t.split_whitespace().map(String::from).collect();
                if names.is_empty() {
                    return Err(Rejection::InvalidScopeFormat);
                }
                Ok(Scope::Text(names))
            }
            ScopeClaim::Binary(b) => GroupScope::decode(b).map(Scope::Group),
        }
    }
}

/// Application policy deciding what scopes grant
///
/// Implementations must be pure functions of their configuration; the repository calls them
/// without holding any lock, possibly concurrently.
pub trait ScopeValidator: Send + Sync {
    /// Does a token for `audience` with the permission name `scope` allow `method` on `resource`?
    fn permits(&self, audience: &Audience, scope: &str, resource: &str, method: Method) -> bool;

    /// Does a token for `audience` granting `roles` in `group` allow `method` on `resource`?
    fn permits_group(
        &self,
        audience: &Audience,
        group: &str,
        roles: Roles,
        resource: &str,
        method: Method,
    ) -> bool;

    /// Whether the scope grants anything at all for the audience; tokens with meaningless scopes
    /// are not admitted
    fn is_meaningful(&self, _audience: &Audience, _scope: &Scope) -> bool {
        true
    }
}

/// Group section of a [`ScopePolicy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPolicy {
    /// Path under which group-membership resources live
    pub root: String,
    /// Audiences that identify a group manager; empty means any
    pub manager_audiences: BTreeSet<String>,
    /// Groups that have a group-membership resource
    pub groups: BTreeSet<String>,
    pub role_methods: BTreeMap<Role, BTreeSet<Method>>,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            root: "ace-group".into(),
            manager_audiences: BTreeSet::new(),
            groups: BTreeSet::new(),
            role_methods: Role::ALL
                .into_iter()
                .map(|r| (r, BTreeSet::from([Method::Post])))
                .collect(),
        }
    }
}

impl GroupPolicy {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn with_manager_audience(mut self, audience: impl Into<String>) -> Self {
        self.manager_audiences.insert(audience.into());
        self
    }

    pub fn membership_resource(&self, group: &str) -> String {
        format!("{}/{}", self.root, group)
    }

    /// Group whose membership resource `resource` is, if it is one
    pub fn group_of<'r>(&self, resource: &'r str) -> Option<&'r str> {
        let group = resource.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        self.groups.contains(group).then_some(group)
    }

    pub fn has_membership_resource(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    pub fn is_manager(&self, audience: &Audience) -> bool {
        self.manager_audiences.is_empty()
            || audience.iter().any(|a| self.manager_audiences.contains(a))
    }
}

/// Table driven [`ScopeValidator`]
#[derive(Debug, Clone, Default)]
pub struct ScopePolicy {
    audiences: BTreeSet<String>,
    scopes: BTreeMap<String, BTreeMap<String, BTreeSet<Method>>>,
    groups: Option<GroupPolicy>,
}

impl ScopePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the text scopes to tokens for this audience (by default, any audience will do)
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audiences.insert(audience.into());
        self
    }

    pub fn grant(
        mut self,
        scope: impl Into<String>,
        resource: impl Into<String>,
        methods: impl IntoIterator<Item = Method>,
    ) -> Self {
        self.scopes
            .entry(scope.into())
            .or_default()
            .entry(resource.into())
            .or_default()
            .extend(methods);
        self
    }

    pub fn with_groups(mut self, groups: GroupPolicy) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn groups(&self) -> Option<&GroupPolicy> {
        self.groups.as_ref()
    }

    fn audience_applies(&self, audience: &Audience) -> bool {
        self.audiences.is_empty() || audience.iter().any(|a| self.audiences.contains(a))
    }
}

impl ScopeValidator for ScopePolicy {
    fn permits(&self, audience: &Audience, scope: &str, resource: &str, method: Method) -> bool {
        self.audience_applies(audience)
            && self
                .scopes
                .get(scope)
                .and_then(|resources| resources.get(resource))
                .map_or(false, |methods| methods.contains(&method))
    }

    fn permits_group(
        &self,
        audience: &Audience,
        group: &str,
        roles: Roles,
        resource: &str,
        method: Method,
    ) -> bool {
        let Some(policy) = &self.groups else {
            return false;
        };
        policy.is_manager(audience)
            && policy.group_of(resource) == Some(group)
            && roles.iter().any(|role| {
                policy
                    .role_methods
                    .get(&role)
                    .map_or(false, |methods| methods.contains(&method))
            })
    }

    fn is_meaningful(&self, audience: &Audience, scope: &Scope) -> bool {
        match scope {
            Scope::Text(names) => {
                self.audience_applies(audience)
                    && names.iter().any(|n| self.scopes.contains_key(n))
            }
            Scope::Group(group_scope) => self.groups.as_ref().map_or(false, |policy| {
                policy.is_manager(audience)
                    && group_scope
                        .groups()
                        .all(|g| policy.has_membership_resource(g))
            }),
        }
    }
}
