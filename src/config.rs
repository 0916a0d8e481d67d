// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Resource server configuration, read from TOML
//!
//! ```toml
//! audiences = ["rs1"]
//! issuers = ["AS"]
//! as_uri = "coaps://as.example.com/token"
//! token_store = "/var/lib/rs/tokens.json"
//!
//! [as_key]
//! key = "6162630405060708090a0b0c0d0e0f10"
//! alg = 10
//!
//! [[keys]]
//! kid = "ourKey"
//! k = "0102030405060708090a0b0c0d0e0f10"
//!
//! [scopes.r_temp]
//! temp = ["GET"]
//!
//! [groups]
//! manager_audiences = ["rs1"]
//!
//! [[groups.role_methods]]
//! role = "Requester"
//! methods = ["POST"]
//!
//! [groups.groups.feedca570000]
//! sign_alg = -8
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ciborium::value::{Integer, Value};
use serde::Deserialize;

use crate::authz_info::{AuthzInfo, Profile};
use crate::crypto::{CcmAlgorithm, CwtCryptoContext};
use crate::error::ConfigError;
use crate::pop::PopKey;
use crate::profiles::{GroupInfo, GroupJoin, RandomSource};
use crate::repository::TokenRepository;
use crate::scope::{GroupPolicy, Method, Role, ScopePolicy, ScopeValidator};
use crate::time::TimeSource;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RsConfig {
    /// Identifiers of this RS; tokens must be for one of them
    pub audiences: Vec<String>,
    /// Trusted token issuers
    pub issuers: Vec<String>,
    /// Where clients get tokens, as announced in request creation hints
    #[serde(default)]
    pub as_uri: String,
    /// File the token repository is persisted to; tokens are kept in memory only if unset
    #[serde(default)]
    pub token_store: Option<PathBuf>,
    /// Key shared with the AS, with which tokens are encrypted
    pub as_key: SharedKey,
    /// Keys known out of band
    #[serde(default)]
    pub keys: Vec<ProvisionedKey>,
    /// scope -> resource -> methods
    #[serde(default)]
    pub scopes: BTreeMap<String, BTreeMap<String, Vec<Method>>>,
    #[serde(default)]
    pub groups: Option<GroupsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedKey {
    /// Hex encoded
    pub key: String,
    /// COSE algorithm label
    #[serde(default = "default_alg")]
    pub alg: i64,
}

fn default_alg() -> i64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionedKey {
    pub kid: String,
    /// Hex encoded symmetric key
    pub k: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupsConfig {
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default)]
    pub manager_audiences: Vec<String>,
    /// Groups with a group-membership resource
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
    /// Methods each role may use on group-membership resources; POST for all roles if empty
    #[serde(default)]
    pub role_methods: Vec<RoleMethods>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleMethods {
    pub role: Role,
    pub methods: Vec<Method>,
}

fn default_root() -> String {
    "ace-group".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub sign_alg: Option<i64>,
    pub sign_parameters: Option<Vec<Vec<i64>>>,
    pub sign_key_parameters: Option<Vec<i64>>,
    pub cred_fmt: Option<i64>,
}

fn int_array(items: &[i64]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|i| Value::Integer(Integer::from(*i)))
            .collect(),
    )
}

fn decode_hex(what: &str, data: &str) -> Result<Vec<u8>, ConfigError> {
    hex::decode(data).map_err(|e| ConfigError::Config(format!("{what} is not valid hex: {e}")))
}

impl RsConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        if config.audiences.is_empty() {
            return Err(ConfigError::Config("at least one audience is required".into()));
        }
        if config.issuers.is_empty() {
            return Err(ConfigError::Config("at least one issuer is required".into()));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn group_policy(&self) -> Option<GroupPolicy> {
        let config = self.groups.as_ref()?;
        let mut policy = GroupPolicy {
            root: config.root.clone(),
            ..GroupPolicy::default()
        };
        for audience in &config.manager_audiences {
            policy = policy.with_manager_audience(audience.as_str());
        }
        for group in config.groups.keys() {
            policy = policy.with_group(group.as_str());
        }
        if !config.role_methods.is_empty() {
            policy.role_methods.clear();
            for RoleMethods { role, methods } in &config.role_methods {
                policy
                    .role_methods
                    .entry(*role)
                    .or_default()
                    .extend(methods.iter().copied());
            }
        }
        Some(policy)
    }

    pub fn scope_policy(&self) -> ScopePolicy {
        let mut policy = ScopePolicy::new();
        for audience in &self.audiences {
            policy = policy.with_audience(audience.as_str());
        }
        for (scope, resources) in &self.scopes {
            for (resource, methods) in resources {
                policy = policy.grant(scope.as_str(), resource.as_str(), methods.iter().copied());
            }
        }
        if let Some(groups) = self.group_policy() {
            policy = policy.with_groups(groups);
        }
        policy
    }

    pub fn crypto_context(&self) -> Result<CwtCryptoContext, ConfigError> {
        let alg = CcmAlgorithm::from_label(self.as_key.alg)
            .map_err(|e| ConfigError::Config(format!("as_key: {e}")))?;
        let key = decode_hex("as_key.key", &self.as_key.key)?;
        CwtCryptoContext::new(key, alg).map_err(|e| ConfigError::Config(format!("as_key: {e}")))
    }

    /// Open the token repository, with all configured keys provisioned
    pub fn open_repository(
        &self,
        validator: Arc<dyn ScopeValidator>,
        time: Arc<dyn TimeSource>,
    ) -> Result<TokenRepository, ConfigError> {
        let keys = self
            .keys
            .iter()
            .map(|k| {
                Ok(PopKey::symmetric(
                    k.kid.as_bytes(),
                    decode_hex(&format!("key {}", k.kid), &k.k)?,
                ))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let repository = TokenRepository::create(validator, time, self.token_store.clone())?;
        for key in keys {
            repository.provision_key(key)?;
        }
        Ok(repository)
    }

    /// The /authz-info pipeline for this configuration
    pub fn authz_info<P: Profile>(
        &self,
        repository: Arc<TokenRepository>,
        validator: Arc<dyn ScopeValidator>,
        time: Arc<dyn TimeSource>,
        profile: P,
    ) -> Result<AuthzInfo<P>, ConfigError> {
        let crypto = self.crypto_context()?;
        let mut authz_info = AuthzInfo::new(repository, crypto, validator, time, profile)
            .with_as_uri(self.as_uri.as_str());
        for audience in &self.audiences {
            authz_info = authz_info.with_audience(audience.as_str());
        }
        for issuer in &self.issuers {
            authz_info = authz_info.with_issuer(issuer.as_str());
        }
        Ok(authz_info)
    }

    /// Wrap `inner` for group joining, if groups are configured
    pub fn group_join<P: Profile>(&self, inner: P, random: RandomSource) -> Option<GroupJoin<P>> {
        let policy = self.group_policy()?;
        let groups = &self.groups.as_ref()?.groups;
        let mut join = GroupJoin::new(inner, policy, random);
        for (name, group) in groups {
            if let Some(sign_alg) = group.sign_alg {
                join = join.with_group_info(
                    name.as_str(),
                    GroupInfo {
                        sign_alg,
                        sign_parameters: group.sign_parameters.as_ref().map(|params| {
                            Value::Array(params.iter().map(|p| int_array(p)).collect())
                        }),
                        sign_key_parameters: group.sign_key_parameters.as_deref().map(int_array),
                        cred_fmt: group.cred_fmt,
                    },
                );
            }
        }
        Some(join)
    }
}
