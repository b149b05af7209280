//! Owner identity lookup.
//!
//! Job records name their owner by account uuid; storage paths use the
//! account login.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ArchiverError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub uuid: String,
    pub login: String,
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Fails with `AccountNotFound` for unknown owners.
    async fn resolve_owner(&self, owner: &str) -> Result<Account>;
}

/// Identity service answering from a fixed uuid → login table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    accounts: BTreeMap<String, String>,
}

impl StaticIdentity {
    pub fn new(accounts: BTreeMap<String, String>) -> Self {
        Self { accounts }
    }

    pub fn with_account(mut self, uuid: &str, login: &str) -> Self {
        self.accounts.insert(uuid.to_string(), login.to_string());
        self
    }
}

#[async_trait]
impl IdentityService for StaticIdentity {
    async fn resolve_owner(&self, owner: &str) -> Result<Account> {
        self.accounts
            .get(owner)
            .map(|login| Account {
                uuid: owner.to_string(),
                login: login.clone(),
            })
            .ok_or_else(|| ArchiverError::AccountNotFound(owner.to_string()))
    }
}
