//! Read-only view of registered users.

use crate::error::{EscrowError, EscrowResult};
use crate::models::UserRow;
use crate::schema::users;
use crate::state_machine::{Actor, ActorRole};
use crate::store::postgres::{pool_error, DbPool};
use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use payment_providers::Party;
use serde::{Deserialize, Serialize};
use shared::{string_enum, Contact};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Buyer,
    Seller,
    Admin,
}

string_enum!(UserRole, "user role", {
    Buyer => "buyer",
    Seller => "seller",
    Admin => "admin",
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: Uuid,
    pub role: UserRole,
    pub display_name: String,
    pub contact: Contact,
}

impl UserProfile {
    pub fn actor(&self) -> Actor {
        let role = match self.role {
            UserRole::Buyer => ActorRole::Buyer,
            UserRole::Seller => ActorRole::Seller,
            UserRole::Admin => ActorRole::Admin,
        };
        Actor::user(self.id, role)
    }

    pub fn party(&self) -> Party {
        Party {
            id: self.id,
            contact: self.contact.clone(),
        }
    }
}

impl TryFrom<UserRow> for UserProfile {
    type Error = EscrowError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            role: row.role.parse()?,
            display_name: row.display_name,
            contact: Contact {
                phone: row.phone,
                email: row.email,
            },
        })
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user_by_id(&self, id: Uuid) -> EscrowResult<Option<UserProfile>>;
}

pub struct PgUserDirectory {
    pool: DbPool,
}

impl PgUserDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_user_by_id(&self, id: Uuid) -> EscrowResult<Option<UserProfile>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        users::table
            .find(id)
            .first::<UserRow>(&mut conn)
            .await
            .optional()?
            .map(UserProfile::try_from)
            .transpose()
    }
}

#[derive(Default, Clone)]
pub struct InMemoryDirectory {
    users: Arc<RwLock<HashMap<Uuid, UserProfile>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, profile: UserProfile) {
        self.users.write().await.insert(profile.id, profile);
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn find_user_by_id(&self, id: Uuid) -> EscrowResult<Option<UserProfile>> {
        Ok(self.users.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_lookup() {
        let directory = InMemoryDirectory::new();
        let admin = UserProfile {
            id: Uuid::new_v4(),
            role: UserRole::Admin,
            display_name: "Ops".to_string(),
            contact: Contact::default(),
        };
        directory.insert(admin.clone()).await;

        let found = directory.find_user_by_id(admin.id).await.unwrap().unwrap();
        assert_eq!(found.actor().role, ActorRole::Admin);
        assert!(directory
            .find_user_by_id(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }
}
