//! In-memory stand-in for a MongoDB server, recording every call it sees.

use std::sync::{Arc, Mutex, MutexGuard};

use mongodb::bson::{Document, doc};

use crate::db::{DatabaseHandle, Engine};
use crate::errors::ProvisionError;
use crate::models::{IndexDeclaration, PRIMARY_KEY_INDEX, RoleScope, UserCredential};

#[derive(Default)]
struct FakeState {
    unreachable: bool,
    failing_field: Option<String>,
    users: Vec<(String, String, Vec<RoleScope>)>,
    indexes: Vec<(String, String, String, Document)>,
    documents: Vec<(String, String, u64)>,
    calls: Vec<String>,
}

impl FakeState {
    fn ensure_collection(&mut self, db: &str, collection: &str) {
        let exists = self
            .indexes
            .iter()
            .any(|(d, c, _, _)| d == db && c == collection);

        if !exists {
            self.indexes.push((
                db.to_string(),
                collection.to_string(),
                PRIMARY_KEY_INDEX.to_string(),
                doc! { "_id": 1 },
            ));
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        let engine = Self::new();
        engine.lock().unreachable = true;
        engine
    }

    pub fn failing_index(self, field: &str) -> Self {
        self.lock().failing_field = Some(field.to_string());
        self
    }

    pub fn with_user(self, db: &str, user: &str, roles: Vec<RoleScope>) -> Self {
        self.lock()
            .users
            .push((db.to_string(), user.to_string(), roles));
        self
    }

    pub fn with_index(self, db: &str, collection: &str, name: &str, keys: Document) -> Self {
        {
            let mut state = self.lock();
            state.ensure_collection(db, collection);
            state.indexes.push((
                db.to_string(),
                collection.to_string(),
                name.to_string(),
                keys,
            ));
        }
        self
    }

    pub fn with_documents(self, db: &str, collection: &str, count: u64) -> Self {
        self.lock()
            .documents
            .push((db.to_string(), collection.to_string(), count));
        self
    }

    pub fn users(&self, db: &str) -> Vec<String> {
        self.lock()
            .users
            .iter()
            .filter(|(d, _, _)| d == db)
            .map(|(_, u, _)| u.clone())
            .collect()
    }

    pub fn roles(&self, db: &str, user: &str) -> Option<Vec<RoleScope>> {
        self.lock()
            .users
            .iter()
            .find(|(d, u, _)| d == db && u == user)
            .map(|(_, _, roles)| roles.clone())
    }

    pub fn index_names(&self, db: &str, collection: &str) -> Vec<String> {
        self.lock()
            .indexes
            .iter()
            .filter(|(d, c, _, _)| d == db && c == collection)
            .map(|(_, _, name, _)| name.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

fn refused() -> ProvisionError {
    ProvisionError::Connection("connection refused".into())
}

impl Engine for FakeEngine {
    type Handle = FakeDatabase;

    async fn ping(&self) -> Result<(), ProvisionError> {
        let mut state = self.lock();
        state.calls.push("ping".into());
        if state.unreachable {
            return Err(refused());
        }
        Ok(())
    }

    fn use_database(&self, name: &str) -> Result<FakeDatabase, ProvisionError> {
        self.lock().calls.push(format!("use {name}"));
        Ok(FakeDatabase {
            name: name.to_string(),
            engine: self.clone(),
        })
    }
}

pub struct FakeDatabase {
    name: String,
    engine: FakeEngine,
}

impl FakeDatabase {
    fn lock(&self, call: String) -> Result<MutexGuard<'_, FakeState>, ProvisionError> {
        let mut state = self.engine.lock();
        state.calls.push(call);
        if state.unreachable {
            return Err(refused());
        }
        Ok(state)
    }
}

impl DatabaseHandle for FakeDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_user(&self, credential: &UserCredential) -> Result<(), ProvisionError> {
        let mut state = self.lock(format!("createUser {}", credential.user))?;

        if state
            .users
            .iter()
            .any(|(d, u, _)| *d == self.name && *u == credential.user)
        {
            return Err(ProvisionError::DuplicateUser {
                user: credential.user.clone(),
                db: self.name.clone(),
                message: format!("User \"{}@{}\" already exists", credential.user, self.name),
            });
        }

        state.users.push((
            self.name.clone(),
            credential.user.clone(),
            credential.roles.clone(),
        ));
        Ok(())
    }

    async fn user_roles(&self, user: &str) -> Result<Option<Vec<RoleScope>>, ProvisionError> {
        let state = self.lock(format!("usersInfo {user}"))?;

        Ok(state
            .users
            .iter()
            .find(|(d, u, _)| *d == self.name && u == user)
            .map(|(_, _, roles)| roles.clone()))
    }

    async fn create_index(&self, index: &IndexDeclaration) -> Result<String, ProvisionError> {
        let mut state = self.lock(format!(
            "createIndex {}.{}",
            index.collection, index.field
        ))?;

        if state.failing_field.as_deref() == Some(index.field.as_str()) {
            return Err(ProvisionError::IndexCreation {
                collection: index.collection.clone(),
                field: index.field.clone(),
                message: "not authorized".into(),
            });
        }

        state.ensure_collection(&self.name, &index.collection);

        let keys = index.keys();
        let existing = state
            .indexes
            .iter()
            .find(|(d, c, _, k)| *d == self.name && *c == index.collection && *k == keys)
            .map(|(_, _, name, _)| name.clone());

        if let Some(name) = existing {
            return Ok(name);
        }

        let name = index.default_name();
        state.indexes.push((
            self.name.clone(),
            index.collection.clone(),
            name.clone(),
            keys,
        ));
        Ok(name)
    }

    async fn list_indexes(
        &self,
        collection: &str,
    ) -> Result<Vec<(String, Document)>, ProvisionError> {
        let state = self.lock(format!("listIndexes {collection}"))?;

        Ok(state
            .indexes
            .iter()
            .filter(|(d, c, _, _)| *d == self.name && c == collection)
            .map(|(_, _, name, keys)| (name.clone(), keys.clone()))
            .collect())
    }

    async fn count_documents(&self, collection: &str) -> Result<u64, ProvisionError> {
        let state = self.lock(format!("count {collection}"))?;

        Ok(state
            .documents
            .iter()
            .find(|(d, c, _)| *d == self.name && c == collection)
            .map_or(0, |(_, _, n)| *n))
    }
}
