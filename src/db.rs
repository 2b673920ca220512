//! # Database connection module
//!
//! The provisioner talks to the server through two small traits:
//! [`Engine`] is a connection, [`DatabaseHandle`] is one database selected
//! on it. [`MongoEngine`] implements them over the `mongodb` driver.
//!
//! ## Configuration
//!
//! The server URI comes from `--url`, then `DATABASE_URL`, then
//! `MONGODB_URL`, and falls back to [`DEFAULT_URL`].
#![allow(async_fn_in_trait)]

use std::time::Duration;

use futures::TryStreamExt;
use mongodb::{
    Client, Database, IndexModel,
    bson::{Document, doc, from_document},
    error::{Error as MongoError, ErrorKind},
    options::ClientOptions,
};
use serde::Deserialize;

use crate::errors::ProvisionError;
use crate::models::{IndexDeclaration, RoleScope, UserCredential};

pub const DEFAULT_URL: &str = "mongodb://localhost:27017";

/// Server error codes for "user already exists". 51003 on current servers,
/// a duplicate key on the users collection on older ones.
const DUPLICATE_USER_CODES: [i32; 2] = [51003, 11000];
const NAMESPACE_NOT_FOUND: i32 = 26;

pub trait Engine {
    type Handle: DatabaseHandle;

    /// Round-trips to the server. Fails with [`ProvisionError::Connection`]
    /// when it cannot be reached.
    async fn ping(&self) -> Result<(), ProvisionError>;

    fn use_database(&self, name: &str) -> Result<Self::Handle, ProvisionError>;
}

pub trait DatabaseHandle {
    fn name(&self) -> &str;

    async fn create_user(&self, credential: &UserCredential) -> Result<(), ProvisionError>;

    /// Roles of `user` in this database, or `None` if there is no such user.
    async fn user_roles(&self, user: &str) -> Result<Option<Vec<RoleScope>>, ProvisionError>;

    /// Returns the name of the index, which the server reports whether or
    /// not the index already existed.
    async fn create_index(&self, index: &IndexDeclaration) -> Result<String, ProvisionError>;

    /// `(name, keys)` of every index on `collection`.
    async fn list_indexes(&self, collection: &str)
    -> Result<Vec<(String, Document)>, ProvisionError>;

    async fn count_documents(&self, collection: &str) -> Result<u64, ProvisionError>;
}

pub fn resolve_url(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .or_else(|| std::env::var("MONGODB_URL").ok())
        .unwrap_or_else(|| DEFAULT_URL.to_string())
}

#[derive(Clone, Debug)]
pub struct MongoEngine {
    client: Client,
}

impl MongoEngine {
    /// Builds a client. The driver connects lazily, so an unreachable
    /// server only shows up on [`Engine::ping`].
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, ProvisionError> {
        let mut options = ClientOptions::parse(url).await.map_err(classify)?;
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        options.server_selection_timeout = Some(timeout);
        options.connect_timeout = Some(timeout);

        let client = Client::with_options(options).map_err(classify)?;

        Ok(Self { client })
    }
}

impl Engine for MongoEngine {
    type Handle = MongoDatabase;

    async fn ping(&self) -> Result<(), ProvisionError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(classify)?;

        Ok(())
    }

    fn use_database(&self, name: &str) -> Result<MongoDatabase, ProvisionError> {
        if name.is_empty() {
            return Err(ProvisionError::InvalidPlan(
                "database name must not be empty".into(),
            ));
        }

        Ok(MongoDatabase {
            db: self.client.database(name),
        })
    }
}

#[derive(Clone, Debug)]
pub struct MongoDatabase {
    db: Database,
}

#[derive(Deserialize)]
struct UsersInfoReply {
    users: Vec<UserEntry>,
}

#[derive(Deserialize)]
struct UserEntry {
    user: String,
    #[serde(default)]
    roles: Vec<RoleScope>,
}

impl DatabaseHandle for MongoDatabase {
    fn name(&self) -> &str {
        self.db.name()
    }

    async fn create_user(&self, credential: &UserCredential) -> Result<(), ProvisionError> {
        let roles: Vec<Document> = credential
            .roles
            .iter()
            .map(|r| doc! { "role": &r.role, "db": &r.db })
            .collect();

        let command = doc! {
            "createUser": &credential.user,
            "pwd": credential.pwd.expose(),
            "roles": roles,
        };

        self.db
            .run_command(command)
            .await
            .map_err(|e| create_user_error(&credential.user, self.db.name(), e))?;

        Ok(())
    }

    async fn user_roles(&self, user: &str) -> Result<Option<Vec<RoleScope>>, ProvisionError> {
        let reply = self
            .db
            .run_command(doc! { "usersInfo": user })
            .await
            .map_err(classify)?;

        let reply: UsersInfoReply =
            from_document(reply).map_err(|e| ProvisionError::Engine(e.to_string()))?;

        Ok(reply
            .users
            .into_iter()
            .find(|entry| entry.user == user)
            .map(|entry| entry.roles))
    }

    async fn create_index(&self, index: &IndexDeclaration) -> Result<String, ProvisionError> {
        let collection = self.db.collection::<Document>(&index.collection);
        let model = IndexModel::builder().keys(index.keys()).build();

        let result = collection
            .create_index(model)
            .await
            .map_err(|e| create_index_error(index, e))?;

        Ok(result.index_name)
    }

    async fn list_indexes(
        &self,
        collection: &str,
    ) -> Result<Vec<(String, Document)>, ProvisionError> {
        let cursor = match self
            .db
            .collection::<Document>(collection)
            .list_indexes()
            .await
        {
            Ok(cursor) => cursor,
            Err(e) if is_namespace_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(classify(e)),
        };

        let models: Vec<IndexModel> = cursor.try_collect().await.map_err(classify)?;

        Ok(models
            .into_iter()
            .map(|model| {
                let name = model
                    .options
                    .as_ref()
                    .and_then(|o| o.name.clone())
                    .unwrap_or_default();
                (name, model.keys)
            })
            .collect())
    }

    async fn count_documents(&self, collection: &str) -> Result<u64, ProvisionError> {
        self.db
            .collection::<Document>(collection)
            .count_documents(doc! {})
            .await
            .map_err(classify)
    }
}

fn is_connection_failure(err: &MongoError) -> bool {
    matches!(
        *err.kind,
        ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::Authentication { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
    )
}

fn is_duplicate_user(err: &MongoError) -> bool {
    match *err.kind {
        ErrorKind::Command(ref cmd) => {
            DUPLICATE_USER_CODES.contains(&cmd.code) || cmd.message.contains("already exists")
        }
        _ => false,
    }
}

fn is_namespace_not_found(err: &MongoError) -> bool {
    matches!(*err.kind, ErrorKind::Command(ref cmd) if cmd.code == NAMESPACE_NOT_FOUND)
}

fn classify(err: MongoError) -> ProvisionError {
    if is_connection_failure(&err) {
        ProvisionError::Connection(err.to_string())
    } else {
        ProvisionError::Engine(err.to_string())
    }
}

fn create_user_error(user: &str, db: &str, err: MongoError) -> ProvisionError {
    if is_duplicate_user(&err) {
        ProvisionError::DuplicateUser {
            user: user.to_string(),
            db: db.to_string(),
            message: err.to_string(),
        }
    } else {
        classify(err)
    }
}

fn create_index_error(index: &IndexDeclaration, err: MongoError) -> ProvisionError {
    if is_connection_failure(&err) {
        classify(err)
    } else {
        ProvisionError::IndexCreation {
            collection: index.collection.clone(),
            field: index.field.clone(),
            message: err.to_string(),
        }
    }
}
