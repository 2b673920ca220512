use {
    chrono::{DateTime, Utc},
    mongodb::bson::{Bson, Document},
    serde::{Deserialize, Serialize, Serializer},
    sha2::{Digest, Sha256},
    std::{collections::HashSet, fmt, path::Path},
    uuid::Uuid,
};

use crate::errors::ProvisionError;

pub const DEFAULT_DATABASE: &str = "aicodingdb";
pub const DEFAULT_USERNAME: &str = "aicodinguser";
pub const DEFAULT_PASSWORD: &str = "aicodingpass";
pub const DEFAULT_ROLE: &str = "readWrite";
pub const DEFAULT_COLLECTION: &str = "ai_problems";
pub const DEFAULT_INDEXED_FIELDS: [&str; 4] = ["category", "difficulty", "tags", "active"];

/// Name of the index every collection carries on `_id`.
pub const PRIMARY_KEY_INDEX: &str = "_id_";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct RoleScope {
    pub role: String,
    pub db: String,
}

impl RoleScope {
    pub fn new(role: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            db: db.into(),
        }
    }

    pub fn read_write(db: impl Into<String>) -> Self {
        Self::new(DEFAULT_ROLE, db)
    }
}

impl fmt::Display for RoleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.role, self.db)
    }
}

/// A password that never leaves the process in clear text except through
/// [`Password::expose`]. Serializing it always yields a placeholder.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters of the SHA-256 digest, safe to log.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(12);
        digest
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

impl Serialize for Password {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("<redacted>")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserCredential {
    pub user: String,
    pub pwd: Password,
    pub roles: Vec<RoleScope>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }

    /// Reads a direction out of an index key value. Shells store `1` as a
    /// double, drivers as int32 or int64.
    pub fn from_key(value: &Bson) -> Option<Self> {
        let n = match value {
            Bson::Int32(n) => *n as f64,
            Bson::Int64(n) => *n as f64,
            Bson::Double(n) => *n,
            _ => return None,
        };

        if n == 1.0 {
            Some(SortDirection::Ascending)
        } else if n == -1.0 {
            Some(SortDirection::Descending)
        } else {
            None
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct IndexDeclaration {
    pub collection: String,
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl IndexDeclaration {
    pub fn ascending(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn keys(&self) -> Document {
        let mut keys = Document::new();
        keys.insert(self.field.clone(), self.direction.as_i32());
        keys
    }

    /// The name the server assigns when none is given, e.g. `category_1`.
    pub fn default_name(&self) -> String {
        format!("{}_{}", self.field, self.direction.as_i32())
    }

    pub fn matches_keys(&self, keys: &Document) -> bool {
        if keys.len() != 1 {
            return false;
        }

        keys.get(&self.field)
            .and_then(SortDirection::from_key)
            .is_some_and(|direction| direction == self.direction)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProvisionPlan {
    pub database: String,
    pub user: UserCredential,
    pub indexes: Vec<IndexDeclaration>,
}

impl Default for ProvisionPlan {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            user: UserCredential {
                user: DEFAULT_USERNAME.to_string(),
                pwd: Password::new(DEFAULT_PASSWORD),
                roles: vec![RoleScope::read_write(DEFAULT_DATABASE)],
            },
            indexes: DEFAULT_INDEXED_FIELDS
                .iter()
                .map(|field| IndexDeclaration::ascending(DEFAULT_COLLECTION, *field))
                .collect(),
        }
    }
}

impl ProvisionPlan {
    pub fn from_file(path: &Path) -> Result<Self, ProvisionError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.database.trim().is_empty() {
            return Err(ProvisionError::InvalidPlan(
                "database name must not be empty".into(),
            ));
        }

        if self.user.user.trim().is_empty() {
            return Err(ProvisionError::InvalidPlan(
                "username must not be empty".into(),
            ));
        }

        if self.user.roles.is_empty() {
            return Err(ProvisionError::InvalidPlan(format!(
                "user {} has no roles",
                self.user.user
            )));
        }

        if let Some(stray) = self.user.roles.iter().find(|r| r.db != self.database) {
            return Err(ProvisionError::InvalidPlan(format!(
                "role {stray} is not scoped to {}",
                self.database
            )));
        }

        if let Some(index) = self
            .indexes
            .iter()
            .find(|i| i.collection.trim().is_empty() || i.field.trim().is_empty())
        {
            return Err(ProvisionError::InvalidPlan(format!(
                "index declaration {:?}.{:?} is incomplete",
                index.collection, index.field
            )));
        }

        Ok(())
    }

    /// Moves the plan to another database, carrying along every role that
    /// was scoped to the old one.
    pub fn retarget(&mut self, database: &str) {
        for role in self.user.roles.iter_mut() {
            if role.db == self.database {
                role.db = database.to_string();
            }
        }
        self.database = database.to_string();
    }

    /// Collections named by the index declarations, in first-seen order.
    pub fn collections(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.indexes
            .iter()
            .map(|i| i.collection.as_str())
            .filter(|c| seen.insert(*c))
            .collect()
    }

    pub fn role_set(&self) -> HashSet<RoleScope> {
        self.user.roles.iter().cloned().collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserOutcome {
    Created,
    AlreadyExisted,
}

#[derive(Debug, Serialize, Clone)]
pub struct ProvisionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database: String,
    pub user: String,
    pub user_outcome: UserOutcome,
    pub indexes: Vec<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct VerificationReport {
    pub database: String,
    pub user: String,
    pub user_exists: bool,
    pub roles_match: bool,
    pub roles: Vec<RoleScope>,
    pub indexes_present: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub strict: bool,
}

impl VerificationReport {
    pub fn is_satisfied(&self) -> bool {
        self.user_exists
            && self.roles_match
            && self.missing.is_empty()
            && (!self.strict || self.unexpected.is_empty())
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct CollectionCount {
    pub collection: String,
    pub documents: u64,
}

#[derive(Debug, Serialize, Clone)]
pub struct StatusReport {
    pub connected: bool,
    pub database: String,
    pub collections: Vec<CollectionCount>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}
