use std::collections::HashSet;

use chrono::Utc;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::db::{DatabaseHandle, Engine};
use crate::errors::ProvisionError;
use crate::models::{ProvisionPlan, ProvisionReport, UserOutcome};

/// What to do when the application user is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistingUserPolicy {
    /// Let the server's duplicate-user error abort the run.
    #[default]
    Fail,
    /// Look the user up first and leave an existing one untouched.
    Skip,
}

pub struct Provisioner<E> {
    engine: E,
    policy: ExistingUserPolicy,
}

impl<E: Engine> Provisioner<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            policy: ExistingUserPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExistingUserPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Applies `plan`: selects the database, creates the user, then creates
    /// each index in order. Stops at the first failure without undoing
    /// anything already applied.
    pub async fn run(&self, plan: &ProvisionPlan) -> Result<ProvisionReport, ProvisionError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("provision", %run_id, database = %plan.database);

        self.apply(run_id, plan).instrument(span).await
    }

    async fn apply(
        &self,
        run_id: Uuid,
        plan: &ProvisionPlan,
    ) -> Result<ProvisionReport, ProvisionError> {
        let started_at = Utc::now();
        plan.validate()?;

        self.engine.ping().await?;
        let db = self.engine.use_database(&plan.database)?;
        info!(database = db.name(), "selected target database");

        let user_outcome = self.ensure_user(&db, plan).await?;

        let mut indexes = Vec::with_capacity(plan.indexes.len());
        for index in &plan.indexes {
            let name = db.create_index(index).await?;
            info!(
                collection = %index.collection,
                field = %index.field,
                index = %name,
                "index ensured"
            );
            indexes.push(name);
        }

        Ok(ProvisionReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            database: plan.database.clone(),
            user: plan.user.user.clone(),
            user_outcome,
            indexes,
        })
    }

    async fn ensure_user(
        &self,
        db: &E::Handle,
        plan: &ProvisionPlan,
    ) -> Result<UserOutcome, ProvisionError> {
        let credential = &plan.user;

        if self.policy == ExistingUserPolicy::Skip
            && let Some(roles) = db.user_roles(&credential.user).await?
        {
            if roles.into_iter().collect::<HashSet<_>>() != plan.role_set() {
                warn!(
                    user = %credential.user,
                    "existing user has different roles, leaving them as they are"
                );
            }
            info!(user = %credential.user, "user already exists, skipping");
            return Ok(UserOutcome::AlreadyExisted);
        }

        db.create_user(credential).await?;
        info!(
            user = %credential.user,
            roles = ?credential.roles.iter().map(ToString::to_string).collect::<Vec<_>>(),
            pwd_fingerprint = %credential.pwd.fingerprint(),
            "user created"
        );

        Ok(UserOutcome::Created)
    }
}
