use std::collections::HashSet;

use chrono::Utc;
use tracing::{info, warn};

use crate::db::{DatabaseHandle, Engine};
use crate::errors::ProvisionError;
use crate::models::{
    CollectionCount, IndexDeclaration, PRIMARY_KEY_INDEX, ProvisionPlan, StatusReport,
    VerificationReport,
};

/// Reads back the user and indexes `plan` describes and compares them with
/// what the server holds. Nothing is written.
///
/// With `strict`, indexes on the planned collections that the plan does not
/// declare also make the report unsatisfied. The primary-key index is never
/// counted as unexpected.
pub async fn verify<E: Engine>(
    engine: &E,
    plan: &ProvisionPlan,
    strict: bool,
) -> Result<VerificationReport, ProvisionError> {
    plan.validate()?;
    engine.ping().await?;
    let db = engine.use_database(&plan.database)?;

    let (user_exists, roles) = match db.user_roles(&plan.user.user).await? {
        Some(roles) => (true, roles),
        None => (false, Vec::new()),
    };
    let roles_match =
        user_exists && roles.iter().cloned().collect::<HashSet<_>>() == plan.role_set();

    let mut indexes_present = Vec::new();
    let mut missing = Vec::new();
    let mut unexpected = Vec::new();

    for collection in plan.collections() {
        let existing = db.list_indexes(collection).await?;
        let declared: Vec<&IndexDeclaration> = plan
            .indexes
            .iter()
            .filter(|i| i.collection == collection)
            .collect();

        for index in &declared {
            if !existing.iter().any(|(_, keys)| index.matches_keys(keys)) {
                missing.push(format!("{collection}.{}", index.default_name()));
            }
        }

        for (name, keys) in &existing {
            indexes_present.push(format!("{collection}.{name}"));
            if name != PRIMARY_KEY_INDEX && !declared.iter().any(|i| i.matches_keys(keys)) {
                unexpected.push(format!("{collection}.{name}"));
            }
        }
    }

    let report = VerificationReport {
        database: plan.database.clone(),
        user: plan.user.user.clone(),
        user_exists,
        roles_match,
        roles,
        indexes_present,
        missing,
        unexpected,
        strict,
    };

    if report.is_satisfied() {
        info!(database = %report.database, "provisioned state matches plan");
    } else {
        warn!(
            database = %report.database,
            user_exists = report.user_exists,
            roles_match = report.roles_match,
            missing = ?report.missing,
            unexpected = ?report.unexpected,
            "provisioned state differs from plan"
        );
    }

    Ok(report)
}

/// Reports reachability and document counts. An unreachable server is a
/// result here, not an error.
pub async fn status<E: Engine>(
    engine: &E,
    plan: &ProvisionPlan,
) -> Result<StatusReport, ProvisionError> {
    let checked_at = Utc::now();

    if let Err(e) = engine.ping().await {
        if !e.is_connection() {
            return Err(e);
        }

        warn!(error = %e, "database unreachable");
        return Ok(StatusReport {
            connected: false,
            database: plan.database.clone(),
            collections: Vec::new(),
            error: Some(e.to_string()),
            checked_at,
        });
    }

    let db = engine.use_database(&plan.database)?;
    let mut collections = Vec::new();
    for collection in plan.collections() {
        let documents = db.count_documents(collection).await?;
        collections.push(CollectionCount {
            collection: collection.to_string(),
            documents,
        });
    }

    Ok(StatusReport {
        connected: true,
        database: plan.database.clone(),
        collections,
        error: None,
        checked_at,
    })
}
