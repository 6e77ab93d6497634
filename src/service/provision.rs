use serde_json::json;
use tracing::{error, info};

use crate::engine::Engine;
use crate::engine::shell::js_string;
use crate::error::EntrypointError;
use crate::types::env::ADMIN_DATABASE;
use crate::types::{Credentials, MongoEnv};

pub const ADMIN_ROLES: &[&str] = &[
    "dbAdminAnyDatabase",
    "userAdminAnyDatabase",
    "readWriteAnyDatabase",
    "clusterAdmin",
];
pub const APP_ROLES: &[&str] = &["readWrite"];

/// Shell script adding `creds` to `database`. Every user-supplied value is a
/// JSON literal; the script throws if the server reports an error.
pub fn add_user_script(
    database: &str,
    creds: &Credentials,
    roles: &[&str],
) -> Result<String, EntrypointError> {
    let user = json!({
        "user": creds.user,
        "pwd": creds.password,
        "roles": roles,
    });
    Ok(format!(
        "var target = db.getSiblingDB({db}); \
         target.addUser({user}); \
         var err = target.getLastError(); \
         if (err) {{ throw err; }}",
        db = js_string(database)?,
        user = serde_json::to_string(&user)?,
    ))
}

/// Create the admin user (when configured) and then the application user.
///
/// Returns the users created, in order. If the admin was created but the
/// application user was not, the error says so.
pub async fn provision_users<E: Engine>(
    engine: &E,
    env: &MongoEnv,
) -> Result<Vec<String>, EntrypointError> {
    let mut created = Vec::new();

    if let Some(admin) = env.admin() {
        add_user(engine, ADMIN_DATABASE, &admin, ADMIN_ROLES)
            .await
            .map_err(|e| EntrypointError::Provisioning {
                target: format!("{}@{}", admin.user, ADMIN_DATABASE),
                reason: e.to_string(),
            })?;
        created.push(admin.user);
    }

    let target = format!("{}@{}", env.app.user, env.database);
    match add_user(engine, &env.database, &env.app, APP_ROLES).await {
        Ok(()) => {
            created.push(env.app.user.clone());
            Ok(created)
        }
        Err(e) if created.is_empty() => Err(EntrypointError::Provisioning {
            target,
            reason: e.to_string(),
        }),
        Err(e) => {
            error!(created = ?created, failed = %target, "bootstrap left partially provisioned");
            Err(EntrypointError::ProvisioningIncomplete {
                created,
                failed: target,
                reason: e.to_string(),
            })
        }
    }
}

async fn add_user<E: Engine>(
    engine: &E,
    database: &str,
    creds: &Credentials,
    roles: &[&str],
) -> Result<(), EntrypointError> {
    let script = add_user_script(database, creds, roles)?;
    engine.eval(database, &script).await?;
    info!(user = %creds.user, database, roles = ?roles, "user created");
    Ok(())
}
