//! Assertions the harness runs against a reachable container.

use serde_json::Value;
use tracing::info;

use super::container::Container;
use crate::config::{DATA_DIR_GID, DATA_DIR_UID};
use crate::engine::shell::js_string;
use crate::error::EntrypointError;
use crate::types::Credentials;
use crate::types::env::ADMIN_DATABASE;

const CRUD_COLLECTION: &str = "harness_crud";

fn fail(msg: impl Into<String>) -> EntrypointError {
    EntrypointError::Harness(msg.into())
}

/// Insert, read, update, and delete one document as `creds` in `database`.
pub async fn check_crud(
    container: &Container,
    creds: &Credentials,
    database: &str,
) -> Result<(), EntrypointError> {
    let shell = container.shell_as(creds, database);
    let coll = js_string(CRUD_COLLECTION)?;
    let script = format!(
        "var c = db.getCollection({coll}); \
         c.insert({{probe: 1, label: \"inserted\"}}); \
         c.update({{probe: 1}}, {{$set: {{label: \"updated\"}}}}); \
         var err = db.getLastError(); if (err) {{ throw err; }} \
         print(tojson(c.findOne({{probe: 1}}, {{_id: 0}}))); \
         c.remove({{probe: 1}}); \
         print(c.count({{probe: 1}}));"
    );
    let output = shell.eval(database, &script).await?;
    let (doc, count) = parse_crud_output(&output)?;

    if doc.get("label").and_then(Value::as_str) != Some("updated") {
        return Err(fail(format!("unexpected document after update: {doc}")));
    }
    if count != 0 {
        return Err(fail(format!("{count} documents left after remove")));
    }
    let uri = container.connection_uri(&creds.user, database)?;
    info!(%uri, "CRUD check passed");
    Ok(())
}

/// `creds` authenticated against `auth_db` must not be able to write to
/// `other_db`.
pub async fn check_denied(
    container: &Container,
    creds: &Credentials,
    auth_db: &str,
    other_db: &str,
) -> Result<(), EntrypointError> {
    let shell = container.shell_as(creds, auth_db);
    let script = "db.getCollection(\"denied\").insert({a: 1}); \
                  var err = db.getLastError(); if (err) { throw err; }";
    match shell.eval(other_db, script).await {
        Err(EntrypointError::ShellFailed { .. }) => {
            info!(user = %creds.user, other_db, "access denied as expected");
            Ok(())
        }
        Err(e) => Err(e),
        Ok(_) => Err(fail(format!(
            "{} unexpectedly wrote to {other_db}",
            creds.user
        ))),
    }
}

/// Whether `creds` may list every database, the privilege only the admin has.
pub async fn can_list_databases(
    container: &Container,
    creds: &Credentials,
    auth_db: &str,
) -> Result<bool, EntrypointError> {
    let shell = container.shell_as(creds, auth_db);
    let script = "print(tojson(db.adminCommand({listDatabases: 1}).ok))";
    match shell.eval(ADMIN_DATABASE, script).await {
        Ok(out) => Ok(out.lines().last().map(str::trim) == Some("1")),
        Err(EntrypointError::ShellFailed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Authentication must fail for a wrong password.
pub async fn check_rejects_password(
    container: &Container,
    user: &str,
    wrong_password: &str,
    database: &str,
) -> Result<(), EntrypointError> {
    let shell = container.shell_as(&Credentials::new(user, wrong_password), database);
    match shell.eval(database, "print(db.getName())").await {
        Err(EntrypointError::ShellFailed { .. }) => Ok(()),
        Err(e) => Err(e),
        Ok(_) => Err(fail(format!("{user} authenticated with a wrong password"))),
    }
}

/// Every `(key, expected)` must match the rendered config: `Some(v)` means a
/// `key = v` line, `None` means no line for `key` at all.
pub async fn check_config_lines(
    container: &Container,
    path: &str,
    expected: &[(&str, Option<&str>)],
) -> Result<(), EntrypointError> {
    let contents = container.read_file(path).await?;
    verify_config(&contents, expected)
}

pub fn verify_config(contents: &str, expected: &[(&str, Option<&str>)]) -> Result<(), EntrypointError> {
    for (key, value) in expected {
        let found = config_value(contents, key);
        if found.as_deref() != *value {
            return Err(fail(format!(
                "config key {key}: expected {value:?}, found {found:?}"
            )));
        }
    }
    Ok(())
}

pub fn config_value(contents: &str, key: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().to_string())
    })
}

/// The data directory keeps its image ownership whatever user runs the container.
pub async fn check_data_dir_owner(container: &Container, path: &str) -> Result<(), EntrypointError> {
    let raw = container.exec(&["stat", "-c", "%u:%g", path]).await?;
    let owner = parse_owner(&raw)?;
    if owner != (DATA_DIR_UID, DATA_DIR_GID) {
        return Err(fail(format!(
            "{path} owned by {}:{}, expected {DATA_DIR_UID}:{DATA_DIR_GID}",
            owner.0, owner.1
        )));
    }
    Ok(())
}

pub fn parse_owner(raw: &str) -> Result<(u32, u32), EntrypointError> {
    let (uid, gid) = raw
        .trim()
        .split_once(':')
        .ok_or_else(|| fail(format!("unexpected stat output {raw:?}")))?;
    let parse = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| fail(format!("unexpected stat output {raw:?}")))
    };
    Ok((parse(uid)?, parse(gid)?))
}

fn parse_crud_output(output: &str) -> Result<(Value, u64), EntrypointError> {
    let mut lines = output.lines().rev();
    let count = lines
        .next()
        .and_then(|l| l.trim().parse::<u64>().ok())
        .ok_or_else(|| fail(format!("missing count in output {output:?}")))?;
    let doc_text: Vec<&str> = lines.collect::<Vec<_>>().into_iter().rev().collect();
    let doc: Value = serde_json::from_str(&doc_text.join("\n"))?;
    Ok((doc, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_lookup_ignores_spacing() {
        let conf = "dbpath = /var/lib/mongodb/data\nport=27017\nquiet = true\n";
        assert_eq!(config_value(conf, "port").as_deref(), Some("27017"));
        assert_eq!(config_value(conf, "quiet").as_deref(), Some("true"));
        assert_eq!(config_value(conf, "smallfiles"), None);
    }

    #[test]
    fn verify_config_checks_presence_and_absence() {
        let conf = "dbpath = /d\nport = 27017\nnoprealloc = true\n";
        verify_config(conf, &[("noprealloc", Some("true")), ("quiet", None)]).unwrap();
        assert!(verify_config(conf, &[("noprealloc", None)]).is_err());
        assert!(verify_config(conf, &[("quiet", Some("true"))]).is_err());
    }

    #[test]
    fn owner_parsing() {
        assert_eq!(parse_owner("184:998\n").unwrap(), (184, 998));
        assert!(parse_owner("root").is_err());
        assert!(parse_owner("a:b").is_err());
    }

    #[test]
    fn crud_output_parsing() {
        let out = "{ \"probe\" : 1, \"label\" : \"updated\" }\n0";
        let (doc, count) = parse_crud_output(out).unwrap();
        assert_eq!(doc["label"], "updated");
        assert_eq!(count, 0);
    }

    #[test]
    fn multiline_document_output() {
        let out = "{\n\t\"probe\" : 1,\n\t\"label\" : \"updated\"\n}\n0";
        let (doc, _) = parse_crud_output(out).unwrap();
        assert_eq!(doc["probe"], 1);
    }
}
