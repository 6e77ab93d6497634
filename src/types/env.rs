//! The recognized `MONGODB_*` environment, read once at container start.
//!
//! Values are taken verbatim: a password of `007` or `true` stays a string.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;

use crate::error::EntrypointError;

pub const USER: &str = "MONGODB_USER";
pub const PASSWORD: &str = "MONGODB_PASSWORD";
pub const DATABASE: &str = "MONGODB_DATABASE";
pub const ADMIN_PASSWORD: &str = "MONGODB_ADMIN_PASSWORD";
pub const NOPREALLOC: &str = "MONGODB_NOPREALLOC";
pub const SMALLFILES: &str = "MONGODB_SMALLFILES";
pub const QUIET: &str = "MONGODB_QUIET";

const RECOGNIZED: [&str; 7] = [
    USER,
    PASSWORD,
    DATABASE,
    ADMIN_PASSWORD,
    NOPREALLOC,
    SMALLFILES,
    QUIET,
];
const SECRETS: [&str; 2] = [PASSWORD, ADMIN_PASSWORD];

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_DATABASE: &str = "admin";

const MAX_DATABASE_NAME_LEN: usize = 64;
const FORBIDDEN_DATABASE_CHARS: &[char] = &['/', '\\', '.', ' ', '"', '$', '\0'];

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Storage tuning flags; `None` leaves the engine default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageFlags {
    pub noprealloc: Option<bool>,
    pub smallfiles: Option<bool>,
    pub quiet: Option<bool>,
}

impl StorageFlags {
    /// Config keys in the order they are rendered.
    pub fn entries(&self) -> [(&'static str, Option<bool>); 3] {
        [
            ("noprealloc", self.noprealloc),
            ("smallfiles", self.smallfiles),
            ("quiet", self.quiet),
        ]
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct MongoEnv {
    pub app: Credentials,
    pub database: String,
    pub admin_password: Option<String>,
    pub flags: StorageFlags,
}

impl fmt::Debug for MongoEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoEnv")
            .field("app", &self.app)
            .field("database", &self.database)
            .field("admin", &self.admin_password.is_some())
            .field("flags", &self.flags)
            .finish()
    }
}

impl MongoEnv {
    pub fn from_process_env() -> Result<Self, EntrypointError> {
        Self::from_os_vars(std::env::vars_os())
    }

    /// Like [`MongoEnv::from_vars`], but for raw OS strings: a recognized
    /// variable whose value is not UTF-8 is an error, never treated as unset.
    pub fn from_os_vars<I>(vars: I) -> Result<Self, EntrypointError>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut utf8 = Vec::new();
        for (key, value) in vars {
            let Ok(key) = key.into_string() else {
                continue;
            };
            let Some(name) = RECOGNIZED.iter().copied().find(|name| *name == key) else {
                continue;
            };
            match value.into_string() {
                Ok(value) => utf8.push((name, value)),
                Err(raw) => {
                    let value = if SECRETS.contains(&name) {
                        "<redacted>".to_string()
                    } else {
                        raw.to_string_lossy().into_owned()
                    };
                    return Err(EntrypointError::InvalidValue {
                        name,
                        value,
                        reason: "value is not valid UTF-8",
                    });
                }
            }
        }
        Self::from_vars(utf8)
    }

    /// Build from any `(name, value)` source. Unrecognized names are ignored and
    /// empty values count as unset.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, EntrypointError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| k.starts_with("MONGODB_") && !v.is_empty())
            .collect();

        let missing: Vec<&'static str> = [USER, PASSWORD, DATABASE]
            .into_iter()
            .filter(|name| !vars.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(EntrypointError::MissingEnv(missing));
        }

        let flags = StorageFlags {
            noprealloc: parse_flag(NOPREALLOC, vars.get(NOPREALLOC))?,
            smallfiles: parse_flag(SMALLFILES, vars.get(SMALLFILES))?,
            quiet: parse_flag(QUIET, vars.get(QUIET))?,
        };

        let env = Self {
            app: Credentials::new(&vars[USER], &vars[PASSWORD]),
            database: vars[DATABASE].clone(),
            admin_password: vars.get(ADMIN_PASSWORD).cloned(),
            flags,
        };
        env.validate()
    }

    fn validate(self) -> Result<Self, EntrypointError> {
        validate_database_name(&self.database)?;
        if self.admin_password.is_some() && self.app.user == ADMIN_USER {
            return Err(EntrypointError::InvalidValue {
                name: USER,
                value: self.app.user,
                reason: "the admin user name is reserved when MONGODB_ADMIN_PASSWORD is set",
            });
        }
        Ok(self)
    }

    pub fn admin(&self) -> Option<Credentials> {
        self.admin_password
            .as_ref()
            .map(|pwd| Credentials::new(ADMIN_USER, pwd.clone()))
    }
}

pub fn parse_flag(name: &'static str, raw: Option<&String>) -> Result<Option<bool>, EntrypointError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "true" => Ok(Some(true)),
        "false" => Ok(Some(false)),
        _ => Err(EntrypointError::InvalidFlag {
            name,
            value: raw.clone(),
        }),
    }
}

fn validate_database_name(name: &str) -> Result<(), EntrypointError> {
    let reason = if name.len() > MAX_DATABASE_NAME_LEN {
        Some("database names are limited to 64 bytes")
    } else if name.contains(FORBIDDEN_DATABASE_CHARS) {
        Some("database names must not contain any of / \\ . space \" $ or NUL")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(EntrypointError::InvalidValue {
            name: DATABASE,
            value: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
