use std::process::exit;
use std::sync::{LazyLock, RwLock};

use job_scheduler_ng::Schedule;
use regex::Regex;

use crate::{
    db::DbConnType,
    error::Error,
    util::{get_env, get_env_bool, parse_string_list},
};

static CONFIG_FILE: LazyLock<String> = LazyLock::new(|| {
    let data_folder = get_env("DATA_FOLDER").unwrap_or_else(|| String::from("data"));
    get_env("ACCESS_CONFIG_FILE").unwrap_or_else(|| format!("{data_folder}/config.json"))
});

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| {
    Config::load().unwrap_or_else(|e| {
        println!("Error loading config:\n  {e:?}\n");
        exit(12)
    })
});

pub type Pass = String;

macro_rules! make_config {
    ($(
        $(#[doc = $groupdoc:literal])?
        $group:ident {
        $(
            $(#[doc = $doc:literal])+
            $name:ident : $ty:ident, $none_action:ident $(, $default:expr)?;
        )+},
    )+) => {
        pub struct Config { inner: RwLock<Inner> }

        struct Inner {
            name_regex: Regex,
            config: ConfigItems,
        }

        #[derive(Clone, Default, Deserialize, Serialize)]
        pub struct ConfigBuilder {
            $($(
                #[serde(skip_serializing_if = "Option::is_none")]
                $name: Option<$ty>,
            )+)+
        }

        impl ConfigBuilder {
            #[allow(clippy::field_reassign_with_default)]
            fn from_env() -> Self {
                let env_file = get_env("ENV_FILE").unwrap_or_else(|| String::from(".env"));
                match dotenvy::from_path(&env_file) {
                    Ok(_) => {
                        println!("[INFO] Using environment file `{env_file}` for configuration.\n");
                    },
                    Err(e) => match e {
                        dotenvy::Error::LineParse(msg, pos) => {
                            println!("[ERROR] Failed parsing environment file: `{env_file}`\nNear {msg:?} on position {pos}\nPlease fix and restart!\n");
                            exit(255);
                        },
                        dotenvy::Error::Io(ioerr) => match ioerr.kind() {
                            std::io::ErrorKind::NotFound => {
                                // Only exit if this environment variable is set, but the file was not found.
                                // This prevents incorrectly configured environments.
                                if let Some(env_file) = get_env::<String>("ENV_FILE") {
                                    println!("[ERROR] The configured ENV_FILE `{env_file}` was not found!\n");
                                    exit(255);
                                }
                            },
                            std::io::ErrorKind::PermissionDenied => {
                                println!("[ERROR] Permission denied while trying to read environment file `{env_file}`!\n");
                                exit(255);
                            },
                            _ => {
                                println!("[ERROR] Reading environment file `{env_file}` failed:\n{ioerr:?}\n");
                                exit(255);
                            }
                        },
                        _ => {
                            println!("[ERROR] Reading environment file `{env_file}` failed:\n{e:?}\n");
                            exit(255);
                        }
                    }
                };

                let mut builder = ConfigBuilder::default();
                $($(
                    builder.$name = make_config! { @getenv pastey::paste!(stringify!([<$name:upper>])), $ty };
                )+)+

                builder
            }

            fn from_file(path: &str) -> Result<Self, Error> {
                let config_str = std::fs::read_to_string(path)?;
                println!("[INFO] Using config override file `{path}` for configuration.\n");
                serde_json::from_str(&config_str).map_err(Into::into)
            }

            /// Merges the values of both builders into a new builder.
            /// If both have the same element, `other` wins.
            fn merge(&self, other: &Self, show_overrides: bool) -> Self {
                let mut overrides = Vec::new();
                let mut builder = self.clone();
                $($(
                    if let v @ Some(_) = &other.$name {
                        builder.$name = v.clone();

                        if self.$name.is_some() {
                            overrides.push(pastey::paste!(stringify!([<$name:upper>])).to_string());
                        }
                    }
                )+)+

                if show_overrides && !overrides.is_empty() {
                    // We can't use warn! here because logging isn't setup yet.
                    println!("[WARNING] The following environment variables are being overridden by the config file:");
                    println!("[WARNING] {}\n", overrides.join(", "));
                }

                builder
            }

            fn build(&self) -> ConfigItems {
                let mut config = ConfigItems::default();
                $($(
                    config.$name = make_config!{ @build self.$name.clone(), &config, $none_action, $($default)? };
                )+)+

                config
            }
        }

        #[derive(Clone, Default)]
        struct ConfigItems { $($( $name: make_config!{@type $ty, $none_action}, )+)+ }

        #[allow(unused)]
        impl Config {
            $($(
                $(#[doc = $doc])+
                pub fn $name(&self) -> make_config!{@type $ty, $none_action} {
                    self.inner.read().unwrap().config.$name.clone()
                }
            )+)+
        }
    };

    // Group or empty string
    ( @show ) => { "" };
    ( @show $lit:literal ) => { $lit };

    // Wrap the optionals in an Option type
    ( @type $ty:ty, option) => { Option<$ty> };
    ( @type $ty:ty, $id:ident) => { $ty };

    // Generate the values depending on none_action
    ( @build $value:expr, $config:expr, option, ) => { $value };
    ( @build $value:expr, $config:expr, def, $default:expr ) => { $value.unwrap_or($default) };
    ( @build $value:expr, $config:expr, auto, $default_fn:expr ) => {{
        match $value {
            Some(v) => v,
            None => {
                let f: &dyn Fn(&ConfigItems) -> _ = &$default_fn;
                f($config)
            }
        }
    }};

    ( @getenv $name:expr, bool ) => { get_env_bool($name) };
    ( @getenv $name:expr, $ty:ident ) => { get_env($name) };
}

make_config! {
    folders {
        ///  Data folder |> Main data folder
        data_folder:            String, def,    String::from("data");
    },
    database {
        /// Database URL
        database_url:           String, auto,   |c| format!("{}/{}", c.data_folder, "db.sqlite3");
        /// Database connection pool size
        database_max_conns:     u32,    def,    10;
        /// Database connection min pool size
        database_min_conns:     u32,    def,    2;
        /// Database connection init |> SQL statements to run when creating a new database connection, mainly useful for connection-scoped pragmas. If empty, a database-specific default is used.
        database_conn_init:     String, def,    String::new();
        /// Timeout when acquiring database connection
        database_timeout:       u64,    def,    30;
        /// Database connection idle timeout |> Timeout in seconds before idle connections to the database are closed
        database_idle_timeout:  u64,    def,    600;
        /// Retries when the initial connection to the database fails
        db_connection_retries:  u32,    def,    15;
        /// Enable WAL for the DB |> Only applies when using SQLite
        enable_db_wal:          bool,   def,    true;
    },
    jobs {
        /// Job scheduler poll interval |> How often the job scheduler thread checks for jobs to run.
        /// Set to 0 to globally disable scheduled jobs.
        job_poll_interval_ms:       u64,    def,    30_000;
        /// User sync schedule |> Cron schedule of the job that pulls the user catalog from the identity provider.
        user_sync_schedule:         String, def,    String::from("0 10 * * * *");
        /// Group sync schedule |> Cron schedule of the job that pulls the group catalog from the identity provider.
        group_sync_schedule:        String, def,    String::from("0 20 * * * *");
        /// Membership sync schedule |> Cron schedule of the job that diffs grants against identity provider memberships.
        membership_sync_schedule:   String, def,    String::from("0 30 * * * *");
        /// Request expiry schedule |> Cron schedule of the job that rejects stale pending access requests.
        request_expiry_schedule:    String, def,    String::from("0 40 0 * * *");
        /// Expiring access schedule |> Cron schedule of the job that notifies users and owners about expiring access.
        expiring_access_schedule:   String, def,    String::from("0 50 8 * * *");
        /// Integrity repair schedule |> Cron schedule of the job that repairs drifted role memberships and unmanaged groups.
        integrity_schedule:         String, def,    String::from("0 0 2 * * *");
    },
    /// Identity provider settings
    idp {
        /// Base URL |> Organization base URL of the identity provider, e.g. https://example.okta.com
        idp_base_url:           String, option;
        /// API token
        idp_api_token:          Pass,   option;
        /// User type |> User schema type requested during user sync
        idp_user_type:          String, def,    String::from("default");
        /// Request timeout in seconds for identity provider calls
        idp_timeout:            u64,    def,    10;
        /// Authoritative membership sync |> When true the store is authoritative and membership sync writes to the
        /// identity provider; when false the sync mirrors the identity provider into the store instead.
        sync_authoritative:     bool,   def,    true;
    },
    /// Access policy settings
    access {
        /// Group name pattern |> Regex every group name must match, checked before groups are created or requested
        name_validation_pattern:    String, def,    String::from(r"^[A-Z][A-Za-z0-9-]*$");
        /// Group name error |> Message returned when a name does not match the pattern
        name_validation_error:      String, def,    String::from("name must start with a capital letter and contain only letters, numbers and dashes");
        /// Require group descriptions
        require_group_descriptions: bool,   def,    false;
        /// Pending request TTL in days |> Pending access requests older than this are rejected by the expiry job
        access_request_ttl_days:    i64,    def,    14;
        /// Expiry notification window in days |> Grants and role associations ending within this window trigger notifications
        expiry_notification_days:   i64,    def,    14;
        /// Reason template |> A request or approval reason that exactly matches this placeholder text is treated as empty
        reason_template:            String, def,    String::new();
        /// Required reason substrings |> Comma separated fragments (e.g. a ticket URL prefix) that a reason must contain
        reason_required_substrings: String, def,    String::new();
    },
    log {
        /// Enable extended logging
        extended_logging:       bool,   def,    true;
        /// Log timestamp format
        log_timestamp_format:   String, def,    String::from("%Y-%m-%d %H:%M:%S.%3f");
        /// Enable the log to output to Syslog
        use_syslog:             bool,   def,    false;
        /// Log file path
        log_file:               String, option;
        /// Log level
        log_level:              String, def,    String::from("info");
    },
}

fn validate_config(cfg: &ConfigItems) -> Result<(), Error> {
    // Validate connection URL is valid and DB feature is enabled
    DbConnType::from_url(&cfg.database_url)?;

    if let Err(e) = Regex::new(&cfg.name_validation_pattern) {
        err!(format!("`NAME_VALIDATION_PATTERN` is not a valid regex: {e}"));
    }

    if cfg.idp_base_url.is_some() != cfg.idp_api_token.is_some() {
        err!("`IDP_BASE_URL` and `IDP_API_TOKEN` must both be set to connect an identity provider");
    }

    if let Some(ref base_url) = cfg.idp_base_url {
        if let Err(e) = url::Url::parse(base_url) {
            err!(format!("`IDP_BASE_URL` is not a valid URL: {e}"));
        }
    }

    if cfg.access_request_ttl_days <= 0 {
        err!("`ACCESS_REQUEST_TTL_DAYS` must be a positive number of days");
    }

    if cfg.expiry_notification_days <= 0 {
        err!("`EXPIRY_NOTIFICATION_DAYS` must be a positive number of days");
    }

    for (name, schedule) in [
        ("USER_SYNC_SCHEDULE", &cfg.user_sync_schedule),
        ("GROUP_SYNC_SCHEDULE", &cfg.group_sync_schedule),
        ("MEMBERSHIP_SYNC_SCHEDULE", &cfg.membership_sync_schedule),
        ("REQUEST_EXPIRY_SCHEDULE", &cfg.request_expiry_schedule),
        ("EXPIRING_ACCESS_SCHEDULE", &cfg.expiring_access_schedule),
        ("INTEGRITY_SCHEDULE", &cfg.integrity_schedule),
    ] {
        if !schedule.is_empty() && schedule.parse::<Schedule>().is_err() {
            err!(format!("`{name}` is not a valid cron expression: '{schedule}'"));
        }
    }

    Ok(())
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        // Loading from env
        let _env = ConfigBuilder::from_env();

        // Loading from the override file, if present
        let _usr = ConfigBuilder::from_file(&CONFIG_FILE).unwrap_or_default();

        // Merged config, the override file wins
        let builder = _env.merge(&_usr, true);

        let config = builder.build();
        validate_config(&config)?;

        let name_regex = Regex::new(&config.name_validation_pattern).expect("Pattern validated above");

        Ok(Config {
            inner: RwLock::new(Inner {
                name_regex,
                config,
            }),
        })
    }

    /// The compiled `name_validation_pattern`
    pub fn name_regex(&self) -> Regex {
        self.inner.read().unwrap().name_regex.clone()
    }

    /// `reason_required_substrings` split into usable fragments
    pub fn reason_required_substrings_list(&self) -> Vec<String> {
        parse_string_list(&self.reason_required_substrings())
    }

    pub fn private_logger(&self) -> bool {
        self.log_file().is_some() && !self.use_syslog()
    }
}

use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedules_parse() {
        for schedule in [
            "0 10 * * * *",
            "0 20 * * * *",
            "0 30 * * * *",
            "0 40 0 * * *",
            "0 50 8 * * *",
            "0 0 2 * * *",
        ] {
            assert!(schedule.parse::<Schedule>().is_ok(), "schedule {schedule} should parse");
        }
    }

    #[test]
    fn builder_merge_prefers_the_override_side() {
        let mut env = ConfigBuilder::default();
        env.name_validation_pattern = Some(String::from("^env$"));
        env.access_request_ttl_days = Some(7);

        let mut usr = ConfigBuilder::default();
        usr.name_validation_pattern = Some(String::from("^file$"));

        let merged = env.merge(&usr, false).build();
        assert_eq!(merged.name_validation_pattern, "^file$");
        assert_eq!(merged.access_request_ttl_days, 7);
    }
}
