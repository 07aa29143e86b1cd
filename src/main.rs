#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate diesel_migrations;

use std::{fs, process::exit, thread, time::Duration};

use job_scheduler_ng::{Job, JobScheduler};

#[macro_use]
pub mod error;
pub mod util;
pub mod config;
#[macro_use]
pub mod db;
pub mod hooks;
pub mod idp;
pub mod ops;
pub mod reconcile;

pub use config::CONFIG;
pub use error::{ApiResult, EmptyResult, Error, MapResult};

use crate::db::DbPool;

pub const VERSION: Option<&str> = option_env!("AW_VERSION");

#[derive(Clone, Copy, PartialEq)]
enum Command {
    Run,
    Sync,
    Expire,
    Integrity,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let command = parse_args();
    launch_info();

    init_logging();
    check_data_folder();

    let pool = create_db_pool();

    hooks::init_defaults();
    idp::init_from_config();

    match command {
        Command::Sync => {
            reconcile::run_all(pool).await?;
        }
        Command::Expire => {
            reconcile::expire::expire_requests(pool.clone()).await?;
            reconcile::expire::notify_expiring_access(pool).await?;
        }
        Command::Integrity => {
            reconcile::integrity::repair_integrity(pool).await?;
        }
        Command::Run => {
            schedule_jobs(pool.clone());

            tokio::signal::ctrl_c().await.expect("Error setting Ctrl-C handler");
            info!("Exiting accessward!");
        }
    }

    Ok(())
}

const HELP: &str = "\
Access-governance daemon keeping group grants and an identity provider convergent

USAGE:
    accessward [COMMAND | FLAGS]

COMMANDS:
    sync                 Run every reconciliation job once and exit
    expire               Run the request expiry and expiring-access jobs once and exit
    integrity            Run the integrity repair job once and exit
    backup               Create a backup of the SQLite database

FLAGS:
    -h, --help           Prints help information
    -v, --version        Prints the version
";

fn parse_args() -> Command {
    let mut pargs = pico_args::Arguments::from_env();
    let version = VERSION.unwrap_or("(Version info from Git not present)");

    if pargs.contains(["-h", "--help"]) {
        println!("accessward {version}");
        print!("{HELP}");
        exit(0);
    } else if pargs.contains(["-v", "--version"]) {
        println!("accessward {version}");
        exit(0);
    }

    if let Ok(Some(command)) = pargs.subcommand() {
        match command.as_str() {
            "sync" => return Command::Sync,
            "expire" => return Command::Expire,
            "integrity" => return Command::Integrity,
            "backup" => match db::backup_sqlite() {
                Ok(f) => {
                    println!("Backup to '{f}' was successful");
                    exit(0);
                }
                Err(e) => {
                    println!("Backup failed. {e:?}");
                    exit(1);
                }
            },
            _ => {
                println!("Invalid command: {command}");
                print!("{HELP}");
                exit(1);
            }
        }
    }

    Command::Run
}

fn launch_info() {
    println!(
        "\
/--------------------------------------------------------------------\\
|                        Starting Accessward                         |"
    );

    if let Some(version) = VERSION {
        println!("|{:^68}|", format!("Version {version}"));
    }

    println!(
        "\
|--------------------------------------------------------------------|
| This is an access-governance service for identity provider groups. |
| Grants are temporal rows; the provider mirror converges over time. |
\\--------------------------------------------------------------------/\n"
    );
}

fn init_logging() {
    let log_level = match CONFIG.log_level().to_lowercase().as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => {
            eprintln!("Invalid LOG_LEVEL, using INFO");
            log::LevelFilter::Info
        }
    };

    let mut logger = fern::Dispatch::new()
        .level(log_level)
        // Hide failed to close stream messages and other hyper/reqwest internals
        .level_for("hyper_util", log::LevelFilter::Warn)
        .level_for("reqwest::connect", log::LevelFilter::Warn)
        .level_for("rustls", log::LevelFilter::Warn)
        .chain(std::io::stdout());

    if CONFIG.extended_logging() {
        let timestamp_format = CONFIG.log_timestamp_format();
        logger = logger.format(move |out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format(&timestamp_format),
                record.target(),
                record.level(),
                message
            ))
        });
    } else {
        logger = logger.format(|out, message, _| out.finish(format_args!("{message}")));
    }

    if let Some(log_file) = CONFIG.log_file() {
        match fern::log_file(&log_file) {
            Ok(file) => {
                logger = logger.chain(file);
            }
            Err(e) => {
                eprintln!("Unable to open log file '{log_file}': {e:?}");
                exit(1);
            }
        }
    }

    #[cfg(unix)]
    if CONFIG.use_syslog() {
        let syslog_fmt = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_USER,
            hostname: None,
            process: "accessward".into(),
            pid: 0,
        };

        match syslog::unix(syslog_fmt) {
            Ok(sl) => {
                logger = logger.chain(sl);
            }
            Err(e) => {
                eprintln!("Unable to connect to syslog: {e:?}");
                exit(1);
            }
        }
    }

    if let Err(e) = logger.apply() {
        eprintln!("Failed to activate the logger: {e:#?}");
        exit(1);
    }
}

fn check_data_folder() {
    let data_folder = CONFIG.data_folder();
    if !util::file_exists(&data_folder) {
        if let Err(e) = fs::create_dir_all(&data_folder) {
            error!("Unable to create data folder '{data_folder}': {e:?}");
            exit(1);
        }
    }
}

fn create_db_pool() -> DbPool {
    match util::retry_db(DbPool::from_config, CONFIG.db_connection_retries()) {
        Ok(p) => p,
        Err(e) => {
            error!("Error creating database pool: {e:#?}");
            exit(1);
        }
    }
}

fn schedule_jobs(pool: DbPool) {
    if CONFIG.job_poll_interval_ms() == 0 {
        info!("Job scheduler disabled.");
        return;
    }

    let runtime = tokio::runtime::Runtime::new().unwrap();

    thread::Builder::new()
        .name("job-scheduler".to_string())
        .spawn(move || {
            let mut sched = JobScheduler::new();

            // Pull the user catalog from the identity provider
            if !CONFIG.user_sync_schedule().is_empty() {
                sched.add(Job::new(CONFIG.user_sync_schedule().parse().unwrap(), || {
                    runtime.spawn(run_job("user sync", reconcile::users::sync_users(pool.clone())));
                }));
            }

            // Pull the group catalog from the identity provider
            if !CONFIG.group_sync_schedule().is_empty() {
                sched.add(Job::new(CONFIG.group_sync_schedule().parse().unwrap(), || {
                    runtime.spawn(run_job("group sync", reconcile::groups::sync_groups(pool.clone())));
                }));
            }

            // Diff grants against provider memberships and ownerships
            if !CONFIG.membership_sync_schedule().is_empty() {
                sched.add(Job::new(CONFIG.membership_sync_schedule().parse().unwrap(), || {
                    runtime.spawn(run_job("membership sync", reconcile::memberships::sync_memberships(pool.clone())));
                }));
            }

            // Close out stale pending requests
            if !CONFIG.request_expiry_schedule().is_empty() {
                sched.add(Job::new(CONFIG.request_expiry_schedule().parse().unwrap(), || {
                    runtime.spawn(run_job("request expiry", reconcile::expire::expire_requests(pool.clone())));
                }));
            }

            // Warn users and owners about access about to end
            if !CONFIG.expiring_access_schedule().is_empty() {
                sched.add(Job::new(CONFIG.expiring_access_schedule().parse().unwrap(), || {
                    runtime.spawn(run_job("expiring access", reconcile::expire::notify_expiring_access(pool.clone())));
                }));
            }

            // Repair drifted role memberships and unmanaged groups
            if !CONFIG.integrity_schedule().is_empty() {
                sched.add(Job::new(CONFIG.integrity_schedule().parse().unwrap(), || {
                    runtime.spawn(run_job("integrity repair", reconcile::integrity::repair_integrity(pool.clone())));
                }));
            }

            // Periodically check for jobs to run. We probably won't need any
            // jobs (in the sense of lower poll intervals) more often than
            // once a minute.
            loop {
                sched.tick();
                runtime.block_on(tokio::time::sleep(Duration::from_millis(CONFIG.job_poll_interval_ms())));
            }
        })
        .expect("Error spawning job scheduler thread");
}

async fn run_job<F>(name: &'static str, job: F)
where
    F: std::future::Future<Output = EmptyResult> + Send,
{
    if let Err(e) = job.await {
        error!("Scheduled {name} failed: {e:#?}");
    }
}
