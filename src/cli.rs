use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use serde::Serialize;

use crate::db::{MongoEngine, resolve_url};
use crate::errors::ProvisionError;
use crate::models::{Password, ProvisionPlan, UserOutcome};
use crate::provision::{ExistingUserPolicy, Provisioner};
use crate::verify::{status, verify};

/// Environment variable read for the application password when
/// `--password` is absent, keeping it out of argv.
pub const PASSWORD_ENV: &str = "PROVISION_PASSWORD";

fn json_flag() -> Arg {
    Arg::new("json")
        .long("json")
        .help("Print the report as JSON")
        .action(ArgAction::SetTrue)
}

pub fn cli() -> Command {
    Command::new("aicoding-provision")
        .about("Bootstrap the AI coding platform database: application user and indexes")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("url")
                .long("url")
                .global(true)
                .help("MongoDB connection string (defaults to DATABASE_URL, then MONGODB_URL)")
                .value_name("URI"),
        )
        .arg(
            Arg::new("plan-file")
                .long("plan")
                .global(true)
                .help("JSON plan file replacing the built-in plan")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("database")
                .long("database")
                .global(true)
                .help("Target database, role scopes follow it")
                .value_name("NAME"),
        )
        .arg(
            Arg::new("username")
                .long("username")
                .global(true)
                .help("Application username")
                .value_name("USER"),
        )
        .arg(
            Arg::new("password")
                .long("password")
                .global(true)
                .help("Application password")
                .value_name("PASSWORD")
                .env(PASSWORD_ENV)
                .hide_env_values(true),
        )
        .arg(
            Arg::new("connect-timeout")
                .long("connect-timeout")
                .global(true)
                .help("Seconds to wait for the server before giving up")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .default_value("10"),
        )
        .subcommand(
            Command::new("provision")
                .about("Create the application user and the declared indexes")
                .arg(
                    Arg::new("skip-existing-user")
                        .long("skip-existing-user")
                        .help("Leave an existing user untouched instead of failing")
                        .action(ArgAction::SetTrue),
                )
                .arg(json_flag()),
        )
        .subcommand(
            Command::new("verify")
                .about("Check that the user and indexes exist as declared")
                .arg(
                    Arg::new("strict")
                        .long("strict")
                        .help("Also fail on indexes the plan does not declare")
                        .action(ArgAction::SetTrue),
                )
                .arg(json_flag()),
        )
        .subcommand(
            Command::new("status")
                .about("Check connectivity and count documents in the planned collections")
                .arg(json_flag()),
        )
        .subcommand(
            Command::new("plan").about("Print the resolved plan with the password redacted"),
        )
}

pub async fn handle_cli() -> Result<ExitCode, ProvisionError> {
    let matches = cli().get_matches();

    let Some((name, sub_matches)) = matches.subcommand() else {
        cli().print_help()?;
        return Ok(ExitCode::SUCCESS);
    };

    let plan = resolve_plan(sub_matches)?;

    if name == "plan" {
        print_json(&plan)?;
        return Ok(ExitCode::SUCCESS);
    }

    let engine = create_engine(sub_matches).await?;
    let json = sub_matches.get_flag("json");

    match name {
        "provision" => {
            let policy = if sub_matches.get_flag("skip-existing-user") {
                ExistingUserPolicy::Skip
            } else {
                ExistingUserPolicy::Fail
            };

            let report = Provisioner::new(engine)
                .with_policy(policy)
                .run(&plan)
                .await?;

            if json {
                print_json(&report)?;
            } else {
                let outcome = match report.user_outcome {
                    UserOutcome::Created => "created",
                    UserOutcome::AlreadyExisted => "already existed",
                };
                println!("Provisioning complete!");
                println!("Run: {}", report.run_id);
                println!("Database: {}", report.database);
                println!("User: {} ({})", report.user, outcome);
                println!("Indexes: {}", report.indexes.join(", "));
            }

            Ok(ExitCode::SUCCESS)
        }
        "verify" => {
            let report = verify(&engine, &plan, sub_matches.get_flag("strict")).await?;

            if json {
                print_json(&report)?;
            } else {
                println!("Database: {}", report.database);
                println!(
                    "User: {} (exists: {}, roles match: {})",
                    report.user, report.user_exists, report.roles_match
                );
                println!("Indexes present: {}", report.indexes_present.join(", "));
                if !report.missing.is_empty() {
                    println!("Missing: {}", report.missing.join(", "));
                }
                if !report.unexpected.is_empty() {
                    println!("Unexpected: {}", report.unexpected.join(", "));
                }
            }

            Ok(exit_code(report.is_satisfied()))
        }
        "status" => {
            let report = status(&engine, &plan).await?;

            if json {
                print_json(&report)?;
            } else {
                println!("Connected: {}", report.connected);
                if let Some(error) = &report.error {
                    println!("Error: {error}");
                }
                for count in &report.collections {
                    println!(
                        "{}.{}: {} documents",
                        report.database, count.collection, count.documents
                    );
                }
            }

            Ok(exit_code(report.connected))
        }
        _ => {
            cli().print_help()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Built-in plan or `--plan` file, with the identity flags applied on top.
/// Takes the subcommand's matches, which carry the global flags.
fn resolve_plan(matches: &ArgMatches) -> Result<ProvisionPlan, ProvisionError> {
    let mut plan = match matches.get_one::<PathBuf>("plan-file") {
        Some(path) => ProvisionPlan::from_file(path)?,
        None => ProvisionPlan::default(),
    };

    if let Some(database) = matches.get_one::<String>("database") {
        plan.retarget(database);
    }

    if let Some(username) = matches.get_one::<String>("username") {
        plan.user.user = username.clone();
    }

    if let Some(password) = matches.get_one::<String>("password") {
        plan.user.pwd = Password::new(password.as_str());
    }

    plan.validate()?;

    Ok(plan)
}

async fn create_engine(matches: &ArgMatches) -> Result<MongoEngine, ProvisionError> {
    let url = resolve_url(matches.get_one::<String>("url").map(String::as_str));
    let timeout = matches
        .get_one::<u64>("connect-timeout")
        .copied()
        .unwrap_or(10);

    MongoEngine::connect(&url, Duration::from_secs(timeout)).await
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ProvisionError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
