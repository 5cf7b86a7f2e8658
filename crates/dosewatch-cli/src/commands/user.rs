//! Account commands for CLI.

use clap::Subcommand;
use dosewatch_core::Config;
use serde_json::json;

use super::{print_json, CliResult, Context};

#[derive(Subcommand)]
pub enum UserAction {
    /// Create an account and sign in
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Sign in
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Sign out
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Set a new password for an account
    ResetPassword {
        #[arg(long)]
        email: String,
        /// Password currently in use
        #[arg(long)]
        current_password: String,
        /// New password
        #[arg(long)]
        password: String,
    },
}

pub fn run(action: UserAction, config: Config) -> CliResult {
    let ctx = Context::open(config)?;
    let accounts = ctx.accounts();

    match action {
        UserAction::Register {
            name,
            email,
            password,
        } => {
            let user = accounts.register(&name, &email, &password)?;
            ctx.start_session(&user)?;
            print_json(&user)?;
        }
        UserAction::Login { email, password } => {
            let user = accounts.authenticate(&email, &password)?;
            ctx.start_session(&user)?;
            print_json(&user)?;
        }
        UserAction::Logout => {
            let was_signed_in = ctx.end_session()?;
            print_json(&json!({ "logged_out": was_signed_in }))?;
        }
        UserAction::Whoami => {
            print_json(&ctx.current_user()?)?;
        }
        UserAction::ResetPassword {
            email,
            current_password,
            password,
        } => {
            accounts.reset_password(&email, &current_password, &password)?;
            print_json(&json!({ "email": email.trim().to_lowercase(), "password_reset": true }))?;
        }
    }
    Ok(())
}
