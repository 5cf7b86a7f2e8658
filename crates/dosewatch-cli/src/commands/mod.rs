pub mod config;
pub mod dashboard;
pub mod remind;
pub mod routine;
pub mod user;

use std::sync::Arc;

use dosewatch_core::storage::data_dir;
use dosewatch_core::{
    AccountService, Config, Database, FsAttachmentStore, ScheduleEngine, SystemClock, User,
};
use serde::Serialize;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Key-value entry holding the signed-in user's id.
const SESSION_KEY: &str = "session.user_id";

/// Handles shared by the commands that touch the database.
pub struct Context {
    pub config: Config,
    pub db: Arc<Database>,
    clock: Arc<SystemClock>,
}

impl Context {
    pub fn open(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            config,
            db: Arc::new(Database::open()?),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn engine(&self) -> Result<ScheduleEngine, Box<dyn std::error::Error>> {
        let attachments = FsAttachmentStore::new(
            data_dir()?.join("attachments"),
            self.config.attachments.max_bytes,
        )?;
        Ok(ScheduleEngine::new(
            self.db.clone(),
            self.clock.clone(),
            self.config.schedule_rules(),
        )
        .with_attachments(Arc::new(attachments)))
    }

    pub fn accounts(&self) -> AccountService {
        AccountService::new(
            self.db.clone(),
            self.clock.clone(),
            self.config.accounts.pbkdf2_iterations,
        )
    }

    /// The signed-in user, or an error telling the caller to log in.
    pub fn current_user(&self) -> Result<User, Box<dyn std::error::Error>> {
        let Some(user_id) = self.db.kv_get(SESSION_KEY)? else {
            return Err("not logged in (run `dosewatch user login`)".into());
        };
        match self.accounts().get_user(&user_id) {
            Ok(user) => Ok(user),
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "dropping stale session");
                self.db.kv_delete(SESSION_KEY)?;
                Err("session expired (run `dosewatch user login`)".into())
            }
        }
    }

    pub fn start_session(&self, user: &User) -> CliResult {
        self.db.kv_set(SESSION_KEY, &user.id)?;
        Ok(())
    }

    pub fn end_session(&self) -> Result<bool, Box<dyn std::error::Error>> {
        let was_signed_in = self.db.kv_get(SESSION_KEY)?.is_some();
        self.db.kv_delete(SESSION_KEY)?;
        Ok(was_signed_in)
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
