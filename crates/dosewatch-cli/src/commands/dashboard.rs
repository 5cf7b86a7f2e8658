use dosewatch_core::Config;

use super::{print_json, CliResult, Context};

pub fn run(config: Config) -> CliResult {
    let ctx = Context::open(config)?;
    let user = ctx.current_user()?;
    let dashboard = ctx.engine()?.dashboard(&user.id)?;
    print_json(&dashboard)
}
