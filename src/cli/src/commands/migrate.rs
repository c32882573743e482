//! Apply the embedded database migrations.

use anyhow::Result;

use crate::context::Context;
use crate::output;

pub async fn execute(ctx: &Context) -> Result<()> {
    let store = ctx.store().await?;
    store.migrate().await?;
    output::print_success("Migrations applied");
    Ok(())
}
