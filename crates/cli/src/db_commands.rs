use {clap::Subcommand, switchboard_config::SwitchboardConfig};

#[derive(Subcommand)]
pub enum DbAction {
    /// Run all pending database migrations.
    Migrate,
}

pub async fn handle_db(action: DbAction, config: &SwitchboardConfig) -> anyhow::Result<()> {
    match action {
        DbAction::Migrate => {
            // Connecting runs the migrations.
            switchboard_gateway::connect_store(&config.store).await?;
            println!("Migrations applied to {}", config.store.database_url);
            Ok(())
        },
    }
}
