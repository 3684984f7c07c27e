use {
    clap::Subcommand,
    switchboard_common::{now_ms, phone::normalize_phone, types::Device},
    switchboard_config::SwitchboardConfig,
    switchboard_store::Store,
};

#[derive(Subcommand)]
pub enum DeviceAction {
    /// List registered devices and their last known status.
    List,
    /// Register a device. A running worker starts its session automatically.
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// The device's own WhatsApp number.
        #[arg(long)]
        phone: String,
        /// Number that receives handover alerts.
        #[arg(long)]
        admin: Option<String>,
    },
}

pub async fn handle_devices(
    action: DeviceAction,
    config: &SwitchboardConfig,
) -> anyhow::Result<()> {
    let store = switchboard_gateway::connect_store(&config.store).await?;
    let country_code = &config.whatsapp.default_country_code;

    match action {
        DeviceAction::List => {
            let devices = store.list_devices().await?;
            if devices.is_empty() {
                println!("No devices registered.");
            }
            for device in &devices {
                let status = store
                    .get_status(&device.id)
                    .await?
                    .map_or("unknown", |s| s.status.as_str());
                let admin = device.admin_number.as_deref().unwrap_or("-");
                println!(
                    "  {:<16} {:<24} {:<16} admin {:<16} {status}",
                    device.id, device.name, device.phone_number, admin
                );
            }
        },
        DeviceAction::Add {
            id,
            name,
            phone,
            admin,
        } => {
            let device = Device {
                id,
                name,
                phone_number: normalize_phone(&phone, country_code),
                admin_number: admin.map(|a| normalize_phone(&a, country_code)),
                created_at: now_ms(),
            };
            store.insert_device(&device).await?;
            println!("Added device '{}' ({})", device.id, device.phone_number);
        },
    }
    Ok(())
}
