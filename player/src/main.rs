use std::net::SocketAddr;

use clap::Parser;

use common_sync::telemetry;
use player::{BoxError, PlayerConfig, PlayerSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Synchronized watch-party playback participant")]
struct PlayerCli {
    #[arg(long, value_name = "URL")]
    server: Option<String>,

    #[arg(long, value_name = "CODE")]
    room: Option<String>,

    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    #[arg(long, value_name = "ID")]
    media: Option<String>,

    #[arg(long, value_name = "TITLE")]
    title: Option<String>,

    #[arg(long, value_name = "ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl PlayerCli {
    fn apply_overrides(&self, settings: &mut PlayerSettings) {
        if let Some(url) = &self.server {
            settings.server_url = url.clone();
        }
        if let Some(room) = &self.room {
            settings.room_id = room.clone();
        }
        if let Some(name) = &self.name {
            settings.display_name = name.clone();
        }
        if let Some(media) = &self.media {
            settings.media_id = Some(media.clone());
        }
        if let Some(title) = &self.title {
            settings.media_title = Some(title.clone());
        }
        if let Some(addr) = self.metrics_addr {
            settings.metrics_addr = addr;
        }
    }
}

fn build_config(cli: &PlayerCli) -> Result<PlayerConfig, BoxError> {
    let mut settings = PlayerSettings::from_env()?;
    cli.apply_overrides(&mut settings);
    Ok(settings.into_config())
}

#[tokio::main]
async fn main() {
    telemetry::init("player");

    let cli = PlayerCli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "player: invalid configuration");
            return;
        }
    };

    if let Err(err) = player::run_with_ctrl_c(config).await {
        tracing::error!(%err, "player exited with error");
    }
}
