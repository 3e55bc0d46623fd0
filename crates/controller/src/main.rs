use anyhow::Result;

use kubewarden_controller::cli;
use kubewarden_controller::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli::build_cli().get_matches();
    let config = Config::from_args(&matches)?;

    kubewarden_controller::run(config).await
}
