use log::{error, info};

use universe::{config::SimulationConfig, UniverseApp};

fn run() -> anyhow::Result<()> {
    let config = SimulationConfig::from_env()?;
    info!(
        "Starting {} with {} particles",
        config.title, config.particle_count
    );
    UniverseApp::new(config)?.run()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        error!("Universe terminated: {err:#}");
        std::process::exit(1);
    }
}
