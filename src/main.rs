pub mod app;
pub mod renderer;

use app::App;
use color_eyre::Result;
use renderer::config::RenderConfig;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let config = RenderConfig::from_env()?;
    App::new(config).run()
}
