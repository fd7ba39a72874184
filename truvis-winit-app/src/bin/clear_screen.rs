use std::path::PathBuf;

use truvis_rhi::config::GfxConfig;
use truvis_winit_app::app::WinitApp;

fn main() -> anyhow::Result<()> {
    WinitApp::init_env();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("gfx.toml"));
    let config = if config_path.exists() {
        GfxConfig::from_file(&config_path)?
    } else {
        log::warn!("{} not found, using default gfx config", config_path.display());
        GfxConfig::default()
    };

    WinitApp::run(config)
}
