pub mod calibration;
pub mod context;
pub mod input;
pub mod navigation;
pub mod pipeline;
pub mod skills;
pub mod status;
pub mod telemetry;

pub use pipeline::Runtime;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bsbot=debug,bs_capture=info,bs_vision=info,bs_world=info".into()
            }),
        )
        .init();
}
