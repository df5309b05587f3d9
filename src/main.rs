use anyhow::{Context, Result};
use puppet_config::AppConfig;
use puppet_imu::{
    Broadcaster, ChannelSink, FilterConfig, FrameSink, LinkSettings, OrientationFilter,
    SensorLink, SerialTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn link_settings(config: &AppConfig) -> LinkSettings {
    let sensor = &config.sensor;
    LinkSettings {
        read_timeout: Duration::from_millis(sensor.read_timeout_ms),
        mag_poll_attempts: sensor.mag_poll_attempts,
        mag_poll_interval: Duration::from_micros(sensor.mag_poll_interval_us),
        mag_ready_timeout: Duration::from_millis(sensor.mag_ready_timeout_ms),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "puppet=info,puppet_imu=info,puppet_config=info".into()),
        )
        .init();

    info!("Puppet orientation service starting");

    let config = puppet_config::load_config().unwrap_or_else(|e| {
        warn!(?e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Without a sensor there is nothing to serve.
    let transport = SerialTransport::open(&config.sensor.port, config.sensor.baud_rate)
        .context("Connecting to sensor")?;
    let link = SensorLink::connect(transport, link_settings(&config))
        .context("Initializing sensor")?;
    let disconnect = link.disconnect_handle();

    let filter = OrientationFilter::new(FilterConfig::new(
        config.filter.beta,
        config.filter.sample_freq_hz,
    )?);
    let mut broadcaster = Broadcaster::spawn(link, filter)?;

    // Log the stream in its wire form; remote transports subscribe the same way.
    let (sink, mut frames) = ChannelSink::new(config.broadcast.subscriber_queue);
    let log_sink: Arc<dyn FrameSink> = sink;
    broadcaster.subscribe(&log_sink);
    let logger = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match serde_json::to_string(&*frame) {
                Ok(json) => tracing::debug!(%json, "motion"),
                Err(e) => warn!(?e, "Failed to encode frame"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    disconnect.disconnect();
    broadcaster.unsubscribe(&log_sink);
    drop(log_sink);
    let broadcaster = tokio::task::spawn_blocking(move || {
        broadcaster.stop();
        broadcaster
    })
    .await?;
    logger.await?;

    if let Some(frame) = broadcaster.last_frame() {
        info!(%frame, "Final orientation");
    }
    Ok(())
}
