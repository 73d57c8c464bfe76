use anyhow::{Context, Result};
use realtalk::{SessionConfig, SessionEvent, VoiceSession};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtalk=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => SessionConfig::default(),
    };
    if let Ok(endpoint) = std::env::var("REALTALK_ENDPOINT") {
        config.transport.endpoint = endpoint;
    }
    if config.transport.endpoint.is_empty() {
        anyhow::bail!("No endpoint configured; set [transport] endpoint or REALTALK_ENDPOINT");
    }

    info!("Starting realtalk against {}", config.transport.endpoint);

    let session = VoiceSession::builder(config)
        .command_handler(|argument: &str| -> realtalk::Result<()> {
            info!("Command received: {}", argument);
            Ok(())
        })
        .build()?;

    session.connect();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = poll.tick() => {
                while let Some(event) = session.try_recv_event() {
                    match event {
                        SessionEvent::Levels(levels) => {
                            tracing::trace!("Levels in={:.2} out={:.2}", levels.input, levels.output)
                        }
                        SessionEvent::Error(e) => warn!("{} ({})", e, e.detail()),
                        other => println!("{:?}", other),
                    }
                }
            }
        }
    }

    session.dispose();
    Ok(())
}
