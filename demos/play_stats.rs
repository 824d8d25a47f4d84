//! Play a remote stream and log what arrives
//!
//! Run with: cargo run --example play_stats <URL>
//!
//! Examples:
//!   cargo run --example play_stats rtmp://localhost/live/test
//!   RUST_LOG=castline=trace cargo run --example play_stats rtmp://localhost/live/test
//!
//! Start a source first, e.g.:
//!   ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use castline::client::parse_url;
use castline::session::{Format, Media};
use castline::{ClientConfig, Connection, ReadyState, Reconnector, Session, SessionObserver};

#[derive(Default)]
struct MediaCounter {
    video: AtomicU64,
    audio: AtomicU64,
}

impl SessionObserver for MediaCounter {
    fn ready_state_changed(&self, state: ReadyState) {
        tracing::info!(%state, "Ready state changed");
    }

    fn media_received(&self, media: &Media) {
        match media {
            Media::Video(_) => self.video.fetch_add(1, Ordering::Relaxed),
            Media::Audio(..) => self.audio.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn format_changed(&self, format: &Format) {
        tracing::info!(?format, "Format changed");
    }

    fn ready(&self) {
        tracing::info!("All expected media received");
    }

    fn error_occurred(&self, error: &castline::Error) {
        tracing::warn!(%error, "Session error");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Some(url) = std::env::args().nth(1) else {
        eprintln!("Usage: play_stats <URL>");
        std::process::exit(1);
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("castline=debug".parse()?)
                .add_directive("play_stats=debug".parse()?),
        )
        .init();

    let parsed = parse_url(&url)?;
    let stream_name = parsed.stream_key.unwrap_or_default();

    let connection = Connection::new(ClientConfig::new(url.clone()));
    let session = Session::new(&connection).await;
    let counter = Arc::new(MediaCounter::default());
    let observer: Arc<dyn SessionObserver> = counter.clone();
    session.add_observer(Arc::downgrade(&observer));
    session.play(Some(stream_name.as_str()));

    let reconnect = Reconnector::new(connection.clone()).spawn(url);
    let mut ticker = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = session.stats();
                println!(
                    "video={} audio={} in={}B bitrate={}bps",
                    counter.video.load(Ordering::Relaxed),
                    counter.audio.load(Ordering::Relaxed),
                    stats.bytes_received,
                    stats.bitrate,
                );
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down");
                break;
            }
        }
    }

    session.close();
    session.flush().await;
    reconnect.stop().await?;
    Ok(())
}
