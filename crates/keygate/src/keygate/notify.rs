use std::sync::Arc;

/// Sink for player presence changes. Called exactly once at the start and
/// end of every successful login splice; the announcement surface (chat
/// bot, status page) lives behind this interface.
pub trait PlayerNotifier: Send + Sync {
    fn player_connected(&self, name: &str);
    fn player_disconnected(&self, name: &str);
}

pub type SharedNotifier = Arc<dyn PlayerNotifier>;

/// Default sink: structured log lines only.
pub struct LogNotifier;

impl PlayerNotifier for LogNotifier {
    fn player_connected(&self, name: &str) {
        tracing::info!(player = %name, "presence: player joined");
    }

    fn player_disconnected(&self, name: &str) {
        tracing::info!(player = %name, "presence: player left");
    }
}
