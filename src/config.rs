use crate::{
    protocol::{SERVER_NAME, transport::MAX_FRAME_SIZE},
    settings::Settings,
};

/// Server-wide configuration, shared read-only by every connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name advertised in the server Hello.
    pub name: String,
    /// Connection worker threads; also the maximum number of concurrent connections.
    pub workers: usize,
    pub max_frame_size: usize,
    /// Defaults each connection starts from. Queries override them per query.
    pub default_settings: Settings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            workers: 16,
            max_frame_size: MAX_FRAME_SIZE,
            default_settings: Settings::default(),
        }
    }
}
