use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub server_url: String,
    pub session_file: PathBuf,
    pub history_page_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            session_file: PathBuf::from("./data/session.token"),
            history_page_size: 50,
        }
    }
}

pub fn load_settings() -> ClientConfig {
    let mut settings = ClientConfig::default();

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_SESSION_FILE") {
        settings.session_file = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CHAT_HISTORY_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_page_size = parsed;
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let settings = ClientConfig::default();
        assert!(settings.server_url.starts_with("http://"));
        assert!(settings.history_page_size > 0);
    }
}
