use serde::Deserialize;

/// Server configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// UDP port for the coordination protocol.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Unique identifier of the TeamSpeak server, handed to clients
    /// during the handshake.
    #[serde(default)]
    pub teamspeak_server_id: String,

    /// TeamSpeak channel the clients are directed into.
    #[serde(default)]
    pub teamspeak_channel_id: u64,

    /// Password of that channel (empty = none).
    #[serde(default)]
    pub teamspeak_channel_password: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    23332
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            teamspeak_server_id: String::new(),
            teamspeak_channel_id: 0,
            teamspeak_channel_password: String::new(),
        }
    }
}
