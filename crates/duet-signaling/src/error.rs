/// Signaling-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Dial timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Dial failed: {0}")]
    Dial(String),
}
