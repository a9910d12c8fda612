use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push channel not configured: {0}")]
    NotConfigured(&'static str),

    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push service rejected notification ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("could not build web push message: {0}")]
    Encode(String),
}

impl From<web_push::WebPushError> for PushError {
    fn from(e: web_push::WebPushError) -> Self {
        Self::Encode(e.to_string())
    }
}
